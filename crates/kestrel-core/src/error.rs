//! Error types for Kestrel
//!
//! Every failure the engine, the providers and the historian can produce is
//! a variant of [`Error`]. Callers that need to branch on the failure class
//! (HTTP status mapping, retry decisions) should use [`Error::kind`], which
//! sees through the request context wrapper added by the engine.

use crate::types::Value;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors that can occur in Kestrel
#[derive(Error, Debug)]
pub enum Error {
    /// The selector does not match the FQN grammar
    #[error("invalid FQN '{0}'")]
    InvalidFqn(String),

    /// No feature is bound under this FQN
    #[error("feature '{0}' not found")]
    FeatureNotFound(String),

    /// Bind was called for an FQN that is already bound and updates are not allowed
    #[error("feature '{0}' already exists")]
    FeatureAlreadyExists(String),

    /// The descriptor failed validation at bind time
    #[error("invalid feature '{fqn}': {reason}")]
    InvalidFeature { fqn: String, reason: String },

    /// A value or a primitive name that the type system does not recognize
    #[error("unsupported primitive: {0}")]
    UnsupportedPrimitive(String),

    /// An aggregation function name that is not recognized
    #[error("unsupported aggregation function: {0}")]
    UnsupportedAggregator(String),

    /// The write timestamp is older than the feature's staleness
    #[error("timestamp {ts} is too old (staleness {staleness:?})")]
    StaleWrite {
        ts: DateTime<Utc>,
        staleness: Duration,
    },

    /// The written value does not match the feature's primitive
    #[error("value mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    /// The operation is not valid for this kind of feature (e.g. Append on a scalar)
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The state provider could not be reached or failed
    #[error("state unavailable: {0}")]
    StateUnavailable(String),

    /// The notifier could not publish or subscribe
    #[error("notifier unavailable: {0}")]
    NotifierUnavailable(String),

    /// The historical writer failed to commit or flush
    #[error("historical writer unavailable: {0}")]
    WriterUnavailable(String),

    /// The request deadline fired before the pipeline finished
    ///
    /// Carries the most recent value any middleware emitted, if one was.
    #[error("deadline exceeded")]
    DeadlineExceeded { partial: Option<Box<Value>> },

    /// The request was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,

    /// A middleware required request context that was not present
    #[error("invalid pipeline context: {0}")]
    InvalidPipelineContext(String),

    /// An engine operation failed; wraps the cause with the feature and entity
    #[error("failed to {op} feature {fqn} for entity {entity_id}: {source}")]
    Pipeline {
        op: &'static str,
        fqn: String,
        entity_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file, flag or environment issues
    #[error("configuration error: {0}")]
    Config(String),

    /// Used for unexpected errors that indicate a bug
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidFqn,
    FeatureNotFound,
    FeatureAlreadyExists,
    InvalidFeature,
    UnsupportedPrimitive,
    UnsupportedAggregator,
    StaleWrite,
    TypeMismatch,
    UnsupportedOperation,
    StateUnavailable,
    NotifierUnavailable,
    WriterUnavailable,
    DeadlineExceeded,
    Cancelled,
    InvalidPipelineContext,
    Serialization,
    Config,
    Internal,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wraps any displayable error as a state failure
    pub fn state<E: std::fmt::Display>(err: E) -> Self {
        Self::StateUnavailable(err.to_string())
    }

    pub fn notifier<E: std::fmt::Display>(err: E) -> Self {
        Self::NotifierUnavailable(err.to_string())
    }

    pub fn writer<E: std::fmt::Display>(err: E) -> Self {
        Self::WriterUnavailable(err.to_string())
    }

    pub fn invalid_feature(fqn: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFeature {
            fqn: fqn.into(),
            reason: reason.into(),
        }
    }

    pub fn type_mismatch(expected: impl ToString, got: impl ToString) -> Self {
        Self::TypeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// Adds feature and entity context to an engine error
    pub fn in_pipeline(self, op: &'static str, fqn: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::Pipeline {
            op,
            fqn: fqn.into(),
            entity_id: entity_id.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any pipeline context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Self::Pipeline { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::InvalidFqn(_) => ErrorKind::InvalidFqn,
            Self::FeatureNotFound(_) => ErrorKind::FeatureNotFound,
            Self::FeatureAlreadyExists(_) => ErrorKind::FeatureAlreadyExists,
            Self::InvalidFeature { .. } => ErrorKind::InvalidFeature,
            Self::UnsupportedPrimitive(_) => ErrorKind::UnsupportedPrimitive,
            Self::UnsupportedAggregator(_) => ErrorKind::UnsupportedAggregator,
            Self::StaleWrite { .. } => ErrorKind::StaleWrite,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Self::StateUnavailable(_) => ErrorKind::StateUnavailable,
            Self::NotifierUnavailable(_) => ErrorKind::NotifierUnavailable,
            Self::WriterUnavailable(_) => ErrorKind::WriterUnavailable,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidPipelineContext(_) => ErrorKind::InvalidPipelineContext,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) | Self::Pipeline { .. } => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StateUnavailable | ErrorKind::NotifierUnavailable | ErrorKind::WriterUnavailable
        )
    }

    /// The best-effort value carried by a deadline error
    pub fn partial_value(&self) -> Option<&Value> {
        match self.root() {
            Self::DeadlineExceeded { partial } => partial.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::FeatureNotFound("ns.a".to_string());
        assert_eq!(err.to_string(), "feature 'ns.a' not found");
    }

    #[test]
    fn test_kind_sees_through_pipeline_context() {
        let err = Error::type_mismatch("string", "int").in_pipeline("set", "ns.a", "e1");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(err.to_string().contains("failed to set feature ns.a for entity e1"));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(Error::state("connection refused").is_retryable());
        assert!(Error::notifier("no subscriber").is_retryable());
        assert!(Error::writer("disk full").in_pipeline("commit", "ns.a", "e1").is_retryable());
        assert!(!Error::InvalidFqn("x".into()).is_retryable());
        assert!(!Error::DeadlineExceeded { partial: None }.is_retryable());
    }

    #[test]
    fn test_partial_value_is_reachable_through_wrapper() {
        use crate::types::{Payload, Scalar};

        let partial = Value::new(Payload::Scalar(Scalar::Int(7)), Utc::now());
        let err = Error::DeadlineExceeded {
            partial: Some(Box::new(partial.clone())),
        }
        .in_pipeline("get", "ns.a", "e1");

        assert_eq!(err.partial_value(), Some(&partial));
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
