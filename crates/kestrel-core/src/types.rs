//! Core data types for Kestrel
//!
//! ## Value model
//!
//! ```text
//! Value ── payload ──┬── Scalar(String | Int | Float | Bool | Timestamp)
//!          timestamp ├── List(Vec<Scalar>)
//!          fresh     ├── Window(WindowResultMap)      aggregator → f64
//!                    └── Set(BTreeMap<FQN, Value>)     feature-set fan-out
//! ```
//!
//! Writes are validated by matching the payload shape against the feature's
//! [`Primitive`]; the state layer stores scalars as strings through
//! [`scalar_string`] / [`scalar_from_string`].

use crate::error::{Error, Result};
use crate::fqn::parse_selector;
use crate::window::duration_str;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Type of a feature's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Primitive {
    String,
    Int,
    Float,
    Timestamp,
    StringList,
    IntList,
    FloatList,
    TimestampList,
    /// Computed on read only, never stored
    Headless,
}

impl Primitive {
    pub fn is_scalar(self) -> bool {
        !self.is_list()
    }

    pub fn is_list(self) -> bool {
        matches!(
            self,
            Self::StringList | Self::IntList | Self::FloatList | Self::TimestampList
        )
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }

    /// The element type of a list primitive; scalars map to themselves
    pub fn singular(self) -> Self {
        match self {
            Self::StringList => Self::String,
            Self::IntList => Self::Int,
            Self::FloatList => Self::Float,
            Self::TimestampList => Self::Timestamp,
            other => other,
        }
    }

    /// The list form of a scalar primitive; lists and headless map to themselves
    pub fn plural(self) -> Self {
        match self {
            Self::String => Self::StringList,
            Self::Int => Self::IntList,
            Self::Float => Self::FloatList,
            Self::Timestamp => Self::TimestampList,
            other => other,
        }
    }
}

impl FromStr for Primitive {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "string" | "text" => Ok(Self::String),
            "time" | "datetime" | "timestamp" => Ok(Self::Timestamp),
            "int" | "integer" | "int32" | "int64" => Ok(Self::Int),
            "float" | "double" | "float32" | "float64" => Ok(Self::Float),
            "[]string" | "[]text" => Ok(Self::StringList),
            "[]int" | "[]integer" | "[]int32" | "[]int64" => Ok(Self::IntList),
            "[]float" | "[]double" | "[]float32" | "[]float64" => Ok(Self::FloatList),
            "[]time" | "[]datetime" | "[]timestamp" => Ok(Self::TimestampList),
            "headless" => Ok(Self::Headless),
            other => Err(Error::UnsupportedPrimitive(other.to_string())),
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Timestamp => "timestamp",
            Self::StringList => "[]string",
            Self::IntList => "[]int",
            Self::FloatList => "[]float",
            Self::TimestampList => "[]timestamp",
            Self::Headless => "headless",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for Primitive {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Primitive> for String {
    fn from(p: Primitive) -> Self {
        p.to_string()
    }
}

/// Window aggregation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggrFn {
    Sum,
    Avg,
    Max,
    Min,
    Count,
}

impl FromStr for AggrFn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" | "mean" => Ok(Self::Avg),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "count" => Ok(Self::Count),
            other => Err(Error::UnsupportedAggregator(other.to_string())),
        }
    }
}

impl fmt::Display for AggrFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::Count => "count",
        };
        f.write_str(s)
    }
}

/// Result of a window aggregation: aggregator → value
pub type WindowResultMap = BTreeMap<AggrFn, f64>;

/// A single typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl Scalar {
    /// The primitive this scalar belongs to; `Bool` has none
    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            Self::String(_) => Some(Primitive::String),
            Self::Int(_) => Some(Primitive::Int),
            Self::Float(_) => Some(Primitive::Float),
            Self::Timestamp(_) => Some(Primitive::Timestamp),
            Self::Bool(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

/// The content of a [`Value`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Scalar(Scalar),
    List(Vec<Scalar>),
    Window(WindowResultMap),
    Set(BTreeMap<String, Value>),
}

impl Payload {
    /// Detects the primitive of a runtime value
    ///
    /// Lists must be non-empty and homogeneous. Window and set payloads are
    /// engine outputs, not writable values, and are rejected.
    pub fn detect_primitive(&self) -> Result<Primitive> {
        match self {
            Self::Scalar(s) => s
                .primitive()
                .ok_or_else(|| Error::UnsupportedPrimitive(s.type_name().to_string())),
            Self::List(items) => {
                let first = items
                    .first()
                    .ok_or_else(|| Error::UnsupportedPrimitive("empty list".to_string()))?;
                let p = first
                    .primitive()
                    .ok_or_else(|| Error::UnsupportedPrimitive(format!("[]{}", first.type_name())))?;
                if items.iter().any(|i| i.primitive() != Some(p)) {
                    return Err(Error::UnsupportedPrimitive("mixed list".to_string()));
                }
                Ok(p.plural())
            }
            Self::Window(_) => Err(Error::UnsupportedPrimitive("window result".to_string())),
            Self::Set(_) => Err(Error::UnsupportedPrimitive("feature set".to_string())),
        }
    }

    /// Checks that this payload can be written to a feature of primitive `p`
    ///
    /// An empty list conforms to every list primitive.
    pub fn conforms_to(&self, p: Primitive) -> Result<()> {
        if let Self::List(items) = self {
            if items.is_empty() && p.is_list() {
                return Ok(());
            }
        }
        let detected = self.detect_primitive()?;
        if detected != p {
            return Err(Error::type_mismatch(p, detected));
        }
        Ok(())
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_window(&self) -> Option<&WindowResultMap> {
        match self {
            Self::Window(w) => Some(w),
            _ => None,
        }
    }

    /// Numeric view of a scalar payload, used by increments and window adds
    pub fn as_f64(&self) -> Option<f64> {
        self.as_scalar().and_then(Scalar::as_f64)
    }
}

impl From<Scalar> for Payload {
    fn from(s: Scalar) -> Self {
        Self::Scalar(s)
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Self::Scalar(Scalar::Int(v))
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Self::Scalar(Scalar::Float(v))
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Self::Scalar(Scalar::String(v.to_string()))
    }
}

impl Payload {
    /// Reads a JSON value as a payload of primitive `p`
    ///
    /// Timestamps are RFC 3339 strings or integer microseconds since epoch.
    /// Integral floats are accepted for `Int`, integers for `Float`.
    pub fn from_json(json: &serde_json::Value, p: Primitive) -> Result<Self> {
        if p.is_list() {
            let items = json
                .as_array()
                .ok_or_else(|| Error::type_mismatch(p, json_type(json)))?;
            let singular = p.singular();
            return items
                .iter()
                .map(|i| scalar_from_json(i, singular))
                .collect::<Result<Vec<_>>>()
                .map(Self::List);
        }
        if p == Primitive::Headless {
            return Self::detect_json(json);
        }
        scalar_from_json(json, p).map(Self::Scalar)
    }

    /// Reads a JSON value without a target primitive
    pub fn detect_json(json: &serde_json::Value) -> Result<Self> {
        match json {
            serde_json::Value::Array(items) => items
                .iter()
                .map(detect_scalar_json)
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            other => detect_scalar_json(other).map(Self::Scalar),
        }
    }

    /// Plain JSON rendering, used by the HTTP surface
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Scalar(s) => scalar_to_json(s),
            Self::List(items) => serde_json::Value::Array(items.iter().map(scalar_to_json).collect()),
            Self::Window(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(fn_, v)| (fn_.to_string(), serde_json::json!(v)))
                    .collect(),
            ),
            Self::Set(members) => serde_json::Value::Object(
                members
                    .iter()
                    .map(|(fqn, v)| {
                        let entry = serde_json::json!({
                            "value": v.payload.to_json(),
                            "timestamp": v.timestamp,
                            "fresh": v.fresh,
                        });
                        (fqn.clone(), entry)
                    })
                    .collect(),
            ),
        }
    }
}

fn json_type(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "object",
    }
}

fn scalar_from_json(json: &serde_json::Value, p: Primitive) -> Result<Scalar> {
    let mismatch = || Error::type_mismatch(p, json_type(json));
    match (p, json) {
        (Primitive::String, serde_json::Value::String(s)) => Ok(Scalar::String(s.clone())),
        (Primitive::Int, serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Scalar::Int(i)),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| Scalar::Int(f as i64))
                .ok_or_else(mismatch),
        },
        (Primitive::Float, serde_json::Value::Number(n)) => n.as_f64().map(Scalar::Float).ok_or_else(mismatch),
        (Primitive::Timestamp, serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|ts| Scalar::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|e| Error::type_mismatch(p, format!("'{}' ({})", s, e))),
        (Primitive::Timestamp, serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_micros)
            .map(Scalar::Timestamp)
            .ok_or_else(mismatch),
        _ => Err(mismatch()),
    }
}

fn detect_scalar_json(json: &serde_json::Value) -> Result<Scalar> {
    match json {
        serde_json::Value::String(s) => Ok(Scalar::String(s.clone())),
        serde_json::Value::Bool(b) => Ok(Scalar::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Scalar::Int(i)),
            None => n
                .as_f64()
                .map(Scalar::Float)
                .ok_or_else(|| Error::UnsupportedPrimitive(n.to_string())),
        },
        other => Err(Error::UnsupportedPrimitive(json_type(other).to_string())),
    }
}

fn scalar_to_json(s: &Scalar) -> serde_json::Value {
    match s {
        Scalar::String(v) => serde_json::json!(v),
        Scalar::Int(v) => serde_json::json!(v),
        Scalar::Float(v) => serde_json::json!(v),
        Scalar::Bool(v) => serde_json::json!(v),
        Scalar::Timestamp(v) => serde_json::json!(v.to_rfc3339()),
    }
}

/// A feature value with its observation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// True only when a source produced the value within this request
    #[serde(default)]
    pub fresh: bool,
}

impl Value {
    pub fn new(payload: impl Into<Payload>, timestamp: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
            fresh: false,
        }
    }

    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }
}

/// Serializes a scalar for the state layer; timestamps become microseconds since epoch
pub fn scalar_string(v: &Scalar) -> String {
    match v {
        Scalar::String(s) => s.clone(),
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
        Scalar::Timestamp(ts) => ts.timestamp_micros().to_string(),
    }
}

/// Inverse of [`scalar_string`] for a scalar primitive
pub fn scalar_from_string(s: &str, p: Primitive) -> Result<Scalar> {
    let parse_err = |e: &dyn fmt::Display| Error::internal(format!("cannot decode '{}' as {}: {}", s, p, e));
    match p {
        Primitive::String => Ok(Scalar::String(s.to_string())),
        Primitive::Int => s.parse().map(Scalar::Int).map_err(|e| parse_err(&e)),
        Primitive::Float => s.parse().map(Scalar::Float).map_err(|e| parse_err(&e)),
        Primitive::Timestamp => {
            let micros: i64 = s.parse().map_err(|e| parse_err(&e))?;
            DateTime::from_timestamp_micros(micros)
                .map(Scalar::Timestamp)
                .ok_or_else(|| parse_err(&"timestamp out of range"))
        }
        other => Err(Error::UnsupportedPrimitive(format!("{} is not a scalar type", other))),
    }
}

fn default_builder() -> String {
    "streaming".to_string()
}

/// Immutable description of a bound feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub fqn: String,
    pub primitive: Primitive,
    #[serde(default)]
    pub aggr: Vec<AggrFn>,
    /// Maximum age of a fresh value; the bucket width for windowed features
    #[serde(default, with = "duration_str")]
    pub freshness: Duration,
    /// Maximum age of a returnable value; older writes are rejected
    #[serde(default, with = "duration_str")]
    pub staleness: Duration,
    /// Per-request budget, zero means unbounded
    #[serde(default, with = "duration_str")]
    pub timeout: Duration,
    #[serde(default = "default_builder")]
    pub builder: String,
    /// Builder-specific configuration, interpreted by the builder factory
    #[serde(default)]
    pub builder_spec: serde_json::Value,
    #[serde(default)]
    pub data_source: String,
}

impl FeatureDescriptor {
    pub fn new(fqn: impl Into<String>, primitive: Primitive) -> Self {
        Self {
            fqn: fqn.into(),
            primitive,
            aggr: Vec::new(),
            freshness: Duration::ZERO,
            staleness: Duration::ZERO,
            timeout: Duration::ZERO,
            builder: default_builder(),
            builder_spec: serde_json::Value::Null,
            data_source: String::new(),
        }
    }

    pub fn with_aggr(mut self, aggr: impl IntoIterator<Item = AggrFn>) -> Self {
        self.aggr = aggr.into_iter().collect();
        self
    }

    pub fn with_freshness(mut self, d: Duration) -> Self {
        self.freshness = d;
        self
    }

    pub fn with_staleness(mut self, d: Duration) -> Self {
        self.staleness = d;
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    pub fn with_builder(mut self, builder: impl Into<String>, spec: serde_json::Value) -> Self {
        self.builder = builder.into();
        self.builder_spec = spec;
        self
    }

    /// Whether this feature accumulates into time buckets
    pub fn is_windowed(&self) -> bool {
        !self.aggr.is_empty()
            && !self.freshness.is_zero()
            && self.staleness >= self.freshness
            && self.primitive.is_numeric()
    }

    pub fn is_headless(&self) -> bool {
        self.primitive == Primitive::Headless
    }

    /// Checks the descriptor before it is bound
    pub fn validate(&self) -> Result<()> {
        let selector = parse_selector(&self.fqn)?;
        if selector.namespace.is_none() {
            return Err(Error::invalid_feature(&self.fqn, "FQN must include a namespace"));
        }
        if selector.aggr.is_some() || selector.version > 0 || selector.encoding.is_some() {
            return Err(Error::invalid_feature(&self.fqn, "FQN must not carry selector suffixes"));
        }
        if !self.aggr.is_empty() && !self.is_windowed() {
            return Err(Error::invalid_feature(
                &self.fqn,
                "windowed features need a numeric primitive, freshness > 0 and staleness >= freshness",
            ));
        }
        if self.builder.is_empty() {
            return Err(Error::invalid_feature(&self.fqn, "builder must be set"));
        }
        Ok(())
    }

    /// Aggregators the state must track; `avg` is derived from `sum` and `count`
    pub fn tracked_aggregators(&self) -> Vec<AggrFn> {
        let mut fns: Vec<AggrFn> = self.aggr.clone();
        if fns.contains(&AggrFn::Avg) {
            fns.extend([AggrFn::Sum, AggrFn::Count]);
        }
        fns.retain(|f| *f != AggrFn::Avg);
        fns.sort();
        fns.dedup();
        fns
    }

    /// Whether this feature fans out over other features
    pub fn is_feature_set(&self) -> bool {
        matches!(self.builder.as_str(), "featureset" | "model")
    }

    /// Member selectors of a feature set, normalized against this feature's namespace
    ///
    /// Members may carry a `+aggr` suffix to read one window projection.
    ///
    /// `None` for features that are not sets.
    pub fn set_members(&self) -> Result<Option<Vec<String>>> {
        if !self.is_feature_set() {
            return Ok(None);
        }
        let namespace = parse_selector(&self.fqn)?
            .namespace
            .ok_or_else(|| Error::invalid_feature(&self.fqn, "FQN must include a namespace"))?;
        let raw = self
            .builder_spec
            .get("members")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| Error::invalid_feature(&self.fqn, "feature set needs a 'members' list"))?;

        let mut members = Vec::with_capacity(raw.len());
        for m in raw {
            let m = m
                .as_str()
                .ok_or_else(|| Error::invalid_feature(&self.fqn, "feature set members must be strings"))?;
            if crate::fqn::normalize_fqn(m, &namespace)? == self.fqn {
                return Err(Error::invalid_feature(&self.fqn, "feature set cannot contain itself"));
            }
            let selector = crate::fqn::normalize_selector(m, &namespace)?;
            if !members.contains(&selector) {
                members.push(selector);
            }
        }
        if members.len() < 2 {
            return Err(Error::invalid_feature(&self.fqn, "feature set needs at least two members"));
        }
        Ok(Some(members))
    }
}

/// One bucket of a windowed feature as read from the state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBucket {
    pub fqn: String,
    pub bucket: String,
    pub entity_id: String,
    #[serde(default)]
    pub data: WindowResultMap,
}

impl RawBucket {
    pub fn key(&self) -> String {
        crate::window::bucket_key(&self.fqn, &self.bucket, &self.entity_id)
    }
}

/// Reduces buckets into a single window result
///
/// Sum and count are added, min and max reduced. Avg is derived as sum/count
/// whenever both are present.
pub fn reduce_buckets<'a>(buckets: impl IntoIterator<Item = &'a RawBucket>) -> WindowResultMap {
    let mut ret = WindowResultMap::new();
    for b in buckets {
        for (fn_, v) in &b.data {
            match fn_ {
                AggrFn::Sum | AggrFn::Count => *ret.entry(*fn_).or_insert(0.0) += v,
                AggrFn::Min => {
                    let e = ret.entry(AggrFn::Min).or_insert(*v);
                    *e = e.min(*v);
                }
                AggrFn::Max => {
                    let e = ret.entry(AggrFn::Max).or_insert(*v);
                    *e = e.max(*v);
                }
                AggrFn::Avg => {}
            }
        }
    }
    if let (Some(sum), Some(count)) = (ret.get(&AggrFn::Sum), ret.get(&AggrFn::Count)) {
        if *count > 0.0 {
            ret.insert(AggrFn::Avg, sum / count);
        }
    }
    ret
}
