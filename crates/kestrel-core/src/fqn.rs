//! Feature selector grammar
//!
//! A selector is `[namespace.]name[+aggr][@-version][[encoding]]`. The
//! namespace and name are lowercase tokens joined by underscores; the
//! optional suffixes pick a window projection, a previous version and an
//! output encoding. The canonical (normalized) form always carries a
//! namespace and emits the suffixes in the order `+aggr @-ver [enc]`.

use crate::error::{Error, Result};
use crate::types::AggrFn;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static SELECTOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^((?P<namespace>[a-z0-9]+(?:_[a-z0-9]+)*)\.)?(?P<name>[a-z0-9]+(?:_[a-z0-9]+)*)(\+(?P<aggr>[a-z]+_*[a-z]+))?(@-(?P<version>[0-9]+))?(\[(?P<encoding>[a-z]+_*[a-z]+)\])?$",
    )
    .expect("selector regex is valid")
});

/// A parsed feature selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub namespace: Option<String>,
    pub name: String,
    pub aggr: Option<AggrFn>,
    pub version: u32,
    pub encoding: Option<String>,
}

impl Selector {
    /// The base feature name (`namespace.name`), without any suffix
    pub fn fqn(&self, default_namespace: &str) -> String {
        let ns = self.namespace.as_deref().unwrap_or(default_namespace);
        format!("{}.{}", ns, self.name)
    }

    /// Fills the namespace if missing
    pub fn with_default_namespace(mut self, namespace: &str) -> Self {
        if self.namespace.is_none() {
            self.namespace = Some(namespace.to_lowercase());
        }
        self
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}.", ns)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(aggr) = self.aggr {
            write!(f, "+{}", aggr)?;
        }
        if self.version > 0 {
            write!(f, "@-{}", self.version)?;
        }
        if let Some(enc) = &self.encoding {
            write!(f, "[{}]", enc)?;
        }
        Ok(())
    }
}

/// Parses a selector into its components
///
/// Fails with [`Error::InvalidFqn`] when the grammar does not match and with
/// [`Error::UnsupportedAggregator`] when the `+aggr` suffix names an unknown
/// function.
pub fn parse_selector(selector: &str) -> Result<Selector> {
    let caps = SELECTOR_RE
        .captures(selector.trim())
        .ok_or_else(|| Error::InvalidFqn(selector.to_string()))?;

    let lower = |name: &str| caps.name(name).map(|m| m.as_str().to_lowercase());

    let aggr = match caps.name("aggr") {
        Some(m) => Some(m.as_str().parse::<AggrFn>()?),
        None => None,
    };
    let version = match caps.name("version") {
        Some(m) => m
            .as_str()
            .parse::<u32>()
            .map_err(|_| Error::InvalidFqn(selector.to_string()))?,
        None => 0,
    };

    Ok(Selector {
        namespace: lower("namespace"),
        name: lower("name").ok_or_else(|| Error::InvalidFqn(selector.to_string()))?,
        aggr,
        version,
        encoding: lower("encoding"),
    })
}

/// Returns the canonical form of a selector, suffixes included
pub fn normalize_selector(selector: &str, default_namespace: &str) -> Result<String> {
    Ok(parse_selector(selector)?
        .with_default_namespace(default_namespace)
        .to_string())
}

/// Returns the canonical base FQN (`namespace.name`) of a selector
pub fn normalize_fqn(selector: &str, default_namespace: &str) -> Result<String> {
    Ok(parse_selector(selector)?.fqn(&default_namespace.to_lowercase()))
}
