//! Provider registration tables
//!
//! Providers are selected by name from configuration. Each process builds a
//! [`Providers`] table at start-up, registers the factories it ships with and
//! hands the table to whatever needs to construct a state, a notifier or a
//! historical writer.

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::historical::HistoricalWriter;
use crate::notification::{CollectNotification, WriteNotification};
use crate::notifier::Notifier;
use crate::state::State;
use crate::window::WindowPolicy;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a factory gets to build its provider
#[derive(Debug, Clone)]
pub struct ProviderContext {
    /// Provider-specific settings section from the configuration
    pub settings: serde_json::Value,
    pub clock: SharedClock,
    pub window: WindowPolicy,
}

impl ProviderContext {
    /// Deserializes the settings section into the provider's own type
    pub fn settings<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.settings.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.settings.clone()).map_err(|e| Error::config(e.to_string()))
    }
}

pub type StateFactory = Arc<dyn Fn(ProviderContext) -> BoxFuture<'static, Result<Arc<dyn State>>> + Send + Sync>;

pub type NotifierFactory<T> =
    Arc<dyn Fn(ProviderContext) -> BoxFuture<'static, Result<Arc<dyn Notifier<T>>>> + Send + Sync>;

pub type HistoricalWriterFactory =
    Arc<dyn Fn(ProviderContext) -> BoxFuture<'static, Result<Arc<dyn HistoricalWriter>>> + Send + Sync>;

/// A name → factory map
pub struct FactoryTable<F> {
    kind: &'static str,
    entries: BTreeMap<String, F>,
}

impl<F: Clone> FactoryTable<F> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Registers a factory, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, factory: F) {
        self.entries.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Result<F> {
        self.entries.get(name).cloned().ok_or_else(|| {
            Error::config(format!(
                "no {} provider named '{}' (available: {})",
                self.kind,
                name,
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// All provider tables of a process
pub struct Providers {
    pub states: FactoryTable<StateFactory>,
    pub collect_notifiers: FactoryTable<NotifierFactory<CollectNotification>>,
    pub write_notifiers: FactoryTable<NotifierFactory<WriteNotification>>,
    pub historical_writers: FactoryTable<HistoricalWriterFactory>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            states: FactoryTable::new("state"),
            collect_notifiers: FactoryTable::new("collect notifier"),
            write_notifiers: FactoryTable::new("write notifier"),
            historical_writers: FactoryTable::new("historical writer"),
        }
    }
}

impl Providers {
    pub async fn state(&self, name: &str, ctx: ProviderContext) -> Result<Arc<dyn State>> {
        (self.states.get(name)?)(ctx).await
    }

    pub async fn collect_notifier(
        &self,
        name: &str,
        ctx: ProviderContext,
    ) -> Result<Arc<dyn Notifier<CollectNotification>>> {
        (self.collect_notifiers.get(name)?)(ctx).await
    }

    pub async fn write_notifier(&self, name: &str, ctx: ProviderContext) -> Result<Arc<dyn Notifier<WriteNotification>>> {
        (self.write_notifiers.get(name)?)(ctx).await
    }

    pub async fn historical_writer(&self, name: &str, ctx: ProviderContext) -> Result<Arc<dyn HistoricalWriter>> {
        (self.historical_writers.get(name)?)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_lists_available() {
        let mut table: FactoryTable<Arc<str>> = FactoryTable::new("state");
        table.register("memory", Arc::from("m"));
        table.register("redis", Arc::from("r"));

        assert_eq!(&*table.get("redis").unwrap(), "r");
        let err = table.get("etcd").unwrap_err().to_string();
        assert!(err.contains("no state provider named 'etcd'"));
        assert!(err.contains("memory, redis"));
    }

    #[test]
    fn test_settings_default_when_missing() {
        #[derive(serde::Deserialize, Default, Debug, PartialEq)]
        struct S {
            url: Option<String>,
        }
        let ctx = ProviderContext {
            settings: serde_json::Value::Null,
            clock: Arc::new(crate::clock::SystemClock),
            window: WindowPolicy::default(),
        };
        assert_eq!(ctx.settings::<S>().unwrap(), S::default());
    }
}
