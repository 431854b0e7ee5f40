//! Process-wide FQN → feature map

use crate::feature::Feature;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kestrel_core::{Error, FeatureDescriptor, Result};
use std::sync::Arc;

/// Concurrent registry of bound features
///
/// Lookups touch only the shard that holds the FQN, and bind/unbind lock
/// that one entry. Readers clone an `Arc<Feature>` out, so a request keeps
/// using the pipelines it started with even if the feature is rebound
/// concurrently.
#[derive(Debug)]
pub struct Registry {
    features: DashMap<String, Arc<Feature>>,
    updates_allowed: bool,
}

impl Registry {
    pub fn new(updates_allowed: bool) -> Self {
        Self {
            features: DashMap::new(),
            updates_allowed,
        }
    }

    pub fn updates_allowed(&self) -> bool {
        self.updates_allowed
    }

    /// Adds a feature; replaces an existing one only when updates are allowed
    pub fn bind(&self, feature: Feature) -> Result<()> {
        let fqn = feature.fqn().to_string();
        let replaced = match self.features.entry(fqn.clone()) {
            Entry::Occupied(_) if !self.updates_allowed => return Err(Error::FeatureAlreadyExists(fqn)),
            Entry::Occupied(mut entry) => {
                entry.insert(Arc::new(feature));
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(feature));
                false
            }
        };
        tracing::info!(fqn = %fqn, replaced, "feature bound");
        Ok(())
    }

    /// Removes a feature; missing features are ignored
    pub fn unbind(&self, fqn: &str) -> Result<()> {
        if self.features.remove(fqn).is_some() {
            tracing::info!(fqn = %fqn, "feature unbound");
        }
        Ok(())
    }

    pub fn has(&self, fqn: &str) -> bool {
        self.features.contains_key(fqn)
    }

    pub fn get(&self, fqn: &str) -> Result<Arc<Feature>> {
        self.features
            .get(fqn)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::FeatureNotFound(fqn.to_string()))
    }

    /// Descriptors of every bound feature, sorted by FQN
    pub fn descriptors(&self) -> Vec<FeatureDescriptor> {
        let mut out: Vec<FeatureDescriptor> = self
            .features
            .iter()
            .map(|entry| (*entry.value().descriptor).clone())
            .collect();
        out.sort_by(|a, b| a.fqn.cmp(&b.fqn));
        out
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::MiddlewareBundle;
    use crate::pipeline::{Exchange, Middleware, Next};
    use async_trait::async_trait;
    use kestrel_core::Primitive;

    struct Noop;

    #[async_trait]
    impl Middleware for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
            next.run(ex).await
        }
    }

    fn feature(fqn: &str, primitive: Primitive) -> Feature {
        Feature::new(
            FeatureDescriptor::new(fqn, primitive),
            &MiddlewareBundle::new(),
            Arc::new(Noop),
            Arc::new(Noop),
            |_| Arc::new(Noop),
        )
    }

    #[test]
    fn test_bind_rejects_duplicates() {
        let registry = Registry::new(false);
        registry.bind(feature("ns.a", Primitive::Int)).unwrap();
        assert!(registry.has("ns.a"));
        assert!(matches!(
            registry.bind(feature("ns.a", Primitive::Float)),
            Err(Error::FeatureAlreadyExists(_))
        ));
        assert_eq!(registry.get("ns.a").unwrap().descriptor.primitive, Primitive::Int);
    }

    #[test]
    fn test_bind_replaces_when_updates_allowed() {
        let registry = Registry::new(true);
        registry.bind(feature("ns.a", Primitive::Int)).unwrap();
        let held = registry.get("ns.a").unwrap();
        registry.bind(feature("ns.a", Primitive::Float)).unwrap();

        assert_eq!(registry.get("ns.a").unwrap().descriptor.primitive, Primitive::Float);
        // in-flight requests keep their snapshot
        assert_eq!(held.descriptor.primitive, Primitive::Int);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let registry = Registry::new(false);
        registry.bind(feature("ns.a", Primitive::Int)).unwrap();
        registry.unbind("ns.a").unwrap();
        registry.unbind("ns.a").unwrap();
        assert!(!registry.has("ns.a"));
        assert!(matches!(registry.get("ns.a"), Err(Error::FeatureNotFound(_))));
    }

    #[test]
    fn test_concurrent_bind_and_get() {
        let registry = Arc::new(Registry::new(false));
        registry.bind(feature("ns.hot", Primitive::Int)).unwrap();

        let binders: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    // every thread races on the shared name and binds its own
                    let shared = registry.bind(feature("ns.shared", Primitive::Int)).is_ok();
                    registry.bind(feature(&format!("ns.f{}", i), Primitive::Int)).unwrap();
                    shared
                })
            })
            .collect();
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(registry.get("ns.hot").unwrap().fqn(), "ns.hot");
                    }
                })
            })
            .collect();

        let winners = binders.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 10);
        assert_eq!(registry.descriptors().first().unwrap().fqn, "ns.f0");
    }
}
