//! Process wiring
//!
//! Builds the providers named in the configuration and connects them:
//! the engine publishes through the historian client, the historian server
//! consumes the same notifiers, and a [`Manager`] runs the client everywhere
//! and the historian only on the leader.

use crate::config::{self, Config};
use crate::state::AppState;
use anyhow::Context;
use kestrel_core::plugins::{ProviderContext, Providers};
use kestrel_core::{AlwaysLeader, LeaderElector, SharedClock, SystemClock};
use kestrel_engine::{Engine, EngineConfig};
use kestrel_historian::{HistorianClient, HistorianDeps, HistorianServer, Manager};
use kestrel_providers::{LeaseConfig, RedisLeaseElector};
use std::sync::Arc;
use tracing::info;

pub struct Runtime {
    pub engine: Engine,
    pub client: Arc<HistorianClient>,
    pub historian: HistorianServer,
    pub manager: Manager,
}

impl Runtime {
    /// Builds everything with the system clock
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        Self::build_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn build_with_clock(config: &Config, clock: SharedClock) -> anyhow::Result<Self> {
        config.validate()?;

        let mut providers = Providers::default();
        kestrel_providers::register_all(&mut providers);
        let context = |settings: serde_json::Value| ProviderContext {
            settings,
            clock: clock.clone(),
            window: config.window(),
        };

        let state = providers
            .state(&config.state_provider, context(config.redis_settings()))
            .await
            .with_context(|| format!("failed to build state provider '{}'", config.state_provider))?;
        let collect_notifier = providers
            .collect_notifier(&config.notifier_provider, context(config.redis_settings()))
            .await
            .with_context(|| format!("failed to build notifier '{}'", config.notifier_provider))?;
        let write_notifier = providers
            .write_notifier(&config.notifier_provider, context(config.redis_settings()))
            .await
            .with_context(|| format!("failed to build notifier '{}'", config.notifier_provider))?;
        let writer = providers
            .historical_writer(&config.historical_writer_provider, context(config.historical_settings()))
            .await
            .with_context(|| {
                format!(
                    "failed to build historical writer '{}'",
                    config.historical_writer_provider
                )
            })?;

        let client = Arc::new(HistorianClient::new(
            config.historian_client(),
            collect_notifier.clone(),
            write_notifier.clone(),
        ));
        let engine = Engine::builder(state.clone(), client.clone())
            .config(EngineConfig {
                default_namespace: config.default_namespace.clone(),
                updates_allowed: config.updates_allowed,
            })
            .clock(clock.clone())
            .build();
        let historian = HistorianServer::new(
            config.historian(),
            HistorianDeps {
                state,
                writer,
                collect_notifier,
                write_notifier,
                clock,
            },
        )?;

        let elector: Arc<dyn LeaderElector> = if config.leader_elect {
            let lease = LeaseConfig {
                url: config.redis.effective_url(),
                key: config.lease.key.clone(),
                ttl: config.lease.ttl,
            };
            Arc::new(RedisLeaseElector::new(lease).await.context("failed to start leader election")?)
        } else {
            Arc::new(AlwaysLeader)
        };
        let mut manager = Manager::new(elector);
        manager.add(client.clone());
        manager.extend(historian.runnables());

        let runtime = Self {
            engine,
            client,
            historian,
            manager,
        };
        if let Some(path) = &config.features_file {
            runtime.bind_features(config::load_features(path)?).await?;
        }

        info!(
            state = %config.state_provider,
            notifier = %config.notifier_provider,
            historical_writer = %config.historical_writer_provider,
            leader_elect = config.leader_elect,
            features = runtime.engine.descriptors().len(),
            "runtime ready"
        );
        Ok(runtime)
    }

    /// Binds each descriptor into the engine and the historian
    pub async fn bind_features(&self, features: Vec<kestrel_core::FeatureDescriptor>) -> anyhow::Result<()> {
        for fd in features {
            let fqn = fd.fqn.clone();
            self.engine
                .bind(fd)
                .with_context(|| format!("failed to bind '{}'", fqn))?;
            let bound = self.engine.metadata(&fqn)?;
            self.historian
                .bind(bound)
                .await
                .with_context(|| format!("failed to bind '{}' in the historian", fqn))?;
        }
        Ok(())
    }

    pub fn app_state(&self, config: &Config) -> AppState {
        AppState::with_historian(self.engine.clone(), Some(self.historian.clone())).request_timeout(config.request_timeout)
    }
}
