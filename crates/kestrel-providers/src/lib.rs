//! # Kestrel Providers
//!
//! Concrete implementations of the core contracts:
//!
//! | Contract            | Providers           |
//! |---------------------|---------------------|
//! | `State`             | `memory`, `redis`   |
//! | `Notifier<T>`       | `memory`, `redis`   |
//! | `HistoricalWriter`  | `memory`, `local`   |
//! | `LeaderElector`     | `RedisLeaseElector` |
//!
//! Call [`register_all`] once at start-up, then select providers by name.
//! The `memory` providers are process-wide singletons: every lookup in the
//! same [`Providers`] table returns the same instance, which is what lets
//! the engine and the historian share them inside one process.

pub mod historical;
pub mod leader;
pub mod notifier;
pub mod state;

pub use historical::{LocalWriter, LocalWriterConfig, MemoryWriter};
pub use leader::{LeaseConfig, RedisLeaseElector};
pub use notifier::{MemoryNotifier, RedisNotifier, RedisNotifierConfig};
pub use state::{MemoryState, RedisState, RedisStateConfig};

use futures::future::BoxFuture;
use futures::FutureExt;
use kestrel_core::plugins::{NotifierFactory, ProviderContext, Providers};
use kestrel_core::{HistoricalWriter, Notification, Notifier, Result, State};
use std::sync::{Arc, OnceLock};

/// Registers every provider shipped with this crate
pub fn register_all(providers: &mut Providers) {
    let memory_state: Arc<OnceLock<Arc<MemoryState>>> = Arc::new(OnceLock::new());
    providers.states.register(
        "memory",
        Arc::new(move |ctx: ProviderContext| -> BoxFuture<'static, Result<Arc<dyn State>>> {
            let state = memory_state
                .get_or_init(|| Arc::new(MemoryState::new(ctx.clock.clone(), ctx.window)))
                .clone();
            async move { Ok(state as Arc<dyn State>) }.boxed()
        }),
    );
    providers.states.register(
        "redis",
        Arc::new(|ctx: ProviderContext| -> BoxFuture<'static, Result<Arc<dyn State>>> {
            async move {
                let config: RedisStateConfig = ctx.settings()?;
                let state = RedisState::new(config, ctx.clock, ctx.window).await?;
                Ok(Arc::new(state) as Arc<dyn State>)
            }
            .boxed()
        }),
    );

    providers.collect_notifiers.register("memory", memory_notifier());
    providers.collect_notifiers.register("redis", redis_notifier());
    providers.write_notifiers.register("memory", memory_notifier());
    providers.write_notifiers.register("redis", redis_notifier());

    let memory_writer: Arc<MemoryWriter> = Arc::new(MemoryWriter::new());
    providers.historical_writers.register(
        "memory",
        Arc::new(move |_ctx: ProviderContext| -> BoxFuture<'static, Result<Arc<dyn HistoricalWriter>>> {
            let writer = memory_writer.clone();
            async move { Ok(writer as Arc<dyn HistoricalWriter>) }.boxed()
        }),
    );
    providers.historical_writers.register(
        "local",
        Arc::new(|ctx: ProviderContext| -> BoxFuture<'static, Result<Arc<dyn HistoricalWriter>>> {
            async move {
                let config: LocalWriterConfig = ctx.settings()?;
                Ok(Arc::new(LocalWriter::new(config)?) as Arc<dyn HistoricalWriter>)
            }
            .boxed()
        }),
    );
}

fn memory_notifier<T: Notification>() -> NotifierFactory<T> {
    let shared: Arc<MemoryNotifier<T>> = Arc::new(MemoryNotifier::default());
    Arc::new(move |_ctx: ProviderContext| -> BoxFuture<'static, Result<Arc<dyn Notifier<T>>>> {
        let notifier = shared.clone();
        async move { Ok(notifier as Arc<dyn Notifier<T>>) }.boxed()
    })
}

fn redis_notifier<T: Notification>() -> NotifierFactory<T> {
    Arc::new(|ctx: ProviderContext| -> BoxFuture<'static, Result<Arc<dyn Notifier<T>>>> {
        async move {
            let config: RedisNotifierConfig = ctx.settings()?;
            Ok(Arc::new(RedisNotifier::<T>::new(config).await?) as Arc<dyn Notifier<T>>)
        }
        .boxed()
    })
}
