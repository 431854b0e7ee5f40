//! # Kestrel
//!
//! Online feature store engine in one process: the HTTP accessor on every
//! replica, the historian on the elected leader.
//!
//! ## Startup Flow
//!
//! 1. Initialize tracing/logging
//! 2. Parse command-line arguments
//! 3. Load configuration, apply environment and flag overrides
//! 4. Build providers, engine and historian
//! 5. Serve HTTP and run the runnables until SIGINT/SIGTERM
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (in-memory state and notifiers, local history)
//! kestrel serve
//!
//! # Redis-backed replica with leader election
//! KESTREL_STATE_PROVIDER=redis KESTREL_NOTIFIER_PROVIDER=redis \
//!   kestrel serve --config kestrel.yaml --leader-elect true
//!
//! # Check a feature file
//! kestrel validate features.yaml
//! ```

use clap::Parser;
use kestrel_server::cli::{Cli, Commands, ServeArgs};
use kestrel_server::runtime::Runtime;
use kestrel_server::{app, config, shutdown};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG sets the level, LOG_FORMAT=json switches to structured output
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false).with_thread_ids(false))
            .init();
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Validate { file } => validate(&file),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = config::load(&args.config)?;
    args.apply(&mut config);
    config.validate()?;

    if let Some(grpc) = &config.accessor_grpc_address {
        info!(address = %grpc, "gRPC accessor is served by an external adapter");
    }

    let runtime = Runtime::build(&config).await?;
    let router = app(runtime.app_state(&config), &config.accessor_http_prefix);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown::cancel_on_signal(cancel.clone()));

    let manager = runtime.manager;
    let runnables = {
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.start(cancel).await })
    };

    let listener = tokio::net::TcpListener::bind(&config.accessor_http_address)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", config.accessor_http_address, e))?;
    info!("Accessor listening on http://{}{}", config.accessor_http_address, config.accessor_http_prefix);
    info!("Health check: http://{}/health", config.accessor_http_address);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;
    cancel.cancel();

    // runnables drain their queues and close the historical writer
    runnables.await??;
    served?;

    info!("Server shut down gracefully");
    Ok(())
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let features = config::load_features(file)?;
    for fd in &features {
        let kind = if fd.is_windowed() {
            "windowed"
        } else if fd.is_headless() {
            "headless"
        } else {
            "scalar"
        };
        println!("{:<40} {:<12} {:<10} builder={}", fd.fqn, fd.primitive.to_string(), kind, fd.builder);
    }
    println!("{} feature(s) valid", features.len());
    Ok(())
}
