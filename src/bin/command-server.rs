// Copyright (c) 2025 - Cowboy AI, Inc.
//! Command Server
//!
//! Accepts newline-delimited JSON account commands over TCP and executes them
//! against an account store with optimistic concurrency.
//!
//! Run with: cargo run --bin command-server
//!
//! Environment:
//! - `COMMAND_SERVER_ADDR`: listen address (default `127.0.0.1:7070`)
//! - `COMMAND_STORE`: `memory` (default) or `nats`
//! - `NATS_URL`, `NATS_BUCKET`: key-value bucket used when `COMMAND_STORE=nats`
//! - `PROCESSOR_MAX_WORKERS`, `PROCESSOR_QUEUE_CAPACITY`: pool sizing
//! - `PROCESSOR_MAX_RETRIES`: cap on lost races per command (unbounded if unset)
//!
//! Try it:
//!
//! ```text
//! $ echo '{"intent":1,"timestamp":"2026-01-19T12:00:00Z","identifier":42,"operation":"open"}' | nc localhost 7070
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use cim_command_processor::accounts::{account_upcasters, Account, AccountHandler};
use cim_command_processor::processor::{CommandProcessor, ProcessorConfig, RetryPolicy};
use cim_command_processor::protocol::{JsonProcessor, TracingResultLogger};
use cim_command_processor::store::{
    AggregateStore, DocumentStore, InMemoryCollection, JsonSerde, NatsKvCollection,
    NatsStoreConfig,
};
use cim_command_processor::transport::{ServerConfig, TcpCommandServer};
use tokio::sync::watch;
use tracing::{error, info};

/// Which collection backs the account store
#[derive(Debug, Clone)]
enum StoreBackend {
    Memory,
    Nats(NatsStoreConfig),
}

/// Configuration for the command server
#[derive(Debug, Clone)]
struct CommandServerConfig {
    server: ServerConfig,
    processor: ProcessorConfig,
    backend: StoreBackend,
}

impl CommandServerConfig {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let mut server = ServerConfig::default();
        if let Ok(address) = std::env::var("COMMAND_SERVER_ADDR") {
            server.bind_address = address;
        }

        let mut processor = ProcessorConfig::default();
        if let Some(max_workers) = parse_env("PROCESSOR_MAX_WORKERS")? {
            processor = processor.with_max_workers(max_workers);
        }
        if let Some(capacity) = parse_env("PROCESSOR_QUEUE_CAPACITY")? {
            processor = processor.with_queue_capacity(capacity);
        }
        if let Some(max_retries) = parse_env("PROCESSOR_MAX_RETRIES")? {
            processor = processor.with_retry_policy(RetryPolicy::Limited(max_retries));
        }
        processor.validate()?;

        let backend = match std::env::var("COMMAND_STORE").as_deref() {
            Ok("nats") => {
                let defaults = NatsStoreConfig::default();
                StoreBackend::Nats(NatsStoreConfig {
                    url: std::env::var("NATS_URL").unwrap_or(defaults.url),
                    bucket: std::env::var("NATS_BUCKET").unwrap_or(defaults.bucket),
                })
            }
            Ok("memory") | Err(_) => StoreBackend::Memory,
            Ok(other) => anyhow::bail!("COMMAND_STORE must be 'memory' or 'nats', got '{}'", other),
        };

        Ok(Self {
            server,
            processor,
            backend,
        })
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("{} is not a valid number: '{}'", name, value)),
        Err(_) => Ok(None),
    }
}

async fn open_store(backend: &StoreBackend) -> Result<Arc<dyn AggregateStore<Account>>> {
    let upcasters = account_upcasters()?;
    match backend {
        StoreBackend::Memory => {
            info!("🧠 Using in-memory account store");
            let store = DocumentStore::<Account, _, _>::new(InMemoryCollection::new(), JsonSerde, upcasters)?;
            Ok(Arc::new(store))
        }
        StoreBackend::Nats(config) => {
            info!("🔌 Connecting to NATS at {}", config.url);
            let collection = NatsKvCollection::connect(config)
                .await
                .context("Failed to open NATS key-value bucket")?;
            info!("✅ Using key-value bucket: {}", config.bucket);
            let store = DocumentStore::<Account, _, _>::new(collection, JsonSerde, upcasters)?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 Starting Command Server");

    let config = CommandServerConfig::from_env()?;
    info!("📋 Configuration loaded:");
    info!("  - Address: {}", config.server.bind_address);
    info!("  - Store: {:?}", config.backend);
    info!("  - Max workers: {}", config.processor.max_workers);
    info!("  - Queue capacity: {}", config.processor.queue_capacity);
    info!("  - Retry policy: {:?}", config.processor.retry_policy);

    let store = open_store(&config.backend).await?;
    let processor = Arc::new(
        CommandProcessor::new(store, AccountHandler, config.processor.clone())
            .context("Failed to start command processor")?,
    );
    let json = Arc::new(JsonProcessor::new(processor.clone(), TracingResultLogger));
    let server = TcpCommandServer::new(json, config.server.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            // Dropping the sender would stop the server
            std::future::pending::<()>().await;
        }
        info!("🛑 Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    server
        .run(shutdown_rx)
        .await
        .with_context(|| format!("Failed to serve on {}", config.server.bind_address))?;

    processor.shutdown();
    info!("👋 Command server stopped");
    Ok(())
}
