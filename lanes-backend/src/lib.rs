/// Lanes backend: config loading, store and engine setup, HTTP server.
pub mod api;
pub mod config;
pub mod server;
pub mod state;

use std::sync::Arc;

use lanes_core::audit::{AuditSink, BroadcastAuditSink, FanoutAuditSink, LogAuditSink};
use lanes_core::storage::local::JsonFileStore;
use lanes_core::ReorderEngine;

use crate::config::ServerConfig;
use crate::state::AppState;

const AUDIT_CHANNEL_CAPACITY: usize = 256;

pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    if let Err(e) = env_logger::Builder::from_env(env).try_init() {
        eprintln!("failed to initialize backend logger: {}", e);
    }
}

/// Wire the file store, audit sinks and engine for `config`.
pub fn build_state(config: &ServerConfig) -> Result<AppState, Box<dyn std::error::Error>> {
    let store = Arc::new(JsonFileStore::open(&config.data_dir)?);
    let audit = BroadcastAuditSink::new(AUDIT_CHANNEL_CAPACITY);
    let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(LogAuditSink), Arc::new(audit.clone())];
    let engine = Arc::new(ReorderEngine::new(
        store.clone(),
        Arc::new(FanoutAuditSink::new(sinks)),
        config.engine.clone(),
    ));

    Ok(AppState {
        engine,
        store,
        audit,
        port: config.port,
        bind_address: config.bind_address.clone(),
    })
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config_path = config::default_config_path();
    let config = config::load_config(&config_path);
    log::info!(
        target: "lanes.backend",
        "Serving boards from {}",
        config.data_dir.display()
    );

    let state = build_state(&config)?;
    let (_port, server) = server::spawn_server(state).await?;

    tokio::select! {
        _ = server => {
            log::warn!(target: "lanes.backend", "HTTP server task ended");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!(target: "lanes.backend", "Failed to listen for shutdown signal: {}", e);
            }
            log::info!(target: "lanes.backend", "Shutting down");
        }
    }
    Ok(())
}
