/// Shared application state passed to axum handlers.
use std::sync::Arc;

use lanes_core::audit::BroadcastAuditSink;
use lanes_core::storage::local::JsonFileStore;
use lanes_core::ReorderEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReorderEngine>,
    pub store: Arc<JsonFileStore>,
    /// Live audit feed for `/events`.
    pub audit: BroadcastAuditSink,
    pub port: u16,
    pub bind_address: String,
}
