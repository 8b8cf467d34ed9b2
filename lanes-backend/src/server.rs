/// HTTP server: binds the listener and serves axum on a background tokio task.
use crate::api::api_router;
use crate::state::AppState;
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api_router().layer(cors).with_state(state)
}

pub async fn spawn_server(
    state: AppState,
) -> Result<(u16, JoinHandle<()>), Box<dyn std::error::Error>> {
    let port = state.port;
    let bind_addr = state.bind_address.clone();
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind_addr, port)).await?;
    let actual_port = listener.local_addr()?.port();

    log::info!(
        target: "lanes.server",
        "HTTP server listening on http://{}:{}",
        bind_addr,
        actual_port
    );

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!(target: "lanes.server", "HTTP server exited with error: {}", e);
        }
    });

    Ok((actual_port, handle))
}
