mod handlers;
mod state;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/json/{host}",
            get(handlers::lookup_single).post(handlers::lookup_single),
        )
        .route("/batch", post(handlers::lookup_batch))
        .route("/metrics", get(handlers::metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start(host: &str, port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("iptracker listening on http://{}", addr);
    axum::serve(listener, app).await
}
