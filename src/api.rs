use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::aggregator::{Aggregator, FullSnapshot, Snapshot, WindowKey};

pub async fn get_stats(State(aggregator): State<Arc<Aggregator>>) -> Json<FullSnapshot> {
    Json(aggregator.snapshot_all())
}

pub async fn get_overall(State(aggregator): State<Arc<Aggregator>>) -> Json<Snapshot> {
    Json(aggregator.snapshot(&WindowKey::All))
}

pub fn create_router(aggregator: Arc<Aggregator>) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/stats/all", get(get_overall))
        .layer(TraceLayer::new_for_http())
        .with_state(aggregator)
}

pub async fn start_server(port: u16, aggregator: Arc<Aggregator>, cancel: CancellationToken) -> std::io::Result<()> {
    let app = create_router(aggregator);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Stats API: http://localhost:{}/api/stats", addr.port());
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
