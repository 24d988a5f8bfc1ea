use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::state::AppState;

/// DB health endpoint: returns 200 OK when the store can run a simple query,
/// otherwise returns 503 Service Unavailable.
pub async fn db_health(State(state): State<AppState>) -> impl IntoResponse {
	match state.repo.ping().await {
		Ok(()) => (StatusCode::OK, "OK").into_response(),
		Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("db error: {}", e)).into_response(),
	}
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
	(StatusCode::OK, state.metrics.encode()).into_response()
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(db_health))
		.route("/metrics", get(metrics_handler))
		.with_state(state)
}

/// Serve the admin endpoints until `shutdown` turns `true`.
pub async fn serve(
	listener: TcpListener,
	state: AppState,
	mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move {
			while !*shutdown.borrow_and_update() {
				if shutdown.changed().await.is_err() {
					break;
				}
			}
		})
		.await
}
