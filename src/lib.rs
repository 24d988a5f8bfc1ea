pub mod config;
pub mod health;
pub mod observability;
pub mod persist;
pub mod rpc;
pub mod state;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info};
use tokio::net::TcpListener;

use crate::config::Settings;
use crate::observability::MetricsRegistry;
use crate::persist::{ExperienceRepo, Store};
use crate::rpc::Node;
use crate::state::AppState;
use crate::sync::SyncAgent;

/// Open the store, apply seed scripts, and serve the sync facade until
/// Ctrl-C. With `settings.master` set, also runs the node sync agent.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
	let metrics = Arc::new(MetricsRegistry::new().context("failed to build metrics registry")?);

	let store = Store::open(&settings.database_path, settings.namespace.clone())
		.await
		.with_context(|| format!("could not open database: {}", settings.database_path))?;

	// Bad seed data must stop us before anything is listening.
	if !settings.seed_files.is_empty() {
		store
			.import(&settings.seed_files)
			.await
			.context("seed import failed")?;
	}

	let repo: Arc<dyn ExperienceRepo> = Arc::new(store);
	let node = Arc::new(Node::new(
		repo.clone(),
		metrics.clone(),
		Duration::from_millis(settings.accept_timeout_ms),
	));

	let shutdown = node.shutdown_handle();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received, shutting down");
			shutdown.trigger();
		}
	});

	if let Some(master) = settings.master.clone() {
		let agent = SyncAgent::new(
			settings.node_id.clone(),
			master,
			Duration::from_secs(settings.sync_interval_secs.max(1)),
			repo.clone(),
			metrics.clone(),
		);
		node.spawn_background(agent.run(node.shutdown_signal()));
	}

	if let Some(admin_port) = settings.admin_port {
		let addr = format!("{}:{}", settings.host, admin_port);
		let listener = TcpListener::bind(&addr)
			.await
			.with_context(|| format!("failed to bind admin endpoint {}", addr))?;
		info!("admin endpoints on http://{} (GET /health, /metrics)", addr);
		let state = AppState {
			repo: repo.clone(),
			metrics: metrics.clone(),
		};
		let signal = node.shutdown_signal();
		node.spawn_background(async move {
			if let Err(e) = health::serve(listener, state, signal).await {
				error!("admin endpoint failed: {}", e);
			}
		});
	}

	let addr = format!("{}:{}", settings.host, settings.port);
	node.listen_and_serve(&addr).await
}
