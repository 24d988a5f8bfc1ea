/// Common test utilities and helpers for integration tests.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use xpsync::observability::MetricsRegistry;
use xpsync::persist::{ExperienceRepo, Store};
use xpsync::rpc::{Node, NodeState};

/// Five players; `alexmax`, `blzut3` and `dusk` have watermarks.
pub const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixture/zanxp.sql");

/// Open an empty on-disk store inside `dir`.
pub async fn open_store(dir: &TempDir, name: &str) -> Store {
	let path = dir.path().join(name);
	Store::open(path.to_str().expect("utf-8 temp path"), "zanxp")
		.await
		.expect("store should open")
}

/// Open a store inside `dir` and load the shared fixture into it.
pub async fn seeded_store(dir: &TempDir, name: &str) -> Store {
	let store = open_store(dir, name).await;
	store.import(&[FIXTURE]).await.expect("fixture should import");
	store
}

/// Run raw SQL against the store the way the game would, bypassing the
/// merge engine.
#[allow(dead_code)]
pub async fn game_write(store: &Store, dir: &TempDir, sql: &str) {
	let script = dir.path().join("game_write.sql");
	std::fs::write(&script, sql).expect("write script");
	store.import(&[script]).await.expect("game write should apply");
}

/// A node serving `repo` on an ephemeral local port.
#[allow(dead_code)]
pub struct RunningNode {
	pub node: Arc<Node>,
	pub addr: SocketAddr,
	pub handle: JoinHandle<anyhow::Result<()>>,
}

#[allow(dead_code)]
pub async fn start_node(repo: Arc<dyn ExperienceRepo>) -> RunningNode {
	let metrics = Arc::new(MetricsRegistry::new().expect("metrics"));
	let node = Arc::new(Node::new(repo, metrics, Duration::from_millis(50)));
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");

	let mut states = node.subscribe();
	let handle = tokio::spawn(Arc::clone(&node).serve(listener));
	states
		.wait_for(|s| *s == NodeState::Listening)
		.await
		.expect("node should start listening");

	RunningNode { node, addr, handle }
}
