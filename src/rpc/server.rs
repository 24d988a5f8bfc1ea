use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::dispatch::{self, MethodTable};
use super::wire::{self, Request, RpcError};
use crate::observability::MetricsRegistry;
use crate::persist::ExperienceRepo;

/// Where a node is in its life. Transitions only move forward, except
/// `Listening` and `Serving`, which alternate as calls come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
	Disconnected,
	Listening,
	/// At least one call is being processed.
	Serving,
	Shutdown,
}

/// Cloneable trigger for [`Node`] shutdown.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
	pub fn trigger(&self) {
		self.0.send_replace(true);
	}
}

/// Serves the sync facade over TCP and owns the shutdown ordering: stop
/// accepting, finish in-flight calls and background tasks, then close the
/// store.
pub struct Node {
	repo: Arc<dyn ExperienceRepo>,
	methods: MethodTable,
	metrics: Arc<MetricsRegistry>,
	accept_timeout: Duration,
	state: watch::Sender<NodeState>,
	shutdown: Arc<watch::Sender<bool>>,
	in_flight: AtomicUsize,
	background: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
	pub fn new(
		repo: Arc<dyn ExperienceRepo>,
		metrics: Arc<MetricsRegistry>,
		accept_timeout: Duration,
	) -> Self {
		let methods = dispatch::messages(repo.clone(), metrics.clone());
		let (state, _) = watch::channel(NodeState::Disconnected);
		let (shutdown, _) = watch::channel(false);
		Self {
			repo,
			methods,
			metrics,
			accept_timeout,
			state,
			shutdown: Arc::new(shutdown),
			in_flight: AtomicUsize::new(0),
			background: Mutex::new(Vec::new()),
		}
	}

	pub fn state(&self) -> NodeState {
		*self.state.borrow()
	}

	pub fn subscribe(&self) -> watch::Receiver<NodeState> {
		self.state.subscribe()
	}

	pub fn shutdown_handle(&self) -> ShutdownHandle {
		ShutdownHandle(self.shutdown.clone())
	}

	/// Receiver that flips to `true` once shutdown has been requested.
	pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
		self.shutdown.subscribe()
	}

	/// Run `task` alongside the accept loop. Shutdown waits for it before the
	/// store is closed, so it should watch [`Node::shutdown_signal`].
	pub fn spawn_background<F>(&self, task: F)
	where
		F: std::future::Future<Output = ()> + Send + 'static,
	{
		let handle = tokio::spawn(task);
		match self.background.lock() {
			Ok(mut tasks) => tasks.push(handle),
			Err(poisoned) => poisoned.into_inner().push(handle),
		}
	}

	/// Bind `addr` and serve until shutdown.
	pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("failed to bind {}", addr))?;
		self.serve(listener).await
	}

	/// Accept connections on `listener` until shutdown is triggered or accept
	/// fails hard. Either way the node ends in [`NodeState::Shutdown`] with
	/// the store closed.
	pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
		let mut shutdown = self.shutdown.subscribe();
		let mut connections = JoinSet::new();

		self.state.send_replace(NodeState::Listening);
		if let Ok(addr) = listener.local_addr() {
			info!("listening for sync calls on {}", addr);
		}

		let result = loop {
			if *shutdown.borrow_and_update() {
				break Ok(());
			}

			// Reap connections that already finished.
			while connections.try_join_next().is_some() {}

			tokio::select! {
				_ = shutdown.changed() => continue,
				accepted = tokio::time::timeout(self.accept_timeout, listener.accept()) => {
					match accepted {
						// Timeouts only exist so the loop can look at the shutdown flag.
						Err(_elapsed) => continue,
						Ok(Ok((stream, peer))) => {
							self.metrics.connections_accepted_total.inc();
							let node = Arc::clone(&self);
							let signal = self.shutdown.subscribe();
							connections.spawn(async move {
								node.serve_connection(stream, peer, signal).await;
							});
						}
						Ok(Err(e)) => {
							error!("accept failed: {}", e);
							break Err(anyhow::Error::new(e).context("accept failed"));
						}
					}
				}
			}
		};

		// No new connections from here on.
		drop(listener);
		self.shutdown.send_replace(true);

		debug!("draining {} open connections", connections.len());
		while let Some(joined) = connections.join_next().await {
			if let Err(e) = joined {
				warn!("connection task ended abnormally: {}", e);
			}
		}

		let background = match self.background.lock() {
			Ok(mut tasks) => std::mem::take(&mut *tasks),
			Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
		};
		for task in background {
			if let Err(e) = task.await {
				warn!("background task ended abnormally: {}", e);
			}
		}

		self.repo.close().await;
		self.state.send_replace(NodeState::Shutdown);
		info!("node shut down");
		result
	}

	async fn serve_connection(
		&self,
		stream: TcpStream,
		peer: SocketAddr,
		mut shutdown: watch::Receiver<bool>,
	) {
		debug!("connection from {}", peer);
		self.metrics.connections_active.inc();
		if let Err(e) = self.call_loop(stream, &mut shutdown).await {
			warn!("connection from {} failed: {}", peer, e);
		}
		self.metrics.connections_active.dec();
		debug!("connection from {} closed", peer);
	}

	/// One call at a time: the next request is not read until the previous
	/// response has been written.
	async fn call_loop(
		&self,
		stream: TcpStream,
		shutdown: &mut watch::Receiver<bool>,
	) -> Result<(), RpcError> {
		let (mut reader, mut writer) = stream.into_split();
		loop {
			if *shutdown.borrow_and_update() {
				return Ok(());
			}
			let request: Request = tokio::select! {
				frame = wire::read_frame(&mut reader) => match frame? {
					Some(request) => request,
					None => return Ok(()),
				},
				_ = shutdown.changed() => return Ok(()),
			};

			self.call_started();
			let response = self.methods.dispatch(request).await;
			self.call_finished();

			wire::write_frame(&mut writer, &response).await?;
		}
	}

	fn call_started(&self) {
		self.state.send_if_modified(|state| {
			let before = self.in_flight.fetch_add(1, Ordering::SeqCst);
			if before == 0 && *state == NodeState::Listening {
				*state = NodeState::Serving;
				true
			} else {
				false
			}
		});
	}

	fn call_finished(&self) {
		self.state.send_if_modified(|state| {
			let before = self.in_flight.fetch_sub(1, Ordering::SeqCst);
			if before == 1 && *state == NodeState::Serving {
				*state = NodeState::Listening;
				true
			} else {
				false
			}
		});
	}
}
