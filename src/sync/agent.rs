use anyhow::{Context, Result, bail};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use crate::observability::MetricsRegistry;
use crate::persist::{ExperienceRepo, MergeOutcome};
use crate::rpc::SyncClient;

/// What one sync cycle moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
	/// Local changes the master accepted.
	pub pushed: usize,
	/// Records received in the master's snapshot.
	pub pulled: usize,
	/// Snapshot records that replaced the local value.
	pub applied: usize,
}

/// Keeps a node's store in step with the master.
///
/// Each cycle pushes the node's changed records, then pulls the master's
/// full snapshot and merges it locally.
pub struct SyncAgent {
	/// This node's identifier, for log lines
	node_id: String,
	/// Master address, `host:port`
	master: String,
	interval: Duration,
	repo: Arc<dyn ExperienceRepo>,
	metrics: Arc<MetricsRegistry>,
}

impl SyncAgent {
	pub fn new(
		node_id: impl Into<String>,
		master: impl Into<String>,
		interval: Duration,
		repo: Arc<dyn ExperienceRepo>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			node_id: node_id.into(),
			master: master.into(),
			interval,
			repo,
			metrics,
		}
	}

	/// Run sync cycles until `shutdown` turns `true`. A failed cycle is
	/// logged and retried on the next tick.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		info!("sync agent {} following master {}", self.node_id, self.master);
		let mut tick = interval(self.interval);
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			if *shutdown.borrow_and_update() {
				break;
			}
			tokio::select! {
				_ = tick.tick() => {}
				changed = shutdown.changed() => {
					if changed.is_err() {
						break;
					}
					continue;
				}
			}

			match self.sync_once().await {
				Ok(report) => {
					self.metrics.sync_cycles_total.inc();
					debug!(
						"sync with {} done: pushed={} pulled={} applied={}",
						self.master, report.pushed, report.pulled, report.applied
					);
				}
				Err(e) => {
					self.metrics.sync_failures_total.inc();
					error!("sync cycle with {} failed: {:#}", self.master, e);
				}
			}
		}
		info!("sync agent {} stopped", self.node_id);
	}

	/// One push-then-pull exchange with the master.
	pub async fn sync_once(&self) -> Result<SyncReport> {
		let mut client = SyncClient::connect(&self.master)
			.await
			.with_context(|| format!("failed to connect to master {}", self.master))?;

		let mut report = SyncReport::default();

		let changed = self
			.repo
			.get_changed()
			.await
			.context("failed to read local changes")?;
		if !changed.is_empty() {
			let committed = client.push(&changed).await.context("push failed")?;
			if !committed {
				bail!("master rolled back a push of {} records", changed.len());
			}
			// The master now has these timestamps; recording them moves each
			// key's watermark up so the records stop showing as changed.
			self.repo
				.update_many(&changed)
				.await
				.context("failed to record pushed watermarks")?;
			report.pushed = changed.len();
		}

		let snapshot = client.full_update().await.context("full update failed")?;
		let outcomes = self
			.repo
			.update_many(&snapshot)
			.await
			.context("failed to merge master snapshot")?;
		report.pulled = snapshot.len();
		report.applied = outcomes
			.iter()
			.filter(|o| **o == MergeOutcome::Applied)
			.count();

		Ok(report)
	}
}
