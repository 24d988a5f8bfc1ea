use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::wire::{Request, Response};
use crate::observability::MetricsRegistry;
use crate::persist::{Experience, ExperienceRepo, MergeOutcome, StoreError};

pub const FULL_UPDATE: &str = "Messages.FullUpdate";
pub const PUSH: &str = "Messages.Push";
pub const UPDATE: &str = "Messages.Update";

/// Type-erased entry in a [`MethodTable`].
#[async_trait]
trait Handler: Send + Sync {
	async fn call(&self, params: Value) -> Result<Value, String>;
}

/// Decodes params into `Req`, runs the handler, encodes the `Resp`.
struct TypedHandler<Req, Resp, F> {
	f: F,
	_marker: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler for TypedHandler<Req, Resp, F>
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Resp, StoreError>> + Send + 'static,
{
	async fn call(&self, params: Value) -> Result<Value, String> {
		let req: Req =
			serde_json::from_value(params).map_err(|e| format!("invalid params: {}", e))?;
		let resp = (self.f)(req).await.map_err(|e| e.to_string())?;
		serde_json::to_value(resp).map_err(|e| format!("could not encode result: {}", e))
	}
}

/// Operation name to handler map, filled once at startup.
pub struct MethodTable {
	handlers: HashMap<&'static str, Box<dyn Handler>>,
	metrics: Arc<MetricsRegistry>,
}

impl MethodTable {
	pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			handlers: HashMap::new(),
			metrics,
		}
	}

	/// Register `f` under `name`. A later registration for the same name
	/// replaces the earlier one.
	pub fn register<Req, Resp, F, Fut>(&mut self, name: &'static str, f: F) -> &mut Self
	where
		Req: DeserializeOwned + Send + 'static,
		Resp: Serialize + Send + 'static,
		F: Fn(Req) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Resp, StoreError>> + Send + 'static,
	{
		self.handlers.insert(
			name,
			Box::new(TypedHandler {
				f,
				_marker: PhantomData,
			}),
		);
		self
	}

	pub fn methods(&self) -> Vec<&'static str> {
		let mut names: Vec<_> = self.handlers.keys().copied().collect();
		names.sort_unstable();
		names
	}

	/// Run one request to completion. Failures become error responses; the
	/// connection stays usable.
	pub async fn dispatch(&self, request: Request) -> Response {
		let Some(handler) = self.handlers.get(request.method.as_str()) else {
			warn!("call to unknown method `{}`", request.method);
			self.metrics
				.rpc_calls_total
				.with_label_values(&["unknown", "error"])
				.inc();
			return Response::err(request.id, format!("unknown method `{}`", request.method));
		};

		let start = Instant::now();
		let result = handler.call(request.params).await;
		self.metrics
			.rpc_call_duration_seconds
			.with_label_values(&[request.method.as_str()])
			.observe(start.elapsed().as_secs_f64());

		match result {
			Ok(value) => {
				self.metrics
					.rpc_calls_total
					.with_label_values(&[request.method.as_str(), "ok"])
					.inc();
				Response::ok(request.id, value)
			}
			Err(message) => {
				warn!("{} failed: {}", request.method, message);
				self.metrics
					.rpc_calls_total
					.with_label_values(&[request.method.as_str(), "error"])
					.inc();
				Response::err(request.id, message)
			}
		}
	}
}

fn count_outcomes(metrics: &MetricsRegistry, outcomes: &[MergeOutcome]) {
	for outcome in outcomes {
		metrics
			.records_merged_total
			.with_label_values(&[outcome.as_str()])
			.inc();
	}
}

/// The sync facade: `FullUpdate`, `Push` and `Update` over `repo`.
pub fn messages(repo: Arc<dyn ExperienceRepo>, metrics: Arc<MetricsRegistry>) -> MethodTable {
	let mut table = MethodTable::new(metrics.clone());

	let full_update_repo = repo.clone();
	table.register(FULL_UPDATE, move |_: ()| {
		let repo = full_update_repo.clone();
		async move {
			let xps = repo.get_all().await?;
			debug!("FullUpdate returning {} records", xps.len());
			Ok::<_, StoreError>(xps)
		}
	});

	// Push reports failure in-band: the caller only learns whether the batch
	// committed.
	let push_repo = repo.clone();
	let push_metrics = metrics.clone();
	table.register(PUSH, move |xps: Vec<Experience>| {
		let repo = push_repo.clone();
		let metrics = push_metrics.clone();
		async move {
			let committed = match repo.update_many(&xps).await {
				Ok(outcomes) => {
					count_outcomes(&metrics, &outcomes);
					true
				}
				Err(e) => {
					warn!("Push of {} records rolled back: {}", xps.len(), e);
					false
				}
			};
			Ok::<_, StoreError>(committed)
		}
	});

	let update_repo = repo;
	table.register(UPDATE, move |xps: Vec<Experience>| {
		let repo = update_repo.clone();
		let metrics = metrics.clone();
		async move {
			let outcomes = repo.update_many(&xps).await?;
			count_outcomes(&metrics, &outcomes);
			Ok::<_, StoreError>(())
		}
	});

	table
}
