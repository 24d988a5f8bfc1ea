use prometheus::{
	HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// RPC facade
	pub rpc_calls_total: IntCounterVec,
	pub rpc_call_duration_seconds: HistogramVec,
	pub connections_accepted_total: IntCounter,
	pub connections_active: IntGauge,

	// Merge engine
	pub records_merged_total: IntCounterVec,

	// Node sync agent
	pub sync_cycles_total: IntCounter,
	pub sync_failures_total: IntCounter,
}

impl MetricsRegistry {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let rpc_calls_total = IntCounterVec::new(
			Opts::new("rpc_calls_total", "RPC calls handled, by method and outcome")
				.namespace("xpsync"),
			&["method", "outcome"],
		)?;

		let rpc_call_duration_seconds = HistogramVec::new(
			HistogramOpts::new(
				"rpc_call_duration_seconds",
				"Time spent serving one RPC call, including its store transaction",
			)
			.namespace("xpsync")
			.buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
			&["method"],
		)?;

		let connections_accepted_total = IntCounter::with_opts(
			Opts::new("connections_accepted_total", "Accepted RPC connections").namespace("xpsync"),
		)?;

		let connections_active = IntGauge::with_opts(
			Opts::new("connections_active", "RPC connections currently open").namespace("xpsync"),
		)?;

		let records_merged_total = IntCounterVec::new(
			Opts::new(
				"records_merged_total",
				"Records passed through the merge engine, by outcome",
			)
			.namespace("xpsync"),
			&["outcome"],
		)?;

		let sync_cycles_total = IntCounter::with_opts(
			Opts::new("sync_cycles_total", "Completed node sync cycles").namespace("xpsync"),
		)?;

		let sync_failures_total = IntCounter::with_opts(
			Opts::new("sync_failures_total", "Failed node sync cycles").namespace("xpsync"),
		)?;

		registry.register(Box::new(rpc_calls_total.clone()))?;
		registry.register(Box::new(rpc_call_duration_seconds.clone()))?;
		registry.register(Box::new(connections_accepted_total.clone()))?;
		registry.register(Box::new(connections_active.clone()))?;
		registry.register(Box::new(records_merged_total.clone()))?;
		registry.register(Box::new(sync_cycles_total.clone()))?;
		registry.register(Box::new(sync_failures_total.clone()))?;

		Ok(Self {
			registry,
			rpc_calls_total,
			rpc_call_duration_seconds,
			connections_accepted_total,
			connections_active,
			records_merged_total,
			sync_cycles_total,
			sync_failures_total,
		})
	}

	/// Render all metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		encoder
			.encode_to_string(&metric_families)
			.unwrap_or_else(|e| format!("# error encoding metrics: {}\n", e))
	}
}
