use std::sync::Arc;

use crate::observability::MetricsRegistry;
use crate::persist::ExperienceRepo;

/// Application state passed to the admin handlers via Axum's `State`
/// extractor. Shares the node's store and metrics rather than owning them.
#[derive(Clone)]
pub struct AppState {
	pub repo: Arc<dyn ExperienceRepo>,
	pub metrics: Arc<MetricsRegistry>,
}
