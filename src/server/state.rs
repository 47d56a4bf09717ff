use crate::lookup::ResolutionEngine;
use crate::metrics::Metrics;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<ResolutionEngine>,
    pub metrics: Arc<Metrics>,
    /// Field list used when a request has no `fields` parameter.
    pub collected_fields: Option<String>,
}
