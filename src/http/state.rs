use crate::worker::AudioWorker;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The worker whose status is served
    pub worker: Arc<AudioWorker>,
}

impl AppState {
    pub fn new(worker: Arc<AudioWorker>) -> Self {
        Self { worker }
    }
}
