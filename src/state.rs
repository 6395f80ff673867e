use std::sync::Arc;

use crate::{backend::ChatModel, metrics::AppMetrics};

#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn ChatModel>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            metrics: Arc::new(AppMetrics::new()),
        }
    }
}
