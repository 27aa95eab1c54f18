//! Application state for the API server

use crate::identity::TokenResolver;
use crate::tasks::DownloadTaskService;
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request (Arc clones only).
#[derive(Clone)]
pub struct AppState {
    /// Task use cases
    pub tasks: Arc<DownloadTaskService>,

    /// Resolves bearer tokens to accounts
    pub tokens: Arc<dyn TokenResolver>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(tasks: Arc<DownloadTaskService>, tokens: Arc<dyn TokenResolver>) -> Self {
        Self { tasks, tokens }
    }
}
