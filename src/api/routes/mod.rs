//! Route handlers for the REST API
//!
//! - [`tasks`]: Download task management
//! - [`system`]: Health

use crate::types::{DownloadTask, DownloadType};
use serde::{Deserialize, Serialize};

mod system;
mod tasks;

pub use system::*;
pub use tasks::*;

// ============================================================================
// Query/Request Types (shared across handlers)
// ============================================================================

/// Request body for POST /tasks
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateTaskRequest {
    /// Source kind, e.g. `"http"`
    pub download_type: DownloadType,
    /// Source URL
    pub url: String,
}

/// Request body for PATCH /tasks/:id
#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateTaskRequest {
    /// Replacement source URL
    pub url: String,
}

/// Query parameters for GET /tasks
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ListTasksQuery {
    /// Number of tasks to skip (default: 0)
    pub offset: Option<u64>,
    /// Maximum number of tasks to return (default and upper bound: `api.max_page_size`)
    pub limit: Option<u64>,
}

/// Response for GET /tasks
#[derive(Debug, Deserialize, Serialize)]
pub struct TaskListResponse {
    /// Tasks on the requested page
    pub tasks: Vec<DownloadTask>,
    /// Number of tasks the account owns
    pub total_count: u64,
}
