//! # url-dl
//!
//! Durable, asynchronous URL download tasks backed by SQLite.
//!
//! A caller creates a download task; the task row and a task-created event are
//! committed together, the event is relayed to a message broker, and a consumer
//! hands it to the execution engine, which downloads the URL into blob storage
//! under the task's row lock. Two cron jobs make the system converge after
//! crashes and lost messages: one re-dispatches every Pending task, the other
//! resets Downloading and Failed tasks to Pending.
//!
//! ## Task lifecycle
//!
//! ```text
//! Pending -> Downloading -> Success
//!                        -> Failed
//! Downloading, Failed -> Pending   (recovery only)
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use url_dl::{App, Config, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!
//!     let running = App::new(config).await?.start().await?;
//!
//!     // Serve until SIGTERM/SIGINT
//!     run_with_shutdown(running).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Application wiring and lifecycle
pub mod app;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Task dispatch
pub mod dispatcher;
/// Pluggable downloaders
pub mod downloader;
/// Download task execution
pub mod engine;
/// Error types
pub mod error;
/// Bearer token resolution
pub mod identity;
/// Message broker, event wire format and consumer
pub mod mq;
/// Outbox relay
pub mod outbox_relay;
/// Recovery jobs
pub mod recovery;
/// Retry logic with exponential backoff
pub mod retry;
/// Cron scheduling of the recovery jobs
pub mod scheduler;
/// Blob storage for downloaded content
pub mod storage;
/// Download task use cases
pub mod tasks;
/// Core types
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use app::{App, RunningApp};
pub use config::Config;
pub use db::Database;
pub use engine::{ExecutionEngine, ExecutionOutcome};
pub use error::{
    ApiError, BrokerError, DatabaseError, DownloadError, Error, ErrorDetail, Result,
    StorageError, ToHttpStatus,
};
pub use tasks::DownloadTaskService;
pub use types::{
    AccountId, DownloadStatus, DownloadTask, DownloadType, Metadata, MetadataValue,
    TaskCreatedEvent, TaskId,
};

/// Run a started application until a termination signal arrives, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use url_dl::{App, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let running = App::new(Config::default()).await?.start().await?;
///     run_with_shutdown(running).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(app: RunningApp) -> Result<()> {
    wait_for_signal().await;
    app.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
