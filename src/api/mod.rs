//! REST API server module
//!
//! A thin axum layer over [`DownloadTaskService`](crate::tasks::DownloadTaskService).
//! Task routes require a bearer token; the health check does not.

use crate::config::ApiConfig;
use crate::error::Error;
use crate::Result;
use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod error_response;
pub mod routes;
pub mod state;

pub use state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// All paths are under `/api/v1`.
///
/// ## Tasks (bearer token required)
/// - `POST /tasks` - Create a download task
/// - `GET /tasks` - List the caller's tasks (`offset`, `limit`)
/// - `GET /tasks/:id` - Get a task
/// - `PATCH /tasks/:id` - Change the URL of a pending task
/// - `DELETE /tasks/:id` - Delete a task and its content
/// - `GET /tasks/:id/file` - Stream the content of a finished task
///
/// ## System
/// - `GET /health` - Health check
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    // route_layer only wraps matched routes, so unknown paths stay 404
    let tasks = Router::new()
        .route("/tasks", get(routes::list_tasks).post(routes::create_task))
        .route(
            "/tasks/:id",
            get(routes::get_task)
                .patch(routes::update_task)
                .delete(routes::delete_task),
        )
        .route("/tasks/:id/file", get(routes::get_task_file))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            auth::require_bearer_token,
        ));

    let api = Router::new()
        .route("/health", get(routes::health_check))
        .merge(tasks)
        .with_state(state);

    let router = Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http());

    if config.cors_enabled {
        router.layer(build_cors_layer(&config.cors_origins))
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// `"*"` or an empty list allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address.
///
/// Runs until `shutdown` is cancelled, then stops accepting connections and
/// lets in-flight requests finish.
pub async fn start_api_server(
    state: AppState,
    config: ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(config.bind_address)
        .await
        .map_err(Error::Io)?;

    serve(listener, state, &config, shutdown).await
}

/// Serve the API on an already bound listener
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let address = listener.local_addr().map_err(Error::Io)?;
    let app = create_router(state, config);

    tracing::info!(address = %address, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
