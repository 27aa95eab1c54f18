//! Download task handlers.
//!
//! Every handler runs behind the bearer-token middleware and acts on behalf
//! of the resolved account.

use super::{CreateTaskRequest, ListTasksQuery, TaskListResponse, UpdateTaskRequest};
use crate::api::AppState;
use crate::downloader::{METADATA_CONTENT_TYPE, METADATA_FILE_NAME};
use crate::error::Error;
use crate::types::{AccountId, MetadataValue, TaskId};
use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

/// POST /tasks - Create a download task
pub async fn create_task(
    State(state): State<AppState>,
    Extension(account): Extension<AccountId>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, Error> {
    let task = state
        .tasks
        .create_download_task(account, request.download_type, &request.url)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /tasks - List the caller's tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(account): Extension<AccountId>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, Error> {
    let page = state
        .tasks
        .get_download_task_list(
            account,
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(u64::MAX),
        )
        .await?;
    Ok(Json(TaskListResponse {
        tasks: page.tasks,
        total_count: page.total_count,
    }))
}

/// GET /tasks/:id - Get one task
pub async fn get_task(
    State(state): State<AppState>,
    Extension(account): Extension<AccountId>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, Error> {
    let task = state.tasks.get_download_task(account, id).await?;
    Ok(Json(task))
}

/// PATCH /tasks/:id - Change the URL of a pending task
pub async fn update_task(
    State(state): State<AppState>,
    Extension(account): Extension<AccountId>,
    Path(id): Path<TaskId>,
    Json(request): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, Error> {
    let task = state
        .tasks
        .update_download_task(account, id, &request.url)
        .await?;
    Ok(Json(task))
}

/// DELETE /tasks/:id - Delete a task and its content
pub async fn delete_task(
    State(state): State<AppState>,
    Extension(account): Extension<AccountId>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, Error> {
    state.tasks.delete_download_task(account, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /tasks/:id/file - Stream the downloaded content
///
/// Content type and file name come from the metadata recorded by the
/// downloader, falling back to `application/octet-stream`.
pub async fn get_task_file(
    State(state): State<AppState>,
    Extension(account): Extension<AccountId>,
    Path(id): Path<TaskId>,
) -> Result<Response, Error> {
    let file = state.tasks.open_download_task_file(account, id).await?;

    let content_type = match file.task.metadata.get(METADATA_CONTENT_TYPE) {
        Some(MetadataValue::String(value)) => HeaderValue::from_str(value).ok(),
        _ => None,
    }
    .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    let mut response = Body::from_stream(ReaderStream::new(file.reader)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size));

    if let Some(MetadataValue::String(name)) = file.task.metadata.get(METADATA_FILE_NAME)
        && let Ok(value) = HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            name.replace(['"', '\\'], "_")
        ))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}
