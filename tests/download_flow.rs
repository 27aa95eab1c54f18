//! End-to-end download flow through the REST API.
//!
//! Create a task over HTTP, let the outbox relay, broker, consumer and
//! execution engine run it against a mock origin, then fetch the content.

mod common;

use common::{ALICE_TOKEN, test_config, wait_for_status};
use serde_json::{Value, json};
use std::time::Duration;
use tempfile::tempdir;
use url_dl::{App, DownloadStatus, MetadataValue, TaskId};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn created_task_is_downloaded_and_served() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/y"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain")
                .set_body_string("hello from the origin"),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let dir = tempdir().unwrap();
    let running = App::new(test_config(dir.path()))
        .await
        .unwrap()
        .start()
        .await
        .unwrap();
    let base = format!("http://{}/api/v1", running.api_address().unwrap());
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/tasks", base))
        .bearer_auth(ALICE_TOKEN)
        .json(&json!({ "download_type": "http", "url": format!("{}/y", origin.uri()) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let created: Value = response.json().await.unwrap();
    assert_eq!(created["download_status"], "pending");
    let id = TaskId(created["id"].as_i64().unwrap());

    let task = wait_for_status(
        running.db(),
        id,
        DownloadStatus::Success,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(task.attempt, 1);
    assert_eq!(
        task.metadata.get("size-bytes"),
        Some(&MetadataValue::Integer(21))
    );

    let listed: Value = client
        .get(format!("{}/tasks", base))
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["total_count"], 1);
    assert_eq!(listed["tasks"][0]["download_status"], "success");

    let file = client
        .get(format!("{}/tasks/{}/file", base, id))
        .bearer_auth(ALICE_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(file.status(), reqwest::StatusCode::OK);
    assert_eq!(file.headers()["content-type"], "text/plain");
    assert_eq!(file.text().await.unwrap(), "hello from the origin");

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_download_records_the_error() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&origin)
        .await;

    let dir = tempdir().unwrap();
    let running = App::new(test_config(dir.path()))
        .await
        .unwrap()
        .start()
        .await
        .unwrap();

    let task = running
        .tasks()
        .create_download_task(
            common::ALICE,
            url_dl::DownloadType::Http,
            &format!("{}/missing", origin.uri()),
        )
        .await
        .unwrap();

    let task = wait_for_status(
        running.db(),
        task.id,
        DownloadStatus::Failed,
        Duration::from_secs(10),
    )
    .await;
    match task.metadata.get("error") {
        Some(MetadataValue::String(message)) => assert!(message.contains("404"), "{}", message),
        other => panic!("expected an error message, got {:?}", other),
    }

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn requests_without_a_valid_token_are_rejected() {
    let dir = tempdir().unwrap();
    let running = App::new(test_config(dir.path()))
        .await
        .unwrap()
        .start()
        .await
        .unwrap();
    let base = format!("http://{}/api/v1", running.api_address().unwrap());
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let response = client
        .get(format!("{}/tasks", base))
        .bearer_auth("nobody")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    running.shutdown().await.unwrap();
}
