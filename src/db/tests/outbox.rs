use super::{http_task, open_test_db};

#[tokio::test]
async fn test_outbox_event_commits_with_task() {
    let (db, _dir) = open_test_db().await;

    let mut tx = db.begin().await.unwrap();
    let id = tx.create_task(&http_task(1, "http://x/y")).await.unwrap();
    let payload = format!(r#"{{"id":{}}}"#, id);
    tx.enqueue_outbox_event("download_task_created", &payload)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let events = db.list_undelivered_outbox_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, "download_task_created");
    assert_eq!(events[0].payload, payload);
    assert!(events[0].delivered_at.is_none());

    db.close().await;
}

#[tokio::test]
async fn test_outbox_event_rolls_back_with_task() {
    let (db, _dir) = open_test_db().await;

    {
        let mut tx = db.begin().await.unwrap();
        tx.create_task(&http_task(1, "http://x/y")).await.unwrap();
        tx.enqueue_outbox_event("download_task_created", r#"{"id":1}"#)
            .await
            .unwrap();
        tx.rollback().await.unwrap();
    }

    assert_eq!(db.count_outbox_events().await.unwrap(), 0);

    db.close().await;
}

#[tokio::test]
async fn test_undelivered_events_in_write_order() {
    let (db, _dir) = open_test_db().await;

    for i in 0..4 {
        let mut tx = db.begin().await.unwrap();
        tx.enqueue_outbox_event("t", &i.to_string()).await.unwrap();
        tx.commit().await.unwrap();
    }

    let events = db.list_undelivered_outbox_events(3).await.unwrap();
    let payloads: Vec<_> = events.iter().map(|e| e.payload.as_str()).collect();
    assert_eq!(payloads, vec!["0", "1", "2"]);

    db.mark_outbox_event_delivered(events[0].id).await.unwrap();
    db.mark_outbox_event_delivered(events[1].id).await.unwrap();

    let remaining = db.list_undelivered_outbox_events(10).await.unwrap();
    let payloads: Vec<_> = remaining.iter().map(|e| e.payload.as_str()).collect();
    assert_eq!(payloads, vec!["2", "3"]);
    assert_eq!(db.count_undelivered_outbox_events().await.unwrap(), 2);

    db.close().await;
}

#[tokio::test]
async fn test_purge_removes_only_old_delivered_events() {
    let (db, _dir) = open_test_db().await;

    for i in 0..3 {
        let mut tx = db.begin().await.unwrap();
        tx.enqueue_outbox_event("t", &i.to_string()).await.unwrap();
        tx.commit().await.unwrap();
    }
    let events = db.list_undelivered_outbox_events(10).await.unwrap();
    db.mark_outbox_event_delivered(events[0].id).await.unwrap();

    // Cutoff in the past keeps everything
    assert_eq!(db.purge_delivered_outbox_events(0).await.unwrap(), 0);

    let future = chrono::Utc::now().timestamp() + 60;
    assert_eq!(db.purge_delivered_outbox_events(future).await.unwrap(), 1);
    assert_eq!(db.count_outbox_events().await.unwrap(), 2);
    assert_eq!(db.count_undelivered_outbox_events().await.unwrap(), 2);

    db.close().await;
}
