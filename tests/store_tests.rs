use chrono::{Duration, Utc};
use jobrelay::store::{FileStatusStore, MemoryStatusStore, StatusRecord, StatusStore, TerminalStatus};

#[tokio::test]
async fn test_file_store_round_trips_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStatusStore::open(dir.path()).await.unwrap();
    let scheduled = Utc::now();
    let record = StatusRecord::success("j1", scheduled, scheduled + Duration::seconds(3));

    store.upsert(record.clone()).await.unwrap();

    assert_eq!(store.get("j1").await.unwrap(), Some(record));
    assert!(dir.path().join("j1.json").exists());
}

#[tokio::test]
async fn test_file_store_upsert_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStatusStore::open(dir.path()).await.unwrap();
    let now = Utc::now();

    store
        .upsert(StatusRecord::error("j1", "worker lost: w1", now, now))
        .await
        .unwrap();
    store
        .upsert(StatusRecord::success("j1", now, now + Duration::seconds(1)))
        .await
        .unwrap();

    let record = store.get("j1").await.unwrap().unwrap();
    assert_eq!(record.status, TerminalStatus::Success);
    assert!(record.error_message.is_empty());

    // only the record itself, no temp files left behind
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_file_store_missing_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStatusStore::open(dir.path()).await.unwrap();
    assert!(store.get("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_store_creates_directory_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a").join("b");
    let now = Utc::now();

    {
        let store = FileStatusStore::open(&nested).await.unwrap();
        store
            .upsert(StatusRecord::error("job/with/slashes", "fetch failed: 404", now, now))
            .await
            .unwrap();
    }

    let reopened = FileStatusStore::open(&nested).await.unwrap();
    let record = reopened.get("job/with/slashes").await.unwrap().unwrap();
    assert_eq!(record.error_message, "fetch failed: 404");
}

#[tokio::test]
async fn test_file_store_record_is_plain_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStatusStore::open(dir.path()).await.unwrap();
    let now = Utc::now();
    store
        .upsert(StatusRecord::error("j1", "run failed: exit code: Some(1)", now, now))
        .await
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("j1.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["job_id"], "j1");
    assert_eq!(value["status"], "error");
    assert_eq!(value["error_message"], "run failed: exit code: Some(1)");
}

#[tokio::test]
async fn test_memory_store_lists_sorted() {
    let store = MemoryStatusStore::new();
    let now = Utc::now();
    store.upsert(StatusRecord::success("b", now, now)).await.unwrap();
    store.upsert(StatusRecord::success("a", now, now)).await.unwrap();
    store.upsert(StatusRecord::error("b", "x", now, now)).await.unwrap();

    let all = store.all().await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].job_id, "a");
    assert_eq!(all[1].status, TerminalStatus::Error);
}
