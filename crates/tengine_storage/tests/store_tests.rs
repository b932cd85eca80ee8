use tempfile::TempDir;
use tengine_storage::{StorageConfig, TransferStore, SCHEMA_VERSION};
use tengine_transfer::{
    CallbackDescriptor, NewTransfer, TransferMetadata, TransferStatus, TransferType,
};

async fn open_store(dir: &TempDir) -> TransferStore {
    let path = dir.path().join("transfers.db");
    TransferStore::connect(&StorageConfig {
        sqlite_path: path.to_string_lossy().into_owned(),
    })
    .await
    .expect("store opens")
}

fn download(name: &str) -> NewTransfer {
    let mut transfer = NewTransfer::new(TransferType::Download, name);
    transfer.url = format!("file:///home/user/Downloads/{name}");
    transfer.mime_type = "image/jpeg".into();
    transfer.file_size = 1024;
    transfer
}

#[tokio::test]
async fn created_transfer_reads_back_with_callback_and_metadata() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut new_transfer = download("photo.jpg").with_callback(Some(CallbackDescriptor::new(
        "org.example.browser",
        "/browser",
        "org.example.browser",
        "cancelDownload",
        "restartDownload",
    )));
    new_transfer.metadata = Some(TransferMetadata {
        title: "Photo".into(),
        description: "from the web".into(),
    });

    let id = store.create_transfer(&new_transfer).await.unwrap();
    assert!(id > 0);

    let transfer = store.get_transfer(id).await.unwrap().expect("row exists");
    assert_eq!(transfer.status, TransferStatus::NotStarted);
    assert_eq!(transfer.progress, 0.0);
    assert_eq!(transfer.display_name, "photo.jpg");
    assert!(transfer.cancel_supported);
    assert!(transfer.restart_supported);
    assert_eq!(transfer.metadata.unwrap().title, "Photo");
    assert_eq!(
        store.callback(id).await.unwrap().unwrap().restart_method,
        "restartDownload"
    );
    assert_eq!(
        store.transfer_type(id).await.unwrap(),
        Some(TransferType::Download)
    );
}

#[tokio::test]
async fn ids_increase_and_list_is_newest_first() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let first = store.create_transfer(&download("a")).await.unwrap();
    let second = store.create_transfer(&download("b")).await.unwrap();
    store.remove_transfer(second).await.unwrap();
    let third = store.create_transfer(&download("c")).await.unwrap();

    assert!(first < second && second < third);
    let ids: Vec<_> = store
        .list_transfers()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.transfer_id)
        .collect();
    assert_eq!(ids, vec![third, first]);
}

#[tokio::test]
async fn status_writes_pin_progress() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let id = store.create_transfer(&download("f")).await.unwrap();

    store.update_status(id, TransferStatus::Started).await.unwrap();
    store.update_progress(id, 0.5).await.unwrap();
    assert_eq!(store.get_transfer(id).await.unwrap().unwrap().progress, 0.5);

    store.update_status(id, TransferStatus::Finished).await.unwrap();
    store.update_progress(id, 0.3).await.unwrap();
    let finished = store.get_transfer(id).await.unwrap().unwrap();
    assert_eq!(finished.status, TransferStatus::Finished);
    assert_eq!(finished.progress, 1.0);

    let other = store.create_transfer(&download("g")).await.unwrap();
    store.update_status(other, TransferStatus::Started).await.unwrap();
    store.update_progress(other, 0.8).await.unwrap();
    store.update_status(other, TransferStatus::Canceled).await.unwrap();
    assert_eq!(store.get_transfer(other).await.unwrap().unwrap().progress, 0.0);
}

#[tokio::test]
async fn removing_a_transfer_cascades() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let id = store
        .create_transfer(&download("f").with_callback(Some(CallbackDescriptor::new(
            "svc", "/p", "iface", "cancel", "",
        ))))
        .await
        .unwrap();

    assert!(store.remove_transfer(id).await.unwrap());
    assert!(store.callback(id).await.unwrap().is_none());
    assert!(store.get_transfer(id).await.unwrap().is_none());
    assert!(!store.remove_transfer(id).await.unwrap());
}

#[tokio::test]
async fn failed_siblings_leave_one_record() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut failed = Vec::new();
    for _ in 0..3 {
        let id = store
            .create_transfer(&NewTransfer::new(TransferType::Sync, "mail"))
            .await
            .unwrap();
        store.update_status(id, TransferStatus::Interrupted).await.unwrap();
        failed.push(id);
    }
    let other = store
        .create_transfer(&NewTransfer::new(TransferType::Sync, "calendar"))
        .await
        .unwrap();
    store.update_status(other, TransferStatus::Interrupted).await.unwrap();

    let latest = *failed.last().unwrap();
    let removed = store
        .remove_failed_siblings(latest, TransferType::Sync)
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let remaining: Vec<_> = store
        .list_transfers()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.transfer_id)
        .collect();
    assert_eq!(remaining, vec![other, latest]);
}

#[tokio::test]
async fn clear_and_recovery_only_touch_their_states() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let not_started = store.create_transfer(&download("a")).await.unwrap();
    let started = store.create_transfer(&download("b")).await.unwrap();
    store.update_status(started, TransferStatus::Started).await.unwrap();
    let finished = store.create_transfer(&download("c")).await.unwrap();
    store.update_status(finished, TransferStatus::Finished).await.unwrap();

    assert_eq!(store.interrupt_live_transfers().await.unwrap(), 2);
    assert_eq!(
        store.transfer_status(not_started).await.unwrap(),
        Some(TransferStatus::Interrupted)
    );
    assert_eq!(
        store.transfer_status(started).await.unwrap(),
        Some(TransferStatus::Interrupted)
    );

    let kept = store.create_transfer(&download("d")).await.unwrap();
    assert_eq!(store.clear_terminal().await.unwrap(), 3);
    let ids: Vec<_> = store
        .list_transfers()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.transfer_id)
        .collect();
    assert_eq!(ids, vec![kept]);
}

#[tokio::test]
async fn schema_version_mismatch_recreates_tables() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store.create_transfer(&download("old")).await.unwrap();

    sqlx::query("PRAGMA user_version = 99")
        .execute(store.pool())
        .await
        .unwrap();
    store.migrate().await.unwrap();

    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
    assert!(store.list_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn media_item_is_rebuilt_from_upload_row() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut upload = NewTransfer::new(TransferType::Upload, "holiday.jpg");
    upload.url = "file:///pictures/holiday.jpg".into();
    upload.plugin_id = "example-share".into();
    upload.scale_percent = 50.0;
    upload.metadata = Some(TransferMetadata {
        title: "Holiday".into(),
        description: String::new(),
    });
    let id = store.create_transfer(&upload).await.unwrap();

    let item = store.media_item(id).await.unwrap().unwrap();
    assert_eq!(item.url, "file:///pictures/holiday.jpg");
    assert_eq!(item.plugin_id, "example-share");
    assert_eq!(item.title, "Holiday");
    assert_eq!(item.scale_percent, 50.0);
}
