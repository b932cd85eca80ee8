use std::sync::Arc;
use tempfile::TempDir;
use tengine_model::{ListChange, ModelStatus, TransferListModel};
use tengine_storage::{StorageConfig, TransferStore};
use tengine_transfer::{NewTransfer, TransferStatus, TransferType};

async fn open_store(dir: &TempDir) -> TransferStore {
    TransferStore::connect(&StorageConfig {
        sqlite_path: dir.path().join("transfers.db").to_string_lossy().into_owned(),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn model_follows_store_with_minimal_changes() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let first = store
        .create_transfer(&NewTransfer::new(TransferType::Download, "a.zip"))
        .await
        .unwrap();
    let second = store
        .create_transfer(&NewTransfer::new(TransferType::Sync, "calendar"))
        .await
        .unwrap();

    let mut model = TransferListModel::new(Arc::new(store.clone()));
    model.refresh();
    let update = model.next_update().await;
    assert_eq!(update.status, ModelStatus::Finished);
    let ids: Vec<_> = model.rows().iter().map(|t| t.transfer_id).collect();
    assert_eq!(ids, vec![second, first]);

    store.update_status(first, TransferStatus::Started).await.unwrap();
    store.update_progress(first, 0.4).await.unwrap();
    model.refresh();
    let update = model.next_update().await;
    assert_eq!(update.changes.len(), 1);
    match &update.changes[0] {
        ListChange::Update { index, items } => {
            assert_eq!(*index, 1);
            assert_eq!(items[0].progress, 0.4);
        }
        other => panic!("unexpected change {other:?}"),
    }
    assert_eq!(model.transfers_in_progress(), 1);
    assert!(update.transfers_in_progress_changed);

    let third = store
        .create_transfer(&NewTransfer::new(TransferType::Download, "b.zip"))
        .await
        .unwrap();
    store.remove_transfer(second).await.unwrap();
    model.refresh();
    let update = model.next_update().await;
    let ids: Vec<_> = model.rows().iter().map(|t| t.transfer_id).collect();
    assert_eq!(ids, vec![third, first]);
    assert!(update
        .changes
        .iter()
        .all(|change| !matches!(change, ListChange::Update { .. })));

    let last = model.close().await;
    assert!(last.changes.is_empty());
}
