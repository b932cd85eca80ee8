use crate::list_sync::{synchronize, ListChange};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tengine_engine::{EngineEvent, EngineHandle};
use tengine_storage::TransferStore;
use tengine_transfer::{Transfer, TransferStatus};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Where the model reads its snapshot from.
#[async_trait]
pub trait TransferSource: Send + Sync + 'static {
    async fn query(&self) -> Result<Vec<Transfer>>;
}

#[async_trait]
impl TransferSource for TransferStore {
    async fn query(&self) -> Result<Vec<Transfer>> {
        self.list_transfers().await
    }
}

#[async_trait]
impl TransferSource for EngineHandle {
    async fn query(&self) -> Result<Vec<Transfer>> {
        Ok(self.transfers().await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Null,
    Querying,
    Finished,
    Error,
}

/// What changed in the model after applying one posted query result.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUpdate {
    pub changes: Vec<ListChange<Transfer>>,
    pub status: ModelStatus,
    pub status_changed: bool,
    pub transfers_in_progress_changed: bool,
}

impl ModelUpdate {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.status_changed && !self.transfers_in_progress_changed
    }
}

struct AsyncState {
    pending: bool,
    running: bool,
    status: ModelStatus,
    rows: Option<Vec<Transfer>>,
    transfers_in_progress: usize,
    error: Option<String>,
    /// Set when a result lands in the slot, cleared when it is applied.
    posted: bool,
}

struct Shared {
    state: Mutex<AsyncState>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AsyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cached, observer-facing view of the transfer list.
///
/// [`refresh`](Self::refresh) never blocks: it marks a query as pending and
/// wakes the background worker, which keeps re-querying until no refresh
/// arrived during the last query. Results are handed over through a single
/// slot, so a slow consumer only ever sees the newest snapshot.
pub struct TransferListModel {
    source: Arc<dyn TransferSource>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    rows: Vec<Transfer>,
    status: ModelStatus,
    transfers_in_progress: usize,
    error: Option<String>,
}

impl TransferListModel {
    pub fn new(source: Arc<dyn TransferSource>) -> Self {
        Self {
            source,
            shared: Arc::new(Shared {
                state: Mutex::new(AsyncState {
                    pending: false,
                    running: false,
                    status: ModelStatus::Null,
                    rows: None,
                    transfers_in_progress: 0,
                    error: None,
                    posted: false,
                }),
                wake: Notify::new(),
            }),
            worker: None,
            rows: Vec::new(),
            status: ModelStatus::Null,
            transfers_in_progress: 0,
            error: None,
        }
    }

    pub fn rows(&self) -> &[Transfer] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Transfer> {
        self.rows.get(index)
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    /// Number of rows in the `Started` state as of the last applied result.
    pub fn transfers_in_progress(&self) -> usize {
        self.transfers_in_progress
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn refresh(&mut self) {
        let spawn = {
            let mut state = self.shared.lock();
            state.pending = true;
            state.status = ModelStatus::Querying;
            !std::mem::replace(&mut state.running, true)
        };
        self.status = ModelStatus::Querying;

        if spawn {
            self.worker = Some(tokio::spawn(run_worker(
                self.source.clone(),
                self.shared.clone(),
            )));
        }
    }

    /// Refreshes on events that change row content or membership.
    pub fn observe(&mut self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::ProgressChanged { .. }
            | EngineEvent::StatusChanged { .. }
            | EngineEvent::TransfersChanged => {
                self.refresh();
                true
            }
            EngineEvent::TransferMethodListChanged => false,
        }
    }

    /// Waits until the worker posts a result not yet applied, then applies
    /// it. Wake-ups left over from results already taken by
    /// [`apply_update`](Self::apply_update) are skipped.
    pub async fn next_update(&mut self) -> ModelUpdate {
        loop {
            if self.shared.lock().posted {
                return self.apply_update();
            }
            self.shared.wake.notified().await;
        }
    }

    /// Applies whatever the worker posted since the last call.
    pub fn apply_update(&mut self) -> ModelUpdate {
        let (rows, status, in_progress, error) = {
            let mut state = self.shared.lock();
            state.posted = false;
            (
                state.rows.take(),
                state.status,
                state.transfers_in_progress,
                state.error.take(),
            )
        };

        let changes = match rows {
            Some(rows) => synchronize(&mut self.rows, &rows),
            None => Vec::new(),
        };

        if error.is_some() {
            self.error = error;
        } else if status == ModelStatus::Finished {
            self.error = None;
        }

        let status_changed = status != self.status;
        self.status = status;
        let transfers_in_progress_changed = in_progress != self.transfers_in_progress;
        self.transfers_in_progress = in_progress;

        ModelUpdate {
            changes,
            status,
            status_changed,
            transfers_in_progress_changed,
        }
    }

    /// Waits for an in-flight query to finish and applies its result.
    pub async fn close(mut self) -> ModelUpdate {
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "transfer list worker ended abnormally");
            }
        }
        self.apply_update()
    }
}

async fn run_worker(source: Arc<dyn TransferSource>, shared: Arc<Shared>) {
    loop {
        {
            let mut state = shared.lock();
            if !state.pending {
                state.running = false;
                return;
            }
            state.pending = false;
        }

        let result = source.query().await;

        {
            let mut state = shared.lock();
            match result {
                Ok(rows) => {
                    state.transfers_in_progress = rows
                        .iter()
                        .filter(|row| row.status == TransferStatus::Started)
                        .count();
                    state.rows = Some(rows);
                    if !state.pending {
                        state.status = ModelStatus::Finished;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "transfer list query failed");
                    state.error = Some(format!("{err:#}"));
                    if !state.pending {
                        state.status = ModelStatus::Error;
                    }
                }
            }
            state.posted = true;
        }
        shared.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tengine_transfer::TransferType;

    struct Scripted {
        calls: AtomicUsize,
        rows: Mutex<Vec<Transfer>>,
        fail: bool,
    }

    #[async_trait]
    impl TransferSource for Scripted {
        async fn query(&self) -> Result<Vec<Transfer>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                anyhow::bail!("database is locked");
            }
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    fn transfer(id: i64, status: TransferStatus) -> Transfer {
        Transfer {
            transfer_id: id,
            transfer_type: TransferType::Download,
            status,
            progress: 0.0,
            timestamp: String::new(),
            display_name: format!("file-{id}"),
            application_icon: String::new(),
            thumbnail_icon: String::new(),
            service_icon: String::new(),
            url: String::new(),
            resource_name: String::new(),
            mime_type: String::new(),
            file_size: 0,
            plugin_id: String::new(),
            account_id: String::new(),
            strip_metadata: false,
            scale_percent: 0.0,
            cancel_supported: false,
            restart_supported: false,
            metadata: None,
            callback: None,
        }
    }

    /// Holds its first query until released; every query returns one row
    /// whose id is the call number.
    #[derive(Default)]
    struct Gated {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TransferSource for Gated {
        async fn query(&self) -> Result<Vec<Transfer>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 1 {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(vec![transfer(call as i64, TransferStatus::NotStarted)])
        }
    }

    fn scripted(rows: Vec<Transfer>, fail: bool) -> Arc<Scripted> {
        Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            rows: Mutex::new(rows),
            fail,
        })
    }

    #[tokio::test]
    async fn refresh_populates_rows_and_counts_started() {
        let source = scripted(
            vec![
                transfer(2, TransferStatus::Started),
                transfer(1, TransferStatus::Finished),
            ],
            false,
        );
        let mut model = TransferListModel::new(source.clone());
        assert_eq!(model.status(), ModelStatus::Null);

        model.refresh();
        assert_eq!(model.status(), ModelStatus::Querying);
        let update = model.next_update().await;

        assert_eq!(update.status, ModelStatus::Finished);
        assert!(update.status_changed);
        assert!(update.transfers_in_progress_changed);
        assert_eq!(update.changes.len(), 1);
        assert_eq!(model.len(), 2);
        assert_eq!(model.transfers_in_progress(), 1);
        assert_eq!(model.get(0).map(|t| t.transfer_id), Some(2));
    }

    #[tokio::test]
    async fn burst_of_refreshes_coalesces() {
        let source = scripted(vec![transfer(1, TransferStatus::NotStarted)], false);
        let mut model = TransferListModel::new(source.clone());

        for _ in 0..10 {
            model.refresh();
        }
        let update = model.close().await;

        assert_eq!(update.status, ModelStatus::Finished);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_during_a_query_trigger_exactly_one_more() {
        let source = Arc::new(Gated::default());
        let mut model = TransferListModel::new(source.clone());

        model.refresh();
        source.started.notified().await;
        for _ in 0..5 {
            model.refresh();
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        source.release.notify_one();
        let update = model.close().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(update.status, ModelStatus::Finished);
        assert_eq!(
            update.changes,
            vec![ListChange::Insert {
                index: 0,
                items: vec![transfer(2, TransferStatus::NotStarted)]
            }]
        );
    }

    #[tokio::test]
    async fn applying_directly_does_not_leave_a_spurious_update() {
        let source = scripted(vec![transfer(1, TransferStatus::NotStarted)], false);
        let mut model = TransferListModel::new(source.clone());
        model.refresh();

        let applied = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let update = model.apply_update();
                if update.status == ModelStatus::Finished {
                    break update;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker posts a result");
        assert_eq!(applied.changes.len(), 1);

        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(100), model.next_update())
                .await
                .is_err()
        );

        source.rows.lock().unwrap()[0].progress = 0.5;
        model.refresh();
        let update = model.next_update().await;
        assert!(matches!(
            update.changes.as_slice(),
            [ListChange::Update { index: 0, .. }]
        ));
    }

    #[tokio::test]
    async fn unchanged_requery_yields_no_row_changes() {
        let source = scripted(vec![transfer(1, TransferStatus::NotStarted)], false);
        let mut model = TransferListModel::new(source.clone());
        model.refresh();
        model.next_update().await;

        model.refresh();
        let update = model.next_update().await;
        assert!(update.is_empty());

        source.rows.lock().unwrap()[0].progress = 0.5;
        assert!(model.observe(&EngineEvent::ProgressChanged {
            transfer_id: 1,
            progress: 0.5
        }));
        let update = model.next_update().await;
        assert!(matches!(
            update.changes.as_slice(),
            [ListChange::Update { index: 0, .. }]
        ));
        assert!(!model.observe(&EngineEvent::TransferMethodListChanged));
    }

    #[tokio::test]
    async fn failing_query_reports_error_status() {
        let source = scripted(Vec::new(), true);
        let mut model = TransferListModel::new(source);
        model.refresh();
        let update = model.next_update().await;

        assert_eq!(update.status, ModelStatus::Error);
        assert!(update.changes.is_empty());
        assert_eq!(model.last_error(), Some("database is locked"));
    }
}
