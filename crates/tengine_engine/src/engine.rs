use crate::activity::ActivityMonitor;
use crate::error::EngineError;
use crate::notification::{Notification, NotificationEvent, Notifier, RemoteAction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tengine_callback::CallbackBridge;
use tengine_plugins::{
    PluginInfoResult, PluginLoader, PluginRegistry, UploadCapability, UploadEvent,
    UploadEventKind, UploadEventSink,
};
use tengine_storage::TransferStore;
use tengine_transfer::{
    CallbackDescriptor, CallbackMethod, MediaItem, NewTransfer, PluginDescriptor, Transfer,
    TransferId, TransferStatus, TransferType, UploadContent,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ProgressChanged {
        transfer_id: TransferId,
        progress: f64,
    },
    StatusChanged {
        transfer_id: TransferId,
        status: TransferStatus,
    },
    TransfersChanged,
    TransferMethodListChanged,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub activity_expiry: Duration,
    pub plugin_debounce: Duration,
    pub notifications_enabled: bool,
    pub group_action: Option<RemoteAction>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            activity_expiry: crate::activity::DEFAULT_ACTIVITY_EXPIRY,
            plugin_debounce: tengine_plugins::DEFAULT_RESCAN_DEBOUNCE,
            notifications_enabled: true,
            group_action: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UploadRequest {
    pub source: String,
    pub plugin_id: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub strip_metadata: bool,
    #[serde(default)]
    pub user_data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloadRequest {
    pub display_name: String,
    #[serde(default)]
    pub application_icon: String,
    #[serde(default)]
    pub service_icon: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub expected_file_size: i64,
    #[serde(default)]
    pub callback: Option<CallbackDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    pub display_name: String,
    #[serde(default)]
    pub application_icon: String,
    #[serde(default)]
    pub service_icon: String,
    #[serde(default)]
    pub callback: Option<CallbackDescriptor>,
}

/// Receivers the run loop must drain for the engine to make progress.
pub struct EngineChannels {
    pub upload_events: mpsc::UnboundedReceiver<UploadEvent>,
    pub plugin_infos: mpsc::UnboundedReceiver<PluginInfoResult>,
}

struct LiveUpload {
    instance: u64,
    url: String,
    capability: Box<dyn UploadCapability>,
}

pub struct TransferEngine {
    store: TransferStore,
    registry: PluginRegistry,
    callbacks: Arc<dyn CallbackBridge>,
    notifier: Arc<dyn Notifier>,
    activity: ActivityMonitor,
    uploads: HashMap<TransferId, LiveUpload>,
    /// Downloads and syncs created but not started yet.
    awaiting_start: HashSet<TransferId>,
    next_instance: u64,
    upload_tx: mpsc::UnboundedSender<UploadEvent>,
    types: HashMap<TransferId, TransferType>,
    events: broadcast::Sender<EngineEvent>,
    notifications_enabled: bool,
    group_action: Option<RemoteAction>,
    group_counts: HashMap<NotificationEvent, usize>,
}

impl TransferEngine {
    pub fn new(
        store: TransferStore,
        loader: Arc<dyn PluginLoader>,
        callbacks: Arc<dyn CallbackBridge>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> (Self, EngineChannels) {
        let (registry, plugin_infos) = PluginRegistry::new(loader, config.plugin_debounce);
        let (upload_tx, upload_events) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = Self {
            store,
            registry,
            callbacks,
            notifier,
            activity: ActivityMonitor::new(config.activity_expiry),
            uploads: HashMap::new(),
            awaiting_start: HashSet::new(),
            next_instance: 0,
            upload_tx,
            types: HashMap::new(),
            events,
            notifications_enabled: config.notifications_enabled,
            group_action: config.group_action,
            group_counts: HashMap::new(),
        };
        (
            engine,
            EngineChannels {
                upload_events,
                plugin_infos,
            },
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.events.clone()
    }

    /// Loads a capability for `request.plugin_id` and starts uploading the
    /// file at `request.source`.
    pub async fn create_upload(&mut self, request: UploadRequest) -> Result<TransferId, EngineError> {
        let capability = self.registry.load_capability(&request.plugin_id)?;

        let local_path = request
            .source
            .strip_prefix("file://")
            .unwrap_or(&request.source)
            .to_string();
        let file_size = match tokio::fs::metadata(&local_path).await {
            Ok(metadata) => metadata.len() as i64,
            Err(err) => {
                warn!(source = %request.source, error = %err, "upload source is not readable");
                0
            }
        };

        let mut item = MediaItem {
            url: request.source,
            resource_name: Path::new(&local_path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mime_type: request.mime_type,
            file_size,
            plugin_id: request.plugin_id,
            strip_metadata: request.strip_metadata,
            ..Default::default()
        };
        item.apply_user_data(request.user_data);
        self.dispatch_new_upload(item, capability).await
    }

    /// Like `create_upload`, for data that never touched disk.
    pub async fn upload_content(
        &mut self,
        content: UploadContent,
        plugin_id: String,
        user_data: Map<String, Value>,
    ) -> Result<TransferId, EngineError> {
        let capability = self.registry.load_capability(&plugin_id)?;

        let mut item = MediaItem {
            resource_name: content.name,
            mime_type: content.mime_type,
            thumbnail_icon: content.icon,
            file_size: content.data.len() as i64,
            content: Some(content.data),
            plugin_id,
            ..Default::default()
        };
        item.apply_user_data(user_data);
        self.dispatch_new_upload(item, capability).await
    }

    pub async fn create_download(&mut self, request: DownloadRequest) -> Result<TransferId, EngineError> {
        let mut transfer = NewTransfer::new(TransferType::Download, request.display_name)
            .with_callback(request.callback);
        transfer.resource_name = request
            .url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        transfer.url = request.url;
        transfer.application_icon = request.application_icon;
        transfer.service_icon = request.service_icon;
        transfer.mime_type = request.mime_type;
        transfer.file_size = request.expected_file_size;
        self.create_external(transfer).await
    }

    pub async fn create_sync(&mut self, request: SyncRequest) -> Result<TransferId, EngineError> {
        let mut transfer = NewTransfer::new(TransferType::Sync, request.display_name)
            .with_callback(request.callback);
        transfer.application_icon = request.application_icon;
        transfer.service_icon = request.service_icon;
        self.create_external(transfer).await
    }

    /// Moves an externally driven job to Started.
    pub async fn start(&mut self, transfer_id: TransferId) -> Result<(), EngineError> {
        let transfer_type = self.transfer_type(transfer_id).await?;
        if transfer_type == TransferType::Upload {
            return Err(EngineError::transition(
                transfer_id,
                "uploads are started by their plugin",
            ));
        }

        let status = self.status(transfer_id).await?;
        if !matches!(
            status,
            TransferStatus::NotStarted | TransferStatus::Canceled | TransferStatus::Interrupted
        ) {
            return Err(EngineError::transition(
                transfer_id,
                format!("cannot start from {status:?}"),
            ));
        }

        self.store.update_status(transfer_id, TransferStatus::Started).await?;
        self.awaiting_start.remove(&transfer_id);
        self.activity.touch(transfer_id);
        self.emit(EngineEvent::StatusChanged {
            transfer_id,
            status: TransferStatus::Started,
        });
        Ok(())
    }

    pub async fn restart(&mut self, transfer_id: TransferId) -> Result<(), EngineError> {
        let transfer_type = self.transfer_type(transfer_id).await?;
        let status = self.status(transfer_id).await?;
        if !status.is_restartable() {
            return Err(EngineError::transition(
                transfer_id,
                format!("cannot restart from {status:?}"),
            ));
        }

        if transfer_type == TransferType::Upload {
            let item = self
                .store
                .media_item(transfer_id)
                .await?
                .ok_or(EngineError::NotFound(transfer_id))?;
            let capability = self.registry.load_capability(&item.plugin_id)?;
            self.activity.touch(transfer_id);
            self.launch(transfer_id, item, capability).await?;
            return Ok(());
        }

        // the owner reports the new status itself
        if self.store.update_progress(transfer_id, 0.0).await? {
            self.emit(EngineEvent::ProgressChanged {
                transfer_id,
                progress: 0.0,
            });
        }
        self.invoke_callback(transfer_id, CallbackMethod::Restart).await
    }

    /// Asks the owner of the job to stop. The Canceled status arrives later,
    /// from the capability or through `finish`.
    pub async fn cancel(&mut self, transfer_id: TransferId) -> Result<(), EngineError> {
        let transfer_type = self.transfer_type(transfer_id).await?;
        self.activity.released(transfer_id);

        if transfer_type == TransferType::Upload {
            let upload = self
                .uploads
                .get_mut(&transfer_id)
                .ok_or_else(|| EngineError::transition(transfer_id, "no running upload"))?;
            upload.capability.cancel();
            return Ok(());
        }

        self.invoke_callback(transfer_id, CallbackMethod::Cancel).await
    }

    pub async fn finish(
        &mut self,
        transfer_id: TransferId,
        status: TransferStatus,
        reason: &str,
    ) -> Result<(), EngineError> {
        let transfer_type = self.transfer_type(transfer_id).await?;
        if transfer_type == TransferType::Upload {
            return Err(EngineError::transition(
                transfer_id,
                "uploads are finished by their plugin",
            ));
        }
        if !status.is_terminal() {
            return Err(EngineError::InvalidArgument(format!(
                "{status:?} is not a final status"
            )));
        }

        let url = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or(EngineError::NotFound(transfer_id))?
            .url;

        if !reason.is_empty() {
            info!(transfer_id, status = ?status, reason, "transfer finished by client");
        }

        self.store.update_status(transfer_id, status).await?;
        self.awaiting_start.remove(&transfer_id);
        self.activity.released(transfer_id);
        self.notify(transfer_type, status, &url);
        self.emit(EngineEvent::StatusChanged {
            transfer_id,
            status,
        });

        if transfer_type == TransferType::Sync {
            let mut removed = self
                .store
                .remove_failed_siblings(transfer_id, TransferType::Sync)
                .await?;
            if status == TransferStatus::Finished && self.store.remove_transfer(transfer_id).await? {
                self.types.remove(&transfer_id);
                removed += 1;
            }
            if removed > 0 {
                self.emit(EngineEvent::TransfersChanged);
            }
        }
        Ok(())
    }

    /// Progress report from a Download/Sync owner. Uploads report through
    /// their capability and are ignored here.
    pub async fn update_progress(&mut self, transfer_id: TransferId, progress: f64) -> Result<(), EngineError> {
        let transfer_type = self.transfer_type(transfer_id).await?;
        if transfer_type == TransferType::Upload {
            debug!(transfer_id, "ignoring client progress for upload");
            return Ok(());
        }
        self.record_progress(transfer_id, progress).await
    }

    pub async fn transfers(&self) -> Result<Vec<Transfer>, EngineError> {
        Ok(self.store.list_transfers().await?)
    }

    pub fn transfer_methods(&self) -> Vec<PluginDescriptor> {
        self.registry.methods().to_vec()
    }

    /// Removes every Finished, Canceled and Interrupted job.
    pub async fn clear_transfers(&mut self) -> Result<u64, EngineError> {
        let removed = self.store.clear_terminal().await?;
        self.types.clear();
        self.group_counts.clear();
        self.emit(EngineEvent::TransfersChanged);
        Ok(removed)
    }

    pub fn enable_notifications(&mut self, enabled: bool) {
        self.notifications_enabled = enabled;
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled
    }

    /// Forces orphaned NotStarted/Started jobs to Interrupted.
    pub async fn recover(&mut self) -> Result<u64, EngineError> {
        let interrupted = self.store.interrupt_live_transfers().await?;
        self.awaiting_start.clear();
        if interrupted > 0 {
            info!(interrupted, "interrupted unfinished transfers");
            self.emit(EngineEvent::TransfersChanged);
        }
        Ok(interrupted)
    }

    /// Interrupts every job whose owner has been silent for the expiry
    /// window. Uploads with a running capability are re-armed instead.
    pub async fn expire(&mut self, now: Instant) -> Result<Vec<TransferId>, EngineError> {
        let mut expired = Vec::new();
        for transfer_id in self.activity.sweep(now) {
            if self.uploads.contains_key(&transfer_id) {
                self.activity.touch_at(transfer_id, now);
                continue;
            }

            let Some(transfer) = self.store.get_transfer(transfer_id).await? else {
                continue;
            };
            if !transfer.status.is_live() {
                continue;
            }

            warn!(transfer_id, "transfer owner stopped reporting, interrupting");
            self.store
                .update_status(transfer_id, TransferStatus::Interrupted)
                .await?;
            self.notify(transfer.transfer_type, TransferStatus::Interrupted, &transfer.url);
            self.emit(EngineEvent::StatusChanged {
                transfer_id,
                status: TransferStatus::Interrupted,
            });
            expired.push(transfer_id);
        }
        Ok(expired)
    }

    /// Live jobs plus downloads and syncs still waiting for their owner to
    /// start them.
    pub fn has_outstanding(&self) -> bool {
        self.activity.has_outstanding() || !self.uploads.is_empty() || !self.awaiting_start.is_empty()
    }

    /// Stops live uploads and records every unfinished job as Interrupted.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        for (transfer_id, mut upload) in self.uploads.drain() {
            debug!(transfer_id, "canceling upload on shutdown");
            upload.capability.cancel();
        }
        self.recover().await?;
        Ok(())
    }

    /// Applies a report from a running upload capability.
    pub async fn handle_upload_event(&mut self, event: UploadEvent) -> Result<(), EngineError> {
        let transfer_id = event.transfer_id;
        let current = self.uploads.get(&transfer_id).map(|upload| upload.instance);
        if current != Some(event.instance) {
            debug!(transfer_id, instance = event.instance, "dropping event from detached upload");
            return Ok(());
        }

        match event.kind {
            UploadEventKind::Status(TransferStatus::Started) => {
                self.store.update_status(transfer_id, TransferStatus::Started).await?;
                self.activity.touch(transfer_id);
                self.emit(EngineEvent::StatusChanged {
                    transfer_id,
                    status: TransferStatus::Started,
                });
            }
            UploadEventKind::Status(TransferStatus::NotStarted) => {
                warn!(transfer_id, "upload reported NotStarted, ignoring");
            }
            UploadEventKind::Status(status) => {
                if let Some(upload) = self.uploads.remove(&transfer_id) {
                    self.complete_upload(transfer_id, &upload.url, status).await?;
                }
            }
            UploadEventKind::Progress(progress) => {
                self.record_progress(transfer_id, progress).await?;
            }
        }
        Ok(())
    }

    pub fn discover_plugins(&mut self) {
        if self.registry.discover() {
            self.emit(EngineEvent::TransferMethodListChanged);
        }
    }

    pub fn handle_plugin_info(&mut self, result: PluginInfoResult) {
        if self.registry.handle_info(result) {
            self.emit(EngineEvent::TransferMethodListChanged);
        }
    }

    pub fn schedule_plugin_rescan(&mut self, now: tokio::time::Instant) {
        self.registry.schedule_rescan(now);
    }

    pub fn plugin_rescan_deadline(&self) -> Option<tokio::time::Instant> {
        self.registry.rescan_deadline()
    }

    async fn dispatch_new_upload(
        &mut self,
        mut item: MediaItem,
        capability: Box<dyn UploadCapability>,
    ) -> Result<TransferId, EngineError> {
        item.display_name = capability.display_name();
        item.service_icon = capability.service_icon();
        let new_transfer = item.to_new_transfer(capability.cancel_enabled(), capability.restart_enabled());

        let transfer_id = self.store.create_transfer(&new_transfer).await?;
        self.types.insert(transfer_id, TransferType::Upload);
        info!(transfer_id, plugin_id = %item.plugin_id, "upload created");

        self.emit(EngineEvent::TransfersChanged);
        self.emit(EngineEvent::StatusChanged {
            transfer_id,
            status: TransferStatus::NotStarted,
        });
        self.activity.touch(transfer_id);
        self.launch(transfer_id, item, capability).await?;
        Ok(transfer_id)
    }

    /// Hands `item` to a fresh capability instance. A capability that fails
    /// to start leaves the job Interrupted.
    async fn launch(
        &mut self,
        transfer_id: TransferId,
        item: MediaItem,
        mut capability: Box<dyn UploadCapability>,
    ) -> Result<(), EngineError> {
        self.next_instance += 1;
        let instance = self.next_instance;
        let url = item.url.clone();
        let sink = UploadEventSink::new(transfer_id, instance, self.upload_tx.clone());

        // replacing a previous instance detaches it
        self.uploads.remove(&transfer_id);
        match capability.start(item, sink) {
            Ok(()) => {
                self.uploads.insert(
                    transfer_id,
                    LiveUpload {
                        instance,
                        url,
                        capability,
                    },
                );
                Ok(())
            }
            Err(err) => {
                warn!(transfer_id, error = %err, "upload capability failed to start");
                self.complete_upload(transfer_id, &url, TransferStatus::Interrupted)
                    .await
            }
        }
    }

    async fn complete_upload(
        &mut self,
        transfer_id: TransferId,
        url: &str,
        status: TransferStatus,
    ) -> Result<(), EngineError> {
        self.notify(TransferType::Upload, status, url);
        self.store.update_status(transfer_id, status).await?;
        self.activity.released(transfer_id);
        self.emit(EngineEvent::StatusChanged {
            transfer_id,
            status,
        });
        Ok(())
    }

    async fn create_external(&mut self, transfer: NewTransfer) -> Result<TransferId, EngineError> {
        let transfer_type = transfer.transfer_type;
        let transfer_id = self.store.create_transfer(&transfer).await?;
        self.types.insert(transfer_id, transfer_type);
        self.awaiting_start.insert(transfer_id);
        info!(transfer_id, transfer_type = ?transfer_type, "transfer created");

        self.emit(EngineEvent::TransfersChanged);
        self.emit(EngineEvent::StatusChanged {
            transfer_id,
            status: TransferStatus::NotStarted,
        });
        Ok(transfer_id)
    }

    async fn record_progress(&mut self, transfer_id: TransferId, progress: f64) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(EngineError::InvalidArgument(format!(
                "progress {progress} outside [0, 1]"
            )));
        }

        if !self.store.update_progress(transfer_id, progress).await? {
            debug!(transfer_id, "progress not recorded");
            return Ok(());
        }
        if self.status(transfer_id).await?.is_live() {
            self.activity.touch(transfer_id);
        }
        self.emit(EngineEvent::ProgressChanged {
            transfer_id,
            progress,
        });
        Ok(())
    }

    async fn invoke_callback(&self, transfer_id: TransferId, method: CallbackMethod) -> Result<(), EngineError> {
        let Some(callback) = self.store.callback(transfer_id).await? else {
            debug!(transfer_id, "transfer has no callback");
            return Ok(());
        };
        let Some(name) = callback.method(method) else {
            debug!(transfer_id, method = ?method, "callback method not offered");
            return Ok(());
        };

        self.callbacks
            .invoke(&callback, name, transfer_id)
            .await
            .map(|_| ())
            .map_err(|err| EngineError::CallbackUnavailable {
                transfer_id,
                reason: err.to_string(),
            })
    }

    async fn transfer_type(&mut self, transfer_id: TransferId) -> Result<TransferType, EngineError> {
        if let Some(transfer_type) = self.types.get(&transfer_id) {
            return Ok(*transfer_type);
        }
        let transfer_type = self
            .store
            .transfer_type(transfer_id)
            .await?
            .ok_or(EngineError::NotFound(transfer_id))?;
        self.types.insert(transfer_id, transfer_type);
        Ok(transfer_type)
    }

    async fn status(&self, transfer_id: TransferId) -> Result<TransferStatus, EngineError> {
        self.store
            .transfer_status(transfer_id)
            .await?
            .ok_or(EngineError::NotFound(transfer_id))
    }

    fn notify(&mut self, transfer_type: TransferType, status: TransferStatus, url: &str) {
        if !self.notifications_enabled {
            return;
        }
        let Some(event) = notification_event(transfer_type, status) else {
            return;
        };
        let count = self.group_counts.get(&event).copied().unwrap_or(0) + 1;
        if let Some(notification) =
            Notification::for_outcome(transfer_type, status, url, count, self.group_action.as_ref())
        {
            self.group_counts.insert(event, count);
            self.notifier.publish(&notification);
        }
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn notification_event(transfer_type: TransferType, status: TransferStatus) -> Option<NotificationEvent> {
    match (status, transfer_type) {
        (TransferStatus::Finished, TransferType::Upload) => Some(NotificationEvent::Transfer),
        (TransferStatus::Finished, TransferType::Download) => Some(NotificationEvent::TransferComplete),
        (TransferStatus::Interrupted, _) => Some(NotificationEvent::TransferError),
        _ => None,
    }
}
