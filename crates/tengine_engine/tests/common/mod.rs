#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tengine_callback::RecordingCallbackBridge;
use tengine_engine::{
    EngineChannels, EngineConfig, EngineEvent, Notification, Notifier, TransferEngine,
};
use tengine_plugins::{
    CapabilityError, PluginError, PluginInfoSource, ReadyInfoSource, StaticPluginLoader,
    TransferPlugin, UploadCapability, UploadEventSink,
};
use tengine_storage::{StorageConfig, TransferStore};
use tengine_transfer::{MediaItem, PluginDescriptor};
use tokio::sync::broadcast;

#[derive(Default)]
pub struct RecordingNotifier {
    published: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn published(&self) -> Vec<Notification> {
        self.published.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, notification: &Notification) {
        self.published.lock().unwrap().push(notification.clone());
    }
}

/// What the fake plugin saw; shared between the test and every capability
/// instance it hands out.
#[derive(Default)]
pub struct CapabilityRecorder {
    pub started: Mutex<Vec<(MediaItem, UploadEventSink)>>,
    pub canceled: Mutex<usize>,
    pub fail_start: Mutex<bool>,
}

impl CapabilityRecorder {
    pub fn last_sink(&self) -> UploadEventSink {
        self.started.lock().unwrap().last().expect("capability started").1.clone()
    }

    pub fn last_item(&self) -> MediaItem {
        self.started.lock().unwrap().last().expect("capability started").0.clone()
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

struct ScriptedCapability {
    recorder: Arc<CapabilityRecorder>,
}

impl UploadCapability for ScriptedCapability {
    fn display_name(&self) -> String {
        "Scripted share".into()
    }

    fn service_icon(&self) -> String {
        "icon-scripted".into()
    }

    fn cancel_enabled(&self) -> bool {
        true
    }

    fn restart_enabled(&self) -> bool {
        true
    }

    fn start(&mut self, item: MediaItem, events: UploadEventSink) -> Result<(), CapabilityError> {
        if *self.recorder.fail_start.lock().unwrap() {
            return Err(CapabilityError::Launch("scripted failure".into()));
        }
        self.recorder.started.lock().unwrap().push((item, events));
        Ok(())
    }

    fn cancel(&mut self) {
        *self.recorder.canceled.lock().unwrap() += 1;
    }
}

pub struct ScriptedPlugin {
    pub id: String,
    pub recorder: Arc<CapabilityRecorder>,
    info: Arc<dyn PluginInfoSource>,
}

impl ScriptedPlugin {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            recorder: Arc::new(CapabilityRecorder::default()),
            info: Arc::new(ReadyInfoSource::new(vec![PluginDescriptor {
                id: id.into(),
                display_name: "Scripted share".into(),
                capabilities: vec!["image/*".into()],
                ..Default::default()
            }])),
        })
    }
}

impl TransferPlugin for ScriptedPlugin {
    fn plugin_id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        true
    }

    fn info_source(&self) -> Arc<dyn PluginInfoSource> {
        self.info.clone()
    }

    fn upload_capability(&self) -> Box<dyn UploadCapability> {
        Box::new(ScriptedCapability {
            recorder: self.recorder.clone(),
        })
    }
}

/// Info source that needs an asynchronous query.
pub struct SlowInfo(pub Vec<PluginDescriptor>);

#[async_trait]
impl PluginInfoSource for SlowInfo {
    fn ready(&self) -> bool {
        false
    }

    fn info(&self) -> Vec<PluginDescriptor> {
        Vec::new()
    }

    async fn query(&self) -> Result<Vec<PluginDescriptor>, PluginError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(self.0.clone())
    }
}

pub struct Harness {
    pub engine: TransferEngine,
    pub channels: EngineChannels,
    pub events: broadcast::Receiver<EngineEvent>,
    pub plugin: Arc<ScriptedPlugin>,
    pub loader: Arc<StaticPluginLoader>,
    pub bridge: Arc<RecordingCallbackBridge>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: TransferStore,
    pub _dir: TempDir,
}

pub async fn open_store(dir: &TempDir) -> TransferStore {
    TransferStore::connect(&StorageConfig {
        sqlite_path: dir.path().join("transfers.db").to_string_lossy().into_owned(),
    })
    .await
    .expect("store opens")
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let plugin = ScriptedPlugin::new("scripted");
    let loader = Arc::new(StaticPluginLoader::new(vec![
        plugin.clone() as Arc<dyn TransferPlugin>
    ]));
    let bridge = Arc::new(RecordingCallbackBridge::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let (mut engine, channels) = TransferEngine::new(
        store.clone(),
        loader.clone(),
        bridge.clone(),
        notifier.clone(),
        config,
    );
    let events = engine.subscribe();
    engine.discover_plugins();

    Harness {
        engine,
        channels,
        events,
        plugin,
        loader,
        bridge,
        notifier,
        store,
        _dir: dir,
    }
}

impl Harness {
    /// Feeds every queued capability report into the engine.
    pub async fn pump_uploads(&mut self) {
        while let Ok(event) = self.channels.upload_events.try_recv() {
            self.engine.handle_upload_event(event).await.unwrap();
        }
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}
