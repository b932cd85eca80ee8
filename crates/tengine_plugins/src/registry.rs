use crate::capability::UploadCapability;
use crate::error::PluginError;
use crate::plugin::{PluginLoader, TransferPlugin};
use std::sync::Arc;
use std::time::Duration;
use tengine_transfer::PluginDescriptor;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Directory churn (package reinstalls) fires many events; wait this long
/// after the last one before rescanning.
pub const DEFAULT_RESCAN_DEBOUNCE: Duration = Duration::from_secs(5);

/// Outcome of an asynchronous info query, tagged with the discovery round
/// that issued it.
#[derive(Debug)]
pub struct PluginInfoResult {
    pub generation: u64,
    pub plugin_id: String,
    pub outcome: Result<Vec<PluginDescriptor>, PluginError>,
}

pub struct PluginRegistry {
    loader: Arc<dyn PluginLoader>,
    plugins: Vec<Arc<dyn TransferPlugin>>,
    methods: Vec<PluginDescriptor>,
    outstanding: usize,
    generation: u64,
    info_tx: mpsc::UnboundedSender<PluginInfoResult>,
    debounce: Duration,
    rescan_at: Option<Instant>,
}

impl PluginRegistry {
    pub fn new(
        loader: Arc<dyn PluginLoader>,
        debounce: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PluginInfoResult>) {
        let (info_tx, info_rx) = mpsc::unbounded_channel();
        (
            Self {
                loader,
                plugins: Vec::new(),
                methods: Vec::new(),
                outstanding: 0,
                generation: 0,
                info_tx,
                debounce,
                rescan_at: None,
            },
            info_rx,
        )
    }

    /// Starts a new discovery round. Returns true when the method list is
    /// already complete, i.e. the aggregate change event should fire now.
    /// Otherwise it fires once `handle_info` reports the last answer.
    pub fn discover(&mut self) -> bool {
        self.rescan_at = None;
        self.generation += 1;
        self.methods.clear();
        self.outstanding = 0;

        self.plugins = match self.loader.load() {
            Ok(plugins) => plugins,
            Err(err) => {
                warn!(error = %err, "plugin loading failed");
                Vec::new()
            }
        };

        for plugin in self.plugins.iter().filter(|plugin| plugin.enabled()) {
            let source = plugin.info_source();
            if source.ready() {
                self.methods.extend(source.info());
                continue;
            }

            self.outstanding += 1;
            let tx = self.info_tx.clone();
            let generation = self.generation;
            let plugin_id = plugin.plugin_id().to_string();
            tokio::spawn(async move {
                let outcome = source.query().await;
                let _ = tx.send(PluginInfoResult {
                    generation,
                    plugin_id,
                    outcome,
                });
            });
        }

        info!(
            generation = self.generation,
            plugins = self.plugins.len(),
            pending_queries = self.outstanding,
            "plugin discovery started"
        );
        self.outstanding == 0
    }

    /// Folds a query answer into the method list. Returns true when this
    /// answer completed the current round.
    pub fn handle_info(&mut self, result: PluginInfoResult) -> bool {
        if result.generation != self.generation || self.outstanding == 0 {
            debug!(
                plugin_id = %result.plugin_id,
                generation = result.generation,
                "ignoring plugin info from superseded discovery"
            );
            return false;
        }

        match result.outcome {
            Ok(methods) => self.methods.extend(methods),
            Err(err) => warn!(plugin_id = %result.plugin_id, error = %err, "plugin info query failed"),
        }
        self.outstanding -= 1;
        self.outstanding == 0
    }

    pub fn methods(&self) -> &[PluginDescriptor] {
        &self.methods
    }

    pub fn is_discovering(&self) -> bool {
        self.outstanding > 0
    }

    pub fn load_capability(&self, plugin_id: &str) -> Result<Box<dyn UploadCapability>, PluginError> {
        self.plugins
            .iter()
            .find(|plugin| plugin.enabled() && plugin.plugin_id() == plugin_id)
            .map(|plugin| plugin.upload_capability())
            .ok_or_else(|| PluginError::Unavailable(plugin_id.to_string()))
    }

    /// Pushes the rescan deadline out by the debounce interval.
    pub fn schedule_rescan(&mut self, now: Instant) {
        self.rescan_at = Some(now + self.debounce);
    }

    pub fn rescan_deadline(&self) -> Option<Instant> {
        self.rescan_at
    }
}
