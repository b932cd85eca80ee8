use crate::capability::UploadCapability;
use crate::error::PluginError;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tengine_transfer::PluginDescriptor;

/// Describes the transfer methods a plugin offers. Sources that need to ask a
/// remote service (e.g. to resolve account names) report `ready() == false`
/// and are queried asynchronously.
#[async_trait]
pub trait PluginInfoSource: Send + Sync {
    fn ready(&self) -> bool;

    fn info(&self) -> Vec<PluginDescriptor>;

    async fn query(&self) -> Result<Vec<PluginDescriptor>, PluginError>;
}

pub trait TransferPlugin: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn enabled(&self) -> bool;

    fn info_source(&self) -> Arc<dyn PluginInfoSource>;

    /// A fresh capability object; one per upload attempt.
    fn upload_capability(&self) -> Box<dyn UploadCapability>;
}

pub trait PluginLoader: Send + Sync {
    fn load(&self) -> Result<Vec<Arc<dyn TransferPlugin>>, PluginError>;
}

/// Info source whose descriptors are known up front.
#[derive(Debug, Clone)]
pub struct ReadyInfoSource {
    methods: Vec<PluginDescriptor>,
}

impl ReadyInfoSource {
    pub fn new(methods: Vec<PluginDescriptor>) -> Self {
        Self { methods }
    }
}

#[async_trait]
impl PluginInfoSource for ReadyInfoSource {
    fn ready(&self) -> bool {
        true
    }

    fn info(&self) -> Vec<PluginDescriptor> {
        self.methods.clone()
    }

    async fn query(&self) -> Result<Vec<PluginDescriptor>, PluginError> {
        Ok(self.methods.clone())
    }
}

/// Loader over an in-process plugin set, replaceable between discoveries.
#[derive(Default)]
pub struct StaticPluginLoader {
    plugins: RwLock<Vec<Arc<dyn TransferPlugin>>>,
}

impl StaticPluginLoader {
    pub fn new(plugins: Vec<Arc<dyn TransferPlugin>>) -> Self {
        Self {
            plugins: RwLock::new(plugins),
        }
    }

    pub fn set_plugins(&self, plugins: Vec<Arc<dyn TransferPlugin>>) {
        *self.plugins.write().unwrap_or_else(PoisonError::into_inner) = plugins;
    }
}

impl PluginLoader for StaticPluginLoader {
    fn load(&self) -> Result<Vec<Arc<dyn TransferPlugin>>, PluginError> {
        Ok(self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
