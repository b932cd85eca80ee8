use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("transfer plugin {0} is not available")]
    Unavailable(String),
    #[error("invalid plugin manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },
    #[error("plugin loading failed: {0}")]
    Load(String),
    #[error("plugin {plugin_id} info query failed: {reason}")]
    Query { plugin_id: String, reason: String },
    #[error("plugin directory watch failed: {0}")]
    Watch(String),
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("upload could not be launched: {0}")]
    Launch(String),
    #[error("media item rejected: {0}")]
    InvalidItem(String),
}
