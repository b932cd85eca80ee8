//! Upload capability providers and the registry that discovers them.
//!
//! A plugin exposes two things: an info source describing the transfer
//! methods it offers, and a factory for upload capabilities. The registry
//! lives on the engine task and is driven by `&mut self` calls; asynchronous
//! info queries report back through a channel.

mod capability;
mod error;
mod manifest;
mod plugin;
mod registry;
mod watcher;

pub use capability::{UploadCapability, UploadEvent, UploadEventKind, UploadEventSink};
pub use error::{CapabilityError, PluginError};
pub use manifest::{CommandCapability, ManifestPluginLoader, PluginManifest};
pub use plugin::{
    PluginInfoSource, PluginLoader, ReadyInfoSource, StaticPluginLoader, TransferPlugin,
};
pub use registry::{PluginInfoResult, PluginRegistry, DEFAULT_RESCAN_DEBOUNCE};
pub use watcher::PluginDirectoryWatcher;
