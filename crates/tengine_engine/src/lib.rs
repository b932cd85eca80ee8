//! The transfer orchestrator.
//!
//! [`TransferEngine`] owns every state transition and is driven from a single
//! task by [`EngineService`]; callers talk to it through an [`EngineHandle`].

mod activity;
mod engine;
mod error;
mod notification;
mod service;

pub use activity::{ActivityMonitor, DEFAULT_ACTIVITY_EXPIRY, DEFAULT_SWEEP_INTERVAL};
pub use engine::{
    DownloadRequest, EngineChannels, EngineConfig, EngineEvent, SyncRequest, TransferEngine,
    UploadRequest,
};
pub use error::EngineError;
pub use notification::{
    Notification, NotificationEvent, Notifier, RemoteAction, TracingNotifier,
};
pub use service::{EngineHandle, EngineService, ServiceConfig, DEFAULT_IDLE_EXIT};
