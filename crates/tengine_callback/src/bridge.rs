use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use tengine_transfer::{CallbackDescriptor, TransferId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackReceipt {
    pub transfer_id: TransferId,
    pub method: String,
    pub accepted_at: String,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("callback endpoint {0} unavailable")]
    EndpointUnavailable(String),
    #[error("invalid callback descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("callback call failed: {0}")]
    CallFailed(String),
}

/// Delivers cancel/restart requests to the external owner of a Download or
/// Sync job. Calls are fire-and-forget; the owner reports the outcome later
/// through `finish`.
#[async_trait]
pub trait CallbackBridge: Send + Sync {
    async fn invoke(
        &self,
        callback: &CallbackDescriptor,
        method: &str,
        transfer_id: TransferId,
    ) -> Result<CallbackReceipt, BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackInvocation {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub transfer_id: TransferId,
}

/// Bridge that records every call instead of reaching a remote process.
/// The daemon uses it when no IPC transport is wired in.
#[derive(Debug)]
pub struct RecordingCallbackBridge {
    reachable: AtomicBool,
    calls: Mutex<Vec<CallbackInvocation>>,
}

impl Default for RecordingCallbackBridge {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RecordingCallbackBridge {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub async fn invocations(&self) -> Vec<CallbackInvocation> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CallbackBridge for RecordingCallbackBridge {
    async fn invoke(
        &self,
        callback: &CallbackDescriptor,
        method: &str,
        transfer_id: TransferId,
    ) -> Result<CallbackReceipt, BridgeError> {
        if !callback.has_endpoint() {
            return Err(BridgeError::InvalidDescriptor(
                "service, path and interface are required".to_string(),
            ));
        }
        if method.trim().is_empty() {
            return Err(BridgeError::InvalidDescriptor(
                "method cannot be empty".to_string(),
            ));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BridgeError::EndpointUnavailable(callback.service.clone()));
        }

        info!(
            service = %callback.service,
            path = %callback.path,
            interface = %callback.interface,
            method,
            transfer_id,
            "invoking transfer callback"
        );

        self.calls.lock().await.push(CallbackInvocation {
            service: callback.service.clone(),
            path: callback.path.clone(),
            interface: callback.interface.clone(),
            method: method.to_string(),
            transfer_id,
        });

        Ok(CallbackReceipt {
            transfer_id,
            method: method.to_string(),
            accepted_at: Utc::now().to_rfc3339(),
        })
    }
}
