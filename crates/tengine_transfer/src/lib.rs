//! Domain types shared by every tengine crate.
//!
//! Status and type codes are the integers stored in the `transfers` table, so
//! they must never be renumbered without bumping the schema version.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type TransferId = i64;

/// Returned over the RPC surface when a create call fails.
pub const INVALID_TRANSFER_ID: TransferId = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("unknown transfer status code {0}")]
    Status(i64),
    #[error("unknown transfer type code {0}")]
    Type(i64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    NotStarted,
    Started,
    Canceled,
    Finished,
    Interrupted,
}

impl TransferStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::NotStarted => 1,
            Self::Started => 2,
            Self::Canceled => 3,
            Self::Finished => 4,
            Self::Interrupted => 5,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, CodeError> {
        match code {
            1 => Ok(Self::NotStarted),
            2 => Ok(Self::Started),
            3 => Ok(Self::Canceled),
            4 => Ok(Self::Finished),
            5 => Ok(Self::Interrupted),
            other => Err(CodeError::Status(other)),
        }
    }

    /// Finished, Canceled or Interrupted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Interrupted)
    }

    /// States a client may still be driving; these are orphaned after a crash.
    pub fn is_live(self) -> bool {
        matches!(self, Self::NotStarted | Self::Started)
    }

    pub fn is_restartable(self) -> bool {
        matches!(self, Self::Canceled | Self::Interrupted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Upload,
    Download,
    Sync,
}

impl TransferType {
    pub fn code(self) -> i64 {
        match self {
            Self::Upload => 1,
            Self::Download => 2,
            Self::Sync => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, CodeError> {
        match code {
            1 => Ok(Self::Upload),
            2 => Ok(Self::Download),
            3 => Ok(Self::Sync),
            other => Err(CodeError::Type(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMethod {
    Cancel,
    Restart,
}

/// Remote endpoint an external Download/Sync owner exposes for cancel and restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackDescriptor {
    pub service: String,
    pub path: String,
    pub interface: String,
    #[serde(default)]
    pub cancel_method: String,
    #[serde(default)]
    pub restart_method: String,
}

impl CallbackDescriptor {
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        cancel_method: impl Into<String>,
        restart_method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
            cancel_method: cancel_method.into(),
            restart_method: restart_method.into(),
        }
    }

    pub fn has_endpoint(&self) -> bool {
        !self.service.is_empty() && !self.path.is_empty() && !self.interface.is_empty()
    }

    /// A descriptor is only worth storing when it names an endpoint and offers
    /// at least one method.
    pub fn is_usable(&self) -> bool {
        self.has_endpoint() && (!self.cancel_method.is_empty() || !self.restart_method.is_empty())
    }

    pub fn method(&self, kind: CallbackMethod) -> Option<&str> {
        let name = match kind {
            CallbackMethod::Cancel => &self.cancel_method,
            CallbackMethod::Restart => &self.restart_method,
        };
        (!name.is_empty()).then_some(name.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferMetadata {
    pub title: String,
    pub description: String,
}

impl TransferMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.description.is_empty()
    }
}

/// A persisted job as returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transfer {
    pub transfer_id: TransferId,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub progress: f64,
    pub timestamp: String,
    pub display_name: String,
    pub application_icon: String,
    pub thumbnail_icon: String,
    pub service_icon: String,
    pub url: String,
    pub resource_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub plugin_id: String,
    pub account_id: String,
    pub strip_metadata: bool,
    pub scale_percent: f64,
    pub cancel_supported: bool,
    pub restart_supported: bool,
    pub metadata: Option<TransferMetadata>,
    pub callback: Option<CallbackDescriptor>,
}

/// Everything needed to insert a job; status, progress and timestamp are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransfer {
    pub transfer_type: TransferType,
    pub display_name: String,
    pub application_icon: String,
    pub thumbnail_icon: String,
    pub service_icon: String,
    pub url: String,
    pub resource_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub plugin_id: String,
    pub account_id: String,
    pub strip_metadata: bool,
    pub scale_percent: f64,
    pub cancel_supported: bool,
    pub restart_supported: bool,
    pub metadata: Option<TransferMetadata>,
    pub callback: Option<CallbackDescriptor>,
}

impl NewTransfer {
    pub fn new(transfer_type: TransferType, display_name: impl Into<String>) -> Self {
        Self {
            transfer_type,
            display_name: display_name.into(),
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

    /// Attaches a callback, deriving cancel/restart support from the offered
    /// methods. Unusable descriptors are dropped.
    pub fn with_callback(mut self, callback: Option<CallbackDescriptor>) -> Self {
        let callback = callback.filter(CallbackDescriptor::is_usable);
        self.cancel_supported = callback
            .as_ref()
            .is_some_and(|cb| cb.method(CallbackMethod::Cancel).is_some());
        self.restart_supported = callback
            .as_ref()
            .is_some_and(|cb| cb.method(CallbackMethod::Restart).is_some());
        self.callback = callback;
        self
    }
}

/// Unit of work handed to an upload capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub url: String,
    pub resource_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub plugin_id: String,
    pub display_name: String,
    pub service_icon: String,
    pub thumbnail_icon: String,
    pub title: String,
    pub description: String,
    pub account_id: String,
    pub strip_metadata: bool,
    pub scale_percent: f64,
    pub content: Option<String>,
    #[serde(default)]
    pub user_data: Map<String, Value>,
}

impl MediaItem {
    /// Pulls the user data keys the engine persists: title, description,
    /// accountId and scalePercent. Anything else stays plugin-private.
    pub fn apply_user_data(&mut self, user_data: Map<String, Value>) {
        if let Some(title) = user_data.get("title").and_then(Value::as_str) {
            self.title = title.to_string();
        }
        if let Some(description) = user_data.get("description").and_then(Value::as_str) {
            self.description = description.to_string();
        }
        match user_data.get("accountId") {
            Some(Value::String(id)) => self.account_id = id.clone(),
            Some(Value::Number(id)) => self.account_id = id.to_string(),
            _ => {}
        }
        if let Some(scale) = user_data.get("scalePercent").and_then(Value::as_f64) {
            self.scale_percent = scale;
        }
        self.user_data = user_data;
    }

    pub fn to_new_transfer(&self, cancel_supported: bool, restart_supported: bool) -> NewTransfer {
        let metadata = TransferMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
        };
        NewTransfer {
            transfer_type: TransferType::Upload,
            display_name: self.display_name.clone(),
            application_icon: String::new(),
            thumbnail_icon: self.thumbnail_icon.clone(),
            service_icon: self.service_icon.clone(),
            url: self.url.clone(),
            resource_name: self.resource_name.clone(),
            mime_type: self.mime_type.clone(),
            file_size: self.file_size,
            plugin_id: self.plugin_id.clone(),
            account_id: self.account_id.clone(),
            strip_metadata: self.strip_metadata,
            scale_percent: self.scale_percent,
            cancel_supported,
            restart_supported,
            metadata: (!metadata.is_empty()).then_some(metadata),
            callback: None,
        }
    }
}

impl From<&Transfer> for MediaItem {
    fn from(transfer: &Transfer) -> Self {
        let metadata = transfer.metadata.clone().unwrap_or_default();
        Self {
            url: transfer.url.clone(),
            resource_name: transfer.resource_name.clone(),
            mime_type: transfer.mime_type.clone(),
            file_size: transfer.file_size,
            plugin_id: transfer.plugin_id.clone(),
            display_name: transfer.display_name.clone(),
            service_icon: transfer.service_icon.clone(),
            thumbnail_icon: transfer.thumbnail_icon.clone(),
            title: metadata.title,
            description: metadata.description,
            account_id: transfer.account_id.clone(),
            strip_metadata: transfer.strip_metadata,
            scale_percent: transfer.scale_percent,
            content: None,
            user_data: Map::new(),
        }
    }
}

/// Inline payload for `uploadContent`, e.g. a vCard that never touched disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadContent {
    pub data: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(default)]
    pub icon: String,
}

/// A transfer method advertised by a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub account_id: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub ui_path: String,
}
