use serde::{Deserialize, Serialize};
use tengine_transfer::{TransferStatus, TransferType};
use tracing::info;

const NOTIFICATION_IMAGE: &str = "icon-l-share";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    Transfer,
    TransferComplete,
    TransferError,
}

impl NotificationEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::TransferComplete => "transfer.complete",
            Self::TransferError => "transfer.error",
        }
    }
}

/// Target invoked when the user taps a notification group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteAction {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
}

impl RemoteAction {
    pub fn is_empty(&self) -> bool {
        self.service.is_empty() || self.path.is_empty() || self.interface.is_empty() || self.method.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub summary: String,
    pub body: String,
    pub image: String,
    /// Shown when several notifications of the same event are grouped;
    /// `None` makes the notification banner-only.
    pub group_summary: Option<String>,
    pub group_body: String,
    pub action: Option<RemoteAction>,
}

impl Notification {
    pub fn banner_only(&self) -> bool {
        self.group_summary.is_none()
    }

    /// Builds the notification for a job reaching `status`, or `None` when
    /// the outcome is not worth telling the user about. `group_count`
    /// includes this notification.
    pub fn for_outcome(
        transfer_type: TransferType,
        status: TransferStatus,
        url: &str,
        group_count: usize,
        action: Option<&RemoteAction>,
    ) -> Option<Self> {
        let (event, body, group_summary) = match (status, transfer_type) {
            (TransferStatus::Finished, TransferType::Upload) => {
                (NotificationEvent::Transfer, "File uploaded", None)
            }
            (TransferStatus::Finished, TransferType::Download) => (
                NotificationEvent::TransferComplete,
                "File downloaded",
                Some(format!("{group_count} file(s) downloaded")),
            ),
            (TransferStatus::Interrupted, TransferType::Upload) => (
                NotificationEvent::TransferError,
                "Upload failed!",
                Some(format!("{group_count} file upload(s) failed")),
            ),
            (TransferStatus::Interrupted, TransferType::Download) => (
                NotificationEvent::TransferError,
                "Download failed!",
                Some(format!("{group_count} download(s) failed")),
            ),
            (TransferStatus::Interrupted, TransferType::Sync) => (
                NotificationEvent::TransferError,
                "Sync failed!",
                Some(format!("{group_count} sync(s) failed")),
            ),
            _ => return None,
        };

        let summary = match transfer_type {
            TransferType::Sync => String::new(),
            _ if url.is_empty() => return None,
            _ => file_name(url).to_string(),
        };

        Some(Self {
            event,
            group_body: if group_summary.is_some() {
                summary.clone()
            } else {
                String::new()
            },
            summary,
            body: body.to_string(),
            image: NOTIFICATION_IMAGE.to_string(),
            group_summary,
            action: action.filter(|action| !action.is_empty()).cloned(),
        })
    }
}

fn file_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Presentation sink for user-visible notifications.
pub trait Notifier: Send + Sync {
    fn publish(&self, notification: &Notification);
}

/// Writes notifications to the log; used when no desktop sink is wired in.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn publish(&self, notification: &Notification) {
        info!(
            event = notification.event.as_str(),
            summary = %notification.summary,
            body = %notification.body,
            group = ?notification.group_summary,
            "notification"
        );
    }
}
