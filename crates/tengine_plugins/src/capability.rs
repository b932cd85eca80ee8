use crate::error::CapabilityError;
use tengine_transfer::{MediaItem, TransferId, TransferStatus};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UploadEventKind {
    Status(TransferStatus),
    Progress(f64),
}

/// Report from a running upload. `instance` identifies the capability object
/// that produced it so late events from a replaced instance can be dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadEvent {
    pub transfer_id: TransferId,
    pub instance: u64,
    pub kind: UploadEventKind,
}

/// Handed to a capability on `start`; the only way it talks back to the engine.
#[derive(Debug, Clone)]
pub struct UploadEventSink {
    transfer_id: TransferId,
    instance: u64,
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl UploadEventSink {
    pub fn new(transfer_id: TransferId, instance: u64, tx: mpsc::UnboundedSender<UploadEvent>) -> Self {
        Self {
            transfer_id,
            instance,
            tx,
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Returns false once the engine has gone away.
    pub fn status(&self, status: TransferStatus) -> bool {
        self.send(UploadEventKind::Status(status))
    }

    pub fn progress(&self, progress: f64) -> bool {
        self.send(UploadEventKind::Progress(progress))
    }

    fn send(&self, kind: UploadEventKind) -> bool {
        self.tx
            .send(UploadEvent {
                transfer_id: self.transfer_id,
                instance: self.instance,
                kind,
            })
            .is_ok()
    }
}

/// One upload in flight. `start` returns as soon as the work is dispatched;
/// Started, progress and the terminal status arrive through the sink.
pub trait UploadCapability: Send + Sync {
    fn display_name(&self) -> String;

    fn service_icon(&self) -> String;

    fn cancel_enabled(&self) -> bool;

    fn restart_enabled(&self) -> bool;

    fn start(&mut self, item: MediaItem, events: UploadEventSink) -> Result<(), CapabilityError>;

    fn cancel(&mut self);
}
