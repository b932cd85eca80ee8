use std::collections::HashMap;
use std::time::{Duration, Instant};
use tengine_transfer::TransferId;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_ACTIVITY_EXPIRY: Duration = Duration::from_secs(180);

/// Last-seen timestamps of jobs whose owner is expected to keep reporting.
/// In memory only; crash recovery covers what is lost on restart.
#[derive(Debug)]
pub struct ActivityMonitor {
    last_seen: HashMap<TransferId, Instant>,
    expiry: Duration,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_EXPIRY)
    }
}

impl ActivityMonitor {
    pub fn new(expiry: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            expiry,
        }
    }

    pub fn touch(&mut self, transfer_id: TransferId) {
        self.touch_at(transfer_id, Instant::now());
    }

    pub fn touch_at(&mut self, transfer_id: TransferId, now: Instant) {
        self.last_seen.insert(transfer_id, now);
    }

    pub fn released(&mut self, transfer_id: TransferId) {
        self.last_seen.remove(&transfer_id);
    }

    pub fn is_tracked(&self, transfer_id: TransferId) -> bool {
        self.last_seen.contains_key(&transfer_id)
    }

    pub fn has_outstanding(&self) -> bool {
        !self.last_seen.is_empty()
    }

    /// Removes and returns, in id order, every entry not touched within the
    /// expiry window as of `now`.
    pub fn sweep(&mut self, now: Instant) -> Vec<TransferId> {
        let expiry = self.expiry;
        let mut expired: Vec<TransferId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= expiry)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.last_seen.remove(id);
        }
        expired
    }
}
