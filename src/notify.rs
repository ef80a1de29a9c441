use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::queue::Outcome;

const CHANNEL_CAPACITY: usize = 4;

/// Broadcast hub for submission outcomes, keyed by submission id.
///
/// A channel exists only while somebody waits on it; settling a submission
/// sends once and drops the channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Outcome>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to the outcome of a submission. Creates the channel if needed.
    pub fn subscribe(&self, submission_id: Ulid) -> broadcast::Receiver<Outcome> {
        let sender = self
            .channels
            .entry(submission_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish the final outcome. No-op if nobody is listening.
    pub fn send(&self, submission_id: Ulid, outcome: &Outcome) {
        if let Some((_, sender)) = self.channels.remove(&submission_id) {
            let _ = sender.send(outcome.clone());
        }
    }

    /// Drop the channel if its last receiver is gone.
    pub fn remove_idle(&self, submission_id: &Ulid) {
        self.channels
            .remove_if(submission_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
