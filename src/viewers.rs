use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::Device;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateUpdate {
    pub sent_at: String,
    pub devices: Vec<Device>,
}

/// Fan-out of full registry snapshots to every connected viewer.
#[derive(Clone)]
pub struct ViewerHub {
    tx: broadcast::Sender<StateUpdate>,
}

impl Default for ViewerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.tx.subscribe()
    }

    #[cfg(test)]
    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Never fails; with nobody listening the update is simply dropped.
    pub fn broadcast_state(&self, devices: Vec<Device>) {
        let update = StateUpdate {
            sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            devices,
        };
        let _ = self.tx.send(update);
    }
}
