use crate::model::{DirectedMessage, Profile};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A row-change notification from the store, the stand-in for the hosted
/// backend's realtime subscription service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Change {
    /// A message row was inserted. The only message event the thread feed
    /// consumes; read-flag updates are deliberately not published.
    MessageInserted(DirectedMessage),

    /// A profile row was inserted or updated (sign-up, profile edit,
    /// presence touch). Drives the roster refresh.
    ProfileSaved(Profile),
}

pub struct ChangeFeed {
    tx: broadcast::Sender<Change>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }

    pub fn publish(&self, change: Change) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(change);
    }
}
