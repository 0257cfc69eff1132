use crate::change::Change;
use crate::model::DirectedMessage;
use crate::store::Store;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// What a thread feed tells its observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ThreadEvent {
    /// A message joined the thread, sent by either party, already in its
    /// final display position.
    Appended(DirectedMessage),
}

/// Live view of one two-party conversation.
///
/// Opening the feed takes a point-in-time snapshot of the pair's history,
/// marks the inbound side read, and then follows the store's change feed so
/// new messages from either party land in the snapshot without re-querying.
/// Exactly one feed should be live per conversation view; switching
/// conversations means closing this feed before opening the next.
pub struct ThreadFeed {
    store: Store,
    self_id: String,
    other_id: String,
    snapshot: Arc<Mutex<Vec<DirectedMessage>>>,
    events: broadcast::Sender<ThreadEvent>,
    watcher: Option<JoinHandle<()>>,
}

impl ThreadFeed {
    pub async fn open(store: Store, self_id: &str, other_id: &str) -> Result<Self> {
        // Subscribe before the snapshot query so an insert cannot slip
        // between the two; a row seen by both is deduplicated by id.
        let changes = store.subscribe_changes();

        let mut messages = store.messages_between(self_id, other_id).await?;

        // Opening the thread is what marks the inbound side read.
        match store.mark_read(other_id, self_id).await {
            Ok(_) => {
                for message in &mut messages {
                    if message.sender_id == other_id {
                        message.read = true;
                    }
                }
            }
            Err(e) => error!("Failed to mark thread read on open: {:#}", e),
        }

        let snapshot = Arc::new(Mutex::new(messages));
        let (events, _rx) = broadcast::channel(100);

        let watcher = tokio::spawn(watch_changes(
            store.clone(),
            changes,
            self_id.to_string(),
            other_id.to_string(),
            snapshot.clone(),
            events.clone(),
        ));

        Ok(Self {
            store,
            self_id: self_id.to_string(),
            other_id: other_id.to_string(),
            snapshot,
            events,
            watcher: Some(watcher),
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn other_id(&self) -> &str {
        &self.other_id
    }

    /// The current snapshot, in display order.
    pub fn messages(&self) -> Vec<DirectedMessage> {
        self.snapshot.lock().unwrap().clone()
    }

    /// Observe appends. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ThreadEvent> {
        self.events.subscribe()
    }

    /// Send a message to the other party. Empty (or whitespace-only)
    /// content is rejected here, before anything reaches the store. The
    /// sent row arrives back through the live feed like any other insert.
    pub async fn send(&self, content: &str) -> Result<DirectedMessage> {
        let content = content.trim();
        if content.is_empty() {
            bail!("Refusing to send an empty message");
        }

        self.store
            .insert_message(&self.self_id, &self.other_id, content)
            .await
    }

    /// Tear the live subscription down. Completes only once the watcher has
    /// actually stopped, so a replacement feed never overlaps this one.
    pub async fn close(mut self) {
        if let Some(task) = self.watcher.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ThreadFeed {
    fn drop(&mut self) {
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
    }
}

async fn watch_changes(
    store: Store,
    mut changes: broadcast::Receiver<Change>,
    self_id: String,
    other_id: String,
    snapshot: Arc<Mutex<Vec<DirectedMessage>>>,
    events: broadcast::Sender<ThreadEvent>,
) {
    loop {
        match changes.recv().await {
            Ok(Change::MessageInserted(message)) => {
                if !message.is_between(&self_id, &other_id) {
                    continue;
                }
                if !insert_in_order(&snapshot, message.clone()) {
                    continue;
                }

                // An inbound message arriving while the thread is open is
                // read right away; the bulk update is idempotent.
                if message.sender_id == other_id {
                    match store.mark_read(&other_id, &self_id).await {
                        Ok(_) => mark_inbound_read(&snapshot, &other_id),
                        Err(e) => error!("Failed to mark inbound message read: {:#}", e),
                    }
                }

                let _ = events.send(ThreadEvent::Appended(message));
            }
            Ok(Change::ProfileSaved(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "Thread feed lagged behind the change feed, skipped {} events; live view may be stale",
                    skipped
                );
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Change feed closed, thread feed goes static");
                break;
            }
        }
    }
}

/// Place a new row at its display position, skipping ids already present.
/// Returns false if the row was a duplicate.
fn insert_in_order(snapshot: &Mutex<Vec<DirectedMessage>>, message: DirectedMessage) -> bool {
    let mut messages = snapshot.lock().unwrap();
    if messages.iter().any(|m| m.id == message.id) {
        return false;
    }
    // New rows almost always belong at the end; walk back only on a
    // creation-time tie with the tail.
    let at = messages
        .iter()
        .rposition(|m| m.display_order(&message) != Ordering::Greater)
        .map(|i| i + 1)
        .unwrap_or(0);
    messages.insert(at, message);
    true
}

/// Mirror a successful bulk mark-read onto the local snapshot.
fn mark_inbound_read(snapshot: &Mutex<Vec<DirectedMessage>>, other_id: &str) {
    let mut messages = snapshot.lock().unwrap();
    for message in messages.iter_mut() {
        if message.sender_id == other_id {
            message.read = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, at: i64) -> DirectedMessage {
        DirectedMessage {
            id: id.to_string(),
            sender_id: "a".to_string(),
            receiver_id: "b".to_string(),
            content: "x".to_string(),
            created_at: Utc.timestamp_opt(at, 0).unwrap(),
            read: false,
        }
    }

    #[test]
    fn insert_in_order_dedupes_and_sorts_ties() {
        let snapshot = Mutex::new(vec![message("b", 10), message("d", 20)]);

        // Duplicate id is skipped.
        assert!(!insert_in_order(&snapshot, message("b", 10)));

        // A tie on the creation time lands in id order.
        assert!(insert_in_order(&snapshot, message("c", 10)));
        // Newest row goes to the end.
        assert!(insert_in_order(&snapshot, message("e", 30)));

        let ids: Vec<String> = snapshot
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, ["b", "c", "d", "e"]);
    }
}
