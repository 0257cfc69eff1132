use crate::change::Change;
use crate::model::ConversationSummary;
use crate::store::Store;
use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// The conversation list for one identity: every other known profile,
/// most recently seen first, each carrying the latest message exchanged
/// with them and the count of their messages we have not read yet.
///
/// The list re-derives itself on directory events only. Message traffic
/// does not trigger a refresh, so unread badges can lag until the next
/// profile save; callers that need a fresh count sooner re-open the list.
pub struct Roster {
    rx: watch::Receiver<Vec<ConversationSummary>>,
    refresher: Option<JoinHandle<()>>,
}

impl Roster {
    /// Compute the list eagerly, then keep it fresh from directory events.
    pub async fn open(store: Store, self_id: &str) -> Result<Self> {
        let changes = store.subscribe_changes();

        let initial = load_summaries(&store, self_id).await?;
        let (tx, rx) = watch::channel(initial);

        let refresher = tokio::spawn(refresh_on_directory_changes(
            store,
            changes,
            self_id.to_string(),
            tx,
        ));

        Ok(Self {
            rx,
            refresher: Some(refresher),
        })
    }

    /// The latest snapshot.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.rx.borrow().clone()
    }

    /// Observe refreshes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.rx.clone()
    }

    /// Stop following directory changes.
    pub async fn close(mut self) {
        if let Some(task) = self.refresher.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Roster {
    fn drop(&mut self) {
        if let Some(task) = self.refresher.take() {
            task.abort();
        }
    }
}

async fn refresh_on_directory_changes(
    store: Store,
    mut changes: broadcast::Receiver<Change>,
    self_id: String,
    tx: watch::Sender<Vec<ConversationSummary>>,
) {
    loop {
        match changes.recv().await {
            Ok(Change::ProfileSaved(_)) => match load_summaries(&store, &self_id).await {
                Ok(summaries) => {
                    let _ = tx.send(summaries);
                }
                // The previous snapshot stays in place.
                Err(e) => error!("Failed to refresh conversation list: {:#}", e),
            },
            // Message inserts do not refresh the list.
            Ok(Change::MessageInserted(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "Conversation list lagged behind the change feed, skipped {} events",
                    skipped
                );
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Change feed closed, conversation list goes static");
                break;
            }
        }
    }
}

/// One directory query, then one latest-message and one unread-count lookup
/// per listed contact.
async fn load_summaries(store: &Store, self_id: &str) -> Result<Vec<ConversationSummary>> {
    let profiles = store.list_profiles(self_id).await?;

    let mut summaries = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let last_message = store.latest_message_between(self_id, &profile.id).await?;
        let unread = store.count_unread(&profile.id, self_id).await?;
        summaries.push(ConversationSummary {
            profile,
            last_message,
            unread,
        });
    }

    Ok(summaries)
}
