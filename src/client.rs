use crate::model::{ConversationSummary, DirectedMessage, Profile};
use crate::pseudonym::PseudonymRegistry;
use crate::roster::Roster;
use crate::session::{Session, SessionState};
use crate::store::Store;
use crate::thread::{ThreadEvent, ThreadFeed};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// View-level updates handed to the presentation layer. One subscription
/// covers session transitions, conversation-list refreshes and appends to
/// whichever thread is currently open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    Session(SessionState),
    Contacts(Vec<ConversationSummary>),
    Thread {
        other_id: String,
        event: ThreadEvent,
    },
}

/// The single logical actor behind one conversation view: it holds the
/// session, the conversation list, and at most one live thread feed, and
/// replaces that feed wholesale whenever the selected peer changes.
pub struct ChatClient {
    store: Store,
    session: Session,
    pseudonyms: Arc<PseudonymRegistry>,
    updates: broadcast::Sender<ClientEvent>,
    roster: Mutex<Option<LiveRoster>>,
    active: Mutex<Option<ActiveThread>>,
}

struct ActiveThread {
    feed: ThreadFeed,
    forward: JoinHandle<()>,
}

impl ActiveThread {
    async fn close(self) {
        self.forward.abort();
        let _ = self.forward.await;
        self.feed.close().await;
    }
}

struct LiveRoster {
    roster: Roster,
    forward: JoinHandle<()>,
}

impl LiveRoster {
    async fn close(self) {
        self.forward.abort();
        let _ = self.forward.await;
        self.roster.close().await;
    }
}

impl ChatClient {
    pub fn new(store: Store, pseudonyms: Arc<PseudonymRegistry>) -> Self {
        let session = Session::new(store.clone());
        let (updates, _rx) = broadcast::channel(100);

        // Forward session transitions onto the client bus.
        let mut session_rx = session.subscribe();
        let updates_tx = updates.clone();
        tokio::spawn(async move {
            while session_rx.changed().await.is_ok() {
                let state = session_rx.borrow_and_update().clone();
                let _ = updates_tx.send(ClientEvent::Session(state));
            }
        });

        Self {
            store,
            session,
            pseudonyms,
            updates,
            roster: Mutex::new(None),
            active: Mutex::new(None),
        }
    }

    /// Resolve the startup session. Until this completes the session reads
    /// `Unresolved`; a failed restore settles it as signed out rather than
    /// failing the process.
    pub async fn bootstrap(&self, email: Option<&str>, display_name: Option<&str>) {
        match email {
            Some(email) => {
                if let Err(e) = self.sign_in(email, display_name).await {
                    error!("Failed to restore the configured session: {:#}", e);
                    self.session.resolve_signed_out();
                }
            }
            None => self.session.resolve_signed_out(),
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// One subscription for everything the view needs to repaint.
    /// Dropping the receiver unsubscribes.
    pub fn updates(&self) -> broadcast::Receiver<ClientEvent> {
        self.updates.subscribe()
    }

    /// Sign in (or up) as `email` and bring the conversation list online.
    pub async fn sign_in(&self, email: &str, display_name: Option<&str>) -> Result<Profile> {
        // A thread left open by the previous identity must not survive the
        // switch: its watcher would keep marking the old inbox read, and
        // sends through it would carry the old sender.
        self.close_thread().await;

        let profile = self.session.sign_in(email, display_name).await?;
        info!("Signed in as {} ({})", profile.label(), profile.id);

        if let Err(e) = self.open_roster(&profile.id).await {
            // The session stands; the list simply stays empty.
            error!("Failed to open the conversation list: {:#}", e);
        }

        Ok(profile)
    }

    /// Drop the identity and every live subscription that belonged to it.
    pub async fn sign_out(&self) {
        self.close_thread().await;

        let mut slot = self.roster.lock().await;
        if let Some(roster) = slot.take() {
            roster.close().await;
        }
        drop(slot);

        self.session.sign_out();
        info!("Signed out");
    }

    /// Latest conversation-list snapshot; empty when no list is open.
    pub async fn contacts(&self) -> Vec<ConversationSummary> {
        let slot = self.roster.lock().await;
        slot.as_ref()
            .map(|live| live.roster.summaries())
            .unwrap_or_default()
    }

    /// Directory lookup for a single peer.
    pub async fn peer(&self, id: &str) -> Result<Option<Profile>> {
        self.store.get_profile(id).await
    }

    /// Select a conversation: the previous pair's feed is fully torn down
    /// before the replacement subscribes, so the two are never live at
    /// once. Returns the opening snapshot.
    pub async fn open_thread(&self, other_id: &str) -> Result<Vec<DirectedMessage>> {
        let mut slot = self.active.lock().await;

        // Resolve the identity under the lock so a concurrent sign-in or
        // sign-out cannot slip between the check and the open.
        let profile = match self.session.current_profile() {
            Some(profile) => profile,
            None => bail!("No active session"),
        };

        if let Some(previous) = slot.take() {
            previous.close().await;
        }

        let feed = ThreadFeed::open(self.store.clone(), &profile.id, other_id).await?;

        // Subscribe before taking the snapshot so an append between the two
        // surfaces at least as an event; a row present in both is
        // deduplicated by id on the consumer side.
        let mut rx = feed.subscribe();
        let messages = feed.messages();
        let updates = self.updates.clone();
        let other = other_id.to_string();
        let forward = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = updates.send(ClientEvent::Thread {
                            other_id: other.clone(),
                            event,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Thread update forwarding lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *slot = Some(ActiveThread { feed, forward });

        Ok(messages)
    }

    /// Navigate away from the open conversation, cancelling its feed.
    pub async fn close_thread(&self) {
        let mut slot = self.active.lock().await;
        if let Some(thread) = slot.take() {
            thread.close().await;
        }
    }

    /// The peer of the currently open conversation, if any.
    pub async fn active_peer(&self) -> Option<String> {
        let slot = self.active.lock().await;
        slot.as_ref().map(|t| t.feed.other_id().to_string())
    }

    /// Send through the open conversation. Refused when no thread with
    /// that peer is open.
    pub async fn send_to(&self, other_id: &str, content: &str) -> Result<DirectedMessage> {
        let slot = self.active.lock().await;
        match slot.as_ref() {
            Some(thread) if thread.feed.other_id() == other_id => thread.feed.send(content).await,
            _ => bail!("No open conversation with {}", other_id),
        }
    }

    /// Edit the signed-in profile and keep session observers current.
    pub async fn update_profile(
        &self,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Profile> {
        let profile = match self.session.current_profile() {
            Some(profile) => profile,
            None => bail!("No active session"),
        };

        let updated = self
            .store
            .update_profile(&profile.id, display_name, avatar_url)
            .await?;
        self.session.replace_profile(updated.clone());

        Ok(updated)
    }

    /// Process-local pseudonym for an identity, e.g. "User 2".
    pub fn alias(&self, id: &str) -> String {
        self.pseudonyms.name(id)
    }

    /// Pseudonym initial for avatar badges, e.g. "U2".
    pub fn alias_initial(&self, id: &str) -> String {
        self.pseudonyms.initial(id)
    }

    async fn open_roster(&self, self_id: &str) -> Result<()> {
        let mut slot = self.roster.lock().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }

        let roster = Roster::open(self.store.clone(), self_id).await?;

        // Push the initial list so subscribers need not poll for it.
        let _ = self
            .updates
            .send(ClientEvent::Contacts(roster.summaries()));

        let mut rx = roster.subscribe();
        let updates = self.updates.clone();
        let forward = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let summaries = rx.borrow_and_update().clone();
                let _ = updates.send(ClientEvent::Contacts(summaries));
            }
        });

        *slot = Some(LiveRoster { roster, forward });
        Ok(())
    }
}
