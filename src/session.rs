use crate::model::Profile;
use crate::store::Store;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Where the session currently stands. `Unresolved` covers the window
/// between process start and the first restore attempt finishing, so
/// consumers can tell "still checking" apart from "nobody signed in".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", content = "profile")]
pub enum SessionState {
    Unresolved,
    SignedOut,
    SignedIn(Profile),
}

/// Accessor for the current identity. Authentication itself is delegated to
/// the store (find-or-create by email); this type only tracks the outcome
/// and lets observers watch it change.
pub struct Session {
    store: Store,
    tx: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(store: Store) -> Self {
        let (tx, _rx) = watch::channel(SessionState::Unresolved);
        Self { store, tx }
    }

    /// The current state, cloned out of the watch slot.
    pub fn state(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    /// The signed-in profile, if there is one.
    pub fn current_profile(&self) -> Option<Profile> {
        match &*self.tx.borrow() {
            SessionState::SignedIn(profile) => Some(profile.clone()),
            _ => None,
        }
    }

    /// Observe session transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Sign in as `email`, creating the profile on first contact and
    /// bumping presence on every later one.
    pub async fn sign_in(&self, email: &str, display_name: Option<&str>) -> Result<Profile> {
        let email = email.trim();
        if email.is_empty() {
            bail!("Refusing to sign in with an empty email");
        }

        let profile = match self.store.find_profile_by_email(email).await? {
            Some(existing) => {
                self.store.touch_last_seen(&existing.id).await?;
                // Re-read so the session carries the bumped last_seen.
                self.store.get_profile(&existing.id).await?.unwrap_or(existing)
            }
            None => self.store.create_profile(email, display_name).await?,
        };

        self.tx.send_replace(SessionState::SignedIn(profile.clone()));

        Ok(profile)
    }

    /// Drop the current identity.
    pub fn sign_out(&self) {
        self.tx.send_replace(SessionState::SignedOut);
    }

    /// Settle the startup state when there is no session to restore.
    pub fn resolve_signed_out(&self) {
        self.tx.send_replace(SessionState::SignedOut);
    }

    /// Swap the signed-in profile after an edit, leaving observers current.
    pub fn replace_profile(&self, profile: Profile) {
        self.tx.send_replace(SessionState::SignedIn(profile));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_unresolved_then_resolves() {
        let store = Store::open_in_memory().await.unwrap();
        store.init().await.unwrap();

        let session = Session::new(store);
        assert!(matches!(session.state(), SessionState::Unresolved));

        session.resolve_signed_out();
        assert!(matches!(session.state(), SessionState::SignedOut));
    }

    #[tokio::test]
    async fn sign_in_creates_then_reuses_the_profile() {
        let store = Store::open_in_memory().await.unwrap();
        store.init().await.unwrap();

        let session = Session::new(store.clone());
        let first = session.sign_in("ada@example.com", Some("Ada")).await.unwrap();
        assert!(matches!(session.state(), SessionState::SignedIn(_)));

        // Same email signs back into the same identity.
        let second = session.sign_in("ada@example.com", None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.last_seen >= first.last_seen);

        let empty = session.sign_in("   ", None).await;
        assert!(empty.is_err());
    }
}
