use crate::change::{Change, ChangeFeed};
use crate::model::{DirectedMessage, Profile};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr, sync::Arc};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Durable home of profiles and directed messages, plus the change feed
/// that notifies live subscribers of row inserts and profile updates.
///
/// This is the in-process stand-in for the hosted relational backend the
/// presentation layer would otherwise talk to directly.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    changes: Arc<ChangeFeed>,
}

impl Store {
    /// Create a new Store instance backed by a database file.
    /// This will automatically create the file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self {
            pool,
            changes: Arc::new(ChangeFeed::new()),
        })
    }

    /// Create an ephemeral in-memory Store, used by tests and throwaway runs.
    /// The pool is capped at one connection that never retires, since the
    /// database lives and dies with that connection.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Ok(Self {
            pool,
            changes: Arc::new(ChangeFeed::new()),
        })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT,
                avatar_url TEXT,
                created_at DATETIME NOT NULL,
                last_seen DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_profiles_last_seen ON profiles(last_seen DESC);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                read BOOLEAN NOT NULL DEFAULT FALSE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pair_created ON messages(sender_id, receiver_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages(receiver_id, read);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Subscribe to row-change notifications (message inserts, profile saves).
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    // -------------------------------------------------------------------------
    // Directory
    // -------------------------------------------------------------------------

    /// Register a new profile. The id and timestamps are allocated here.
    pub async fn create_profile(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<Profile> {
        let now = Utc::now();
        let profile = Profile {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            display_name: display_name.map(|s| s.to_string()),
            avatar_url: None,
            created_at: now,
            last_seen: now,
        };

        sqlx::query(
            r#"
            INSERT INTO profiles (id, email, display_name, avatar_url, created_at, last_seen)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.email)
        .bind(&profile.display_name)
        .bind(&profile.avatar_url)
        .bind(profile.created_at)
        .bind(profile.last_seen)
        .execute(&self.pool)
        .await
        .context("Failed to create profile")?;

        self.changes.publish(Change::ProfileSaved(profile.clone()));

        Ok(profile)
    }

    /// Fetch a single profile by id.
    pub async fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, avatar_url, created_at, last_seen FROM profiles WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch profile")?;

        row.map(|r| profile_from_row(&r)).transpose()
    }

    /// Fetch a single profile by email, used by sign-in.
    pub async fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, avatar_url, created_at, last_seen FROM profiles WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch profile by email")?;

        row.map(|r| profile_from_row(&r)).transpose()
    }

    /// Everyone except the given identity, most recently seen first.
    pub async fn list_profiles(&self, excluding: &str) -> Result<Vec<Profile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, display_name, avatar_url, created_at, last_seen
            FROM profiles
            WHERE id != ?
            ORDER BY last_seen DESC
            "#,
        )
        .bind(excluding)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list profiles")?;

        rows.iter().map(profile_from_row).collect()
    }

    /// Presence update: bump `last_seen` to now. A no-op for unknown ids.
    pub async fn touch_last_seen(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE profiles SET last_seen = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update last_seen")?;

        if result.rows_affected() > 0 {
            if let Some(profile) = self.get_profile(id).await? {
                self.changes.publish(Change::ProfileSaved(profile));
            }
        }

        Ok(())
    }

    /// Profile edit: replace the display name and avatar reference.
    pub async fn update_profile(
        &self,
        id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Profile> {
        sqlx::query("UPDATE profiles SET display_name = ?, avatar_url = ? WHERE id = ?")
            .bind(display_name)
            .bind(avatar_url)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update profile")?;

        let profile = self
            .get_profile(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Profile {} not found", id))?;

        self.changes.publish(Change::ProfileSaved(profile.clone()));

        Ok(profile)
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Append a directed message. The id, creation time and the initial
    /// unread state are allocated here; subscribers hear about the row once
    /// the write is durable.
    pub async fn insert_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<DirectedMessage> {
        let message = DirectedMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, content, created_at, read)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.content)
        .bind(message.created_at)
        .bind(message.read)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        self.changes.publish(Change::MessageInserted(message.clone()));

        Ok(message)
    }

    /// The full two-party history between `a` and `b`, both directions,
    /// oldest first. Ties on the creation time fall back to the id so the
    /// ordering is stable across re-queries.
    pub async fn messages_between(&self, a: &str, b: &str) -> Result<Vec<DirectedMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sender_id, receiver_id, content, created_at, read
            FROM messages
            WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages")?;

        rows.iter().map(message_from_row).collect()
    }

    /// The most recent message between `a` and `b`, if any. One of the two
    /// per-contact lookups behind the conversation list.
    pub async fn latest_message_between(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<DirectedMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, sender_id, receiver_id, content, created_at, read
            FROM messages
            WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest message")?;

        row.map(|r| message_from_row(&r)).transpose()
    }

    /// How many messages from `sender_id` to `receiver_id` are still unread.
    pub async fn count_unread(&self, sender_id: &str, receiver_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS unread
            FROM messages
            WHERE sender_id = ? AND receiver_id = ? AND read = FALSE
            "#,
        )
        .bind(sender_id)
        .bind(receiver_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count unread messages")?;

        Ok(row.try_get("unread")?)
    }

    /// Bulk conditional read transition: every unread message from
    /// `sender_id` to `receiver_id` becomes read. Rows already read are not
    /// matched, so invoking this redundantly is harmless. Returns how many
    /// rows actually flipped.
    pub async fn mark_read(&self, sender_id: &str, receiver_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET read = TRUE
            WHERE sender_id = ? AND receiver_id = ? AND read = FALSE
            "#,
        )
        .bind(sender_id)
        .bind(receiver_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark messages as read")?;

        Ok(result.rows_affected())
    }
}

fn profile_from_row(row: &SqliteRow) -> Result<Profile> {
    Ok(Profile {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        created_at: row.try_get("created_at")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<DirectedMessage> {
    Ok(DirectedMessage {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        read: row.try_get("read")?,
    })
}
