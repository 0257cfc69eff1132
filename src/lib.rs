//! Two-party direct messaging core: a SQLite-backed store with an embedded
//! change feed, live per-conversation threads with read tracking, a
//! conversation list with unread counts, and a process-local pseudonym
//! directory, fronted by a small JSON/SSE API.

pub mod change;
pub mod client;
pub mod http;
pub mod model;
pub mod pseudonym;
pub mod roster;
pub mod session;
pub mod store;
pub mod thread;

pub use change::{Change, ChangeFeed};
pub use client::{ChatClient, ClientEvent};
pub use model::{ConversationSummary, DirectedMessage, Profile};
pub use pseudonym::PseudonymRegistry;
pub use roster::Roster;
pub use session::{Session, SessionState};
pub use store::Store;
pub use thread::{ThreadEvent, ThreadFeed};
