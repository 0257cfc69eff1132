use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, patch, post},
    Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::client::{ChatClient, ClientEvent};
use crate::model::{DirectedMessage, Profile};
use crate::session::SessionState;

// -----------------------------------------------------------------------------
// Request / response shapes
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileEdit {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub content: String,
}

/// A conversation-list row as the view renders it: the contact, their
/// process-local alias, the latest message either way and the unread count.
#[derive(Debug, Serialize)]
pub struct ContactEntry {
    pub profile: Profile,
    pub alias: String,
    pub alias_initial: String,
    pub last_message: Option<DirectedMessage>,
    pub unread: i64,
}

/// What opening a conversation returns: the peer (with pseudonym) and the
/// point-in-time message snapshot. Later appends come over `/api/updates`.
#[derive(Debug, Serialize)]
pub struct ThreadSnapshot {
    pub peer: Profile,
    pub alias: String,
    pub alias_initial: String,
    pub messages: Vec<DirectedMessage>,
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

pub fn router(client: Arc<ChatClient>) -> Router {
    Router::new()
        .route(
            "/api/session",
            get(session_handler)
                .post(sign_in_handler)
                .delete(sign_out_handler),
        )
        .route("/api/profile", patch(edit_profile_handler))
        .route("/api/contacts", get(contacts_handler))
        .route("/api/threads/:other_id/open", post(open_thread_handler))
        .route("/api/threads", delete(close_thread_handler))
        .route("/api/threads/:other_id/messages", post(send_handler))
        .route("/api/updates", get(updates_handler))
        .with_state(client)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn session_handler(State(client): State<Arc<ChatClient>>) -> impl IntoResponse {
    Json(client.session_state())
}

async fn sign_in_handler(
    State(client): State<Arc<ChatClient>>,
    Json(request): Json<SignInRequest>,
) -> Response {
    if request.email.trim().is_empty() {
        return unprocessable("The email must not be empty");
    }

    match client
        .sign_in(&request.email, request.display_name.as_deref())
        .await
    {
        Ok(profile) => Json(profile).into_response(),
        Err(e) => {
            error!("Sign-in failed: {:#}", e);
            internal_error()
        }
    }
}

async fn sign_out_handler(State(client): State<Arc<ChatClient>>) -> StatusCode {
    client.sign_out().await;
    StatusCode::NO_CONTENT
}

async fn edit_profile_handler(
    State(client): State<Arc<ChatClient>>,
    Json(edit): Json<ProfileEdit>,
) -> Response {
    if let Err(response) = ensure_signed_in(&client) {
        return response;
    }

    match client
        .update_profile(edit.display_name.as_deref(), edit.avatar_url.as_deref())
        .await
    {
        Ok(profile) => Json(profile).into_response(),
        Err(e) => {
            error!("Failed to update the profile: {:#}", e);
            internal_error()
        }
    }
}

async fn contacts_handler(State(client): State<Arc<ChatClient>>) -> Response {
    if let Err(response) = ensure_signed_in(&client) {
        return response;
    }

    let entries: Vec<ContactEntry> = client
        .contacts()
        .await
        .into_iter()
        .map(|summary| ContactEntry {
            alias: client.alias(&summary.profile.id),
            alias_initial: client.alias_initial(&summary.profile.id),
            profile: summary.profile,
            last_message: summary.last_message,
            unread: summary.unread,
        })
        .collect();

    Json(entries).into_response()
}

async fn open_thread_handler(
    State(client): State<Arc<ChatClient>>,
    Path(other_id): Path<String>,
) -> Response {
    if let Err(response) = ensure_signed_in(&client) {
        return response;
    }

    let peer = match client.peer(&other_id).await {
        Ok(Some(peer)) => peer,
        Ok(None) => return not_found("No such contact"),
        Err(e) => {
            error!("Failed to look up the contact: {:#}", e);
            return internal_error();
        }
    };

    match client.open_thread(&other_id).await {
        Ok(messages) => Json(ThreadSnapshot {
            alias: client.alias(&peer.id),
            alias_initial: client.alias_initial(&peer.id),
            peer,
            messages,
        })
        .into_response(),
        Err(e) => {
            error!("Failed to open the conversation: {:#}", e);
            internal_error()
        }
    }
}

async fn close_thread_handler(State(client): State<Arc<ChatClient>>) -> StatusCode {
    client.close_thread().await;
    StatusCode::NO_CONTENT
}

#[axum::debug_handler]
async fn send_handler(
    State(client): State<Arc<ChatClient>>,
    Path(other_id): Path<String>,
    Json(request): Json<SendRequest>,
) -> Response {
    if let Err(response) = ensure_signed_in(&client) {
        return response;
    }

    if request.content.trim().is_empty() {
        return unprocessable("The message must not be empty");
    }

    if client.active_peer().await.as_deref() != Some(other_id.as_str()) {
        return conflict("No open conversation with that contact");
    }

    match client.send_to(&other_id, &request.content).await {
        Ok(message) => Json(message).into_response(),
        Err(e) => {
            error!("Failed to send the message: {:#}", e);
            internal_error()
        }
    }
}

async fn updates_handler(
    State(client): State<Arc<ChatClient>>,
) -> Sse<impl Stream<Item = Result<Event, axum::BoxError>>> {
    info!("New updates subscriber connected");

    // Subscribe before reading the current state so nothing published in
    // between is missed.
    let mut rx = client.updates();
    let current = ClientEvent::Session(client.session_state());

    let stream = async_stream::stream! {
        // Open with the session state so late subscribers need not fetch
        // it separately.
        match serde_json::to_string(&current) {
            Ok(json) => yield Ok(Event::default().data(json)),
            Err(e) => error!("Failed to serialize the session state: {}", e),
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    match serde_json::to_string(&event) {
                        Ok(json) => yield Ok(Event::default().data(json)),
                        Err(e) => error!("Failed to serialize a client event: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Updates subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

// -----------------------------------------------------------------------------
// Response helpers
// -----------------------------------------------------------------------------

fn ensure_signed_in(client: &ChatClient) -> Result<(), Response> {
    match client.session_state() {
        SessionState::SignedIn(_) => Ok(()),
        _ => Err(unauthorized()),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "Not signed in" })),
    )
        .into_response()
}

fn unprocessable(message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn conflict(message: &str) -> Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "Internal error" })),
    )
        .into_response()
}
