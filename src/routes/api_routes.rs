use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::models::{ConversationRecord, Message};
use crate::service::ChatState;

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ImportRequest {
    pub path: PathBuf,
}

#[derive(Deserialize)]
pub struct StreamChunkRequest {
    pub content: String,
}

// ── Handlers ─────────────────────────────────────────────────────────────────
//
// This is the durable-storage surface exposed to hosts: list, load, save,
// create, import. It talks to the store directly and does not touch the
// active conversation; a host mixing this surface with the interactive one
// races under last-writer-wins, which is accepted.

/// GET `/api/conversations` — roster as JSON, most recent first.
pub async fn list_conversations_handler(State(state): State<ChatState>) -> Response {
    match state.store().list().await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}` — full record. Never fails: unknown or
/// corrupt ids come back as an empty conversation titled by the id.
pub async fn load_conversation_handler(
    Path(id): Path<String>,
    State(state): State<ChatState>,
) -> Response {
    Json(state.store().load(&id).await).into_response()
}

/// GET `/api/conversations/{id}/messages` — just the message list.
pub async fn list_messages_handler(
    Path(id): Path<String>,
    State(state): State<ChatState>,
) -> Response {
    Json(state.store().load(&id).await.messages).into_response()
}

/// POST `/api/conversations` — create an empty conversation, returning its id.
pub async fn create_conversation_handler(State(state): State<ChatState>) -> Response {
    match state.store().create().await {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT `/api/conversations/{id}` — wholesale overwrite of a record.
pub async fn save_conversation_handler(
    Path(id): Path<String>,
    State(state): State<ChatState>,
    Json(record): Json<ConversationRecord>,
) -> Response {
    match state.store().save(&id, &record.messages, &record.title).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/import` — import a record from a path on disk.
/// A missing source is 404; a source that exists but does not parse is the
/// documented soft failure, reported as a null id.
pub async fn import_conversation_handler(
    State(state): State<ChatState>,
    Json(request): Json<ImportRequest>,
) -> Response {
    match state.store().import(&request.path).await {
        Ok(Some(id)) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
        Ok(None) => (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "id": null }))).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Active-conversation surface ───────────────────────────────────────────────
//
// Used by the host's completion collaborator: it reads the truncated
// history after a regenerate, then feeds the new assistant output back in,
// either whole or as a stream.

/// POST `/api/conversations/active/messages` — append a host-supplied
/// message (assistant reply, tool result) to the active conversation.
pub async fn append_active_message_handler(
    State(state): State<ChatState>,
    Json(message): Json<Message>,
) -> Response {
    match state.append_message(message).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/stream/begin` — start a streamed assistant message. The
/// message lives only in memory until the stream ends.
pub async fn stream_begin_handler(State(state): State<ChatState>) -> Response {
    match state.begin_streaming_assistant().await {
        Ok(index) => Json(json!({ "index": index })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/stream/chunk` — grow the in-flight streamed message.
pub async fn stream_chunk_handler(
    State(state): State<ChatState>,
    Json(request): Json<StreamChunkRequest>,
) -> Response {
    match state.append_stream_chunk(&request.content).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/stream/end` — clear the streaming flag and persist.
pub async fn stream_end_handler(State(state): State<ChatState>) -> Response {
    match state.finalize_streaming().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helper ────────────────────────────────────────────────────────────────────

fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, err.to_string()).into_response()
}
