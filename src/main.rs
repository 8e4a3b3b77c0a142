mod errors;
mod models;
mod routes;
mod service;
mod store;
mod views;

use std::path::PathBuf;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::routes::api_routes::{
    append_active_message_handler, create_conversation_handler, import_conversation_handler,
    list_conversations_handler, list_messages_handler, load_conversation_handler,
    save_conversation_handler, stream_begin_handler, stream_chunk_handler, stream_end_handler,
};
use crate::routes::chat_routes::{
    append_message_handler, branch_message_handler, edit_message_handler, import_handler,
    index_handler, load_chat_handler, new_chat_handler, regenerate_handler, remove_last_handler,
    rename_title_handler, sidebar_fragment_handler,
};
use crate::service::ChatState;
use crate::store::ConversationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "local_chat=debug,tower_http=debug".into()),
        )
        .init();

    // ── Storage ───────────────────────────────────────────────────────────────
    let data_dir = match std::env::var("CHAT_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => dirs::data_dir()
            .context("No platform data directory available; set CHAT_DATA_DIR")?
            .join("local_chat"),
    };
    let store = ConversationStore::open(data_dir.join("conversations")).await?;
    info!("Conversation store rooted at {}", store.root().display());

    // ── State wiring ──────────────────────────────────────────────────────────
    let state = ChatState::new(store);
    state.bootstrap().await?;

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        // Page + fragment routes
        .route("/", get(index_handler))
        .route("/fragments/sidebar", get(sidebar_fragment_handler))
        .route("/chat/new", get(new_chat_handler))
        .route("/chat/{id}", get(load_chat_handler))
        .route("/chat/import", post(import_handler))
        .route("/chat/title", post(rename_title_handler))
        .route("/chat/messages", post(append_message_handler))
        .route("/chat/messages/{index}/edit", post(edit_message_handler))
        .route("/chat/messages/{index}/branch", post(branch_message_handler))
        .route("/chat/messages/last/remove", post(remove_last_handler))
        .route("/chat/messages/last/regenerate", post(regenerate_handler))
        // JSON storage surface
        .route(
            "/api/conversations",
            get(list_conversations_handler).post(create_conversation_handler),
        )
        .route("/api/conversations/import", post(import_conversation_handler))
        .route(
            "/api/conversations/{id}",
            get(load_conversation_handler).put(save_conversation_handler),
        )
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .route(
            "/api/conversations/active/messages",
            post(append_active_message_handler),
        )
        .route("/api/stream/begin", post(stream_begin_handler))
        .route("/api/stream/chunk", post(stream_chunk_handler))
        .route("/api/stream/end", post(stream_end_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Listen ────────────────────────────────────────────────────────────────
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
