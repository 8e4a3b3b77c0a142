use std::path::Path as FsPath;

use askama::Template;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Form;
use tracing::warn;

use crate::errors::AppError;
use crate::models::ConversationSummary;
use crate::service::chat_state::ChatSnapshot;
use crate::service::ChatState;
use crate::views::{build_thread, MessageCapabilities, MessageView};

// ── Form inputs ───────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct MessageForm {
    pub content: String,
}

#[derive(serde::Deserialize)]
pub struct ImportForm {
    pub path: String,
}

#[derive(serde::Deserialize)]
pub struct TitleForm {
    pub title: String,
}

// ── Template structs ──────────────────────────────────────────────────────────

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    conversations: Vec<ConversationSummary>,
    active_conversation_id: String,
    has_conversation: bool,
    conversation_title: String,
    conversation_id: String,
    messages: Vec<MessageView>,
}

#[derive(Template)]
#[template(path = "chat_panel.html")]
struct ChatPanelTemplate {
    has_conversation: bool,
    conversation_title: String,
    conversation_id: String,
    messages: Vec<MessageView>,
}

#[derive(Template)]
#[template(path = "sidebar.html")]
struct SidebarTemplate {
    conversations: Vec<ConversationSummary>,
    active_conversation_id: String,
}

#[derive(Template)]
#[template(path = "error_fragment.html")]
struct ErrorFragmentTemplate {
    error_message: String,
}

/// This host grants every interaction; narrower embeddings (a read-only
/// transcript viewer, say) would grant fewer.
const CAPS: MessageCapabilities = MessageCapabilities::all();

impl ChatPanelTemplate {
    fn from_snapshot(snapshot: &ChatSnapshot) -> Self {
        match &snapshot.conversation {
            Some(conv) => Self {
                has_conversation: true,
                conversation_title: conv.title.clone(),
                conversation_id: conv.id.clone(),
                messages: build_thread(&conv.messages, CAPS),
            },
            None => Self {
                has_conversation: false,
                conversation_title: String::new(),
                conversation_id: String::new(),
                messages: vec![],
            },
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// GET `/` — full chat page.
pub async fn index_handler(State(state): State<ChatState>) -> Response {
    if let Err(e) = state.refresh_roster().await {
        warn!("Roster refresh failed while rendering index: {e}");
    }
    let snapshot = state.snapshot().await;
    let panel = ChatPanelTemplate::from_snapshot(&snapshot);
    let tmpl = IndexTemplate {
        active_conversation_id: snapshot
            .conversation
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default(),
        conversations: snapshot.roster,
        has_conversation: panel.has_conversation,
        conversation_title: panel.conversation_title,
        conversation_id: panel.conversation_id,
        messages: panel.messages,
    };
    render(tmpl)
}

/// GET `/fragments/sidebar` — roster re-render (HTMX swap into `#sidebar`).
pub async fn sidebar_fragment_handler(State(state): State<ChatState>) -> Response {
    if let Err(e) = state.refresh_roster().await {
        warn!("Roster refresh failed while rendering sidebar: {e}");
    }
    let snapshot = state.snapshot().await;
    render(SidebarTemplate {
        active_conversation_id: snapshot
            .conversation
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default(),
        conversations: snapshot.roster,
    })
}

/// GET `/chat/new` — create and activate an empty conversation.
pub async fn new_chat_handler(State(state): State<ChatState>) -> Response {
    match state.create_and_activate().await {
        Ok(_) => panel_response(&state, true).await,
        Err(e) => error_response(&e),
    }
}

/// GET `/chat/{id}` — activate an existing conversation.
pub async fn load_chat_handler(Path(id): Path<String>, State(state): State<ChatState>) -> Response {
    match state.activate(&id).await {
        Ok(()) => panel_response(&state, false).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/chat/import` — import from a path chosen by the host's file
/// picker. A soft parse failure renders an error fragment and leaves the
/// current conversation alone.
pub async fn import_handler(
    State(state): State<ChatState>,
    Form(form): Form<ImportForm>,
) -> Response {
    match state.import_and_activate(FsPath::new(&form.path)).await {
        Ok(Some(_)) => panel_response(&state, true).await,
        Ok(None) => {
            let tmpl = ErrorFragmentTemplate {
                error_message: "The selected file is not an importable conversation".to_string(),
            };
            match tmpl.render() {
                Ok(html) => (StatusCode::UNPROCESSABLE_ENTITY, Html(html)).into_response(),
                Err(_) => StatusCode::UNPROCESSABLE_ENTITY.into_response(),
            }
        }
        Err(e) => error_response(&e),
    }
}

/// POST `/chat/title` — rename the active conversation.
pub async fn rename_title_handler(
    State(state): State<ChatState>,
    Form(form): Form<TitleForm>,
) -> Response {
    match state.rename_title(&form.title).await {
        Ok(()) => panel_response(&state, true).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/chat/messages` — append a user message (creating a conversation
/// first when none is active).
pub async fn append_message_handler(
    State(state): State<ChatState>,
    Form(form): Form<MessageForm>,
) -> Response {
    match state.append_user_message(&form.content).await {
        Ok(()) => panel_response(&state, true).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/chat/messages/{index}/edit` — replace a message's content with
/// the submitted draft.
pub async fn edit_message_handler(
    Path(index): Path<usize>,
    State(state): State<ChatState>,
    Form(form): Form<MessageForm>,
) -> Response {
    match state.edit_message_content(index, &form.content).await {
        Ok(()) => panel_response(&state, true).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/chat/messages/{index}/branch` — fork the conversation up to and
/// including the given message.
pub async fn branch_message_handler(
    Path(index): Path<usize>,
    State(state): State<ChatState>,
) -> Response {
    match state.branch(index).await {
        Ok(_) => panel_response(&state, true).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/chat/messages/last/remove` — drop the final message.
pub async fn remove_last_handler(State(state): State<ChatState>) -> Response {
    match state.remove_last_message().await {
        Ok(()) => panel_response(&state, false).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/chat/messages/last/regenerate` — truncate the final message so
/// the host can request a fresh completion for that position. The
/// completion call itself lives outside this application.
pub async fn regenerate_handler(State(state): State<ChatState>) -> Response {
    match state.truncate_for_regenerate().await {
        Ok(_) => panel_response(&state, false).await,
        Err(e) => error_response(&e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn panel_response(state: &ChatState, roster_changed: bool) -> Response {
    let snapshot = state.snapshot().await;
    match ChatPanelTemplate::from_snapshot(&snapshot).render() {
        Ok(html) => {
            let mut resp = Html(html).into_response();
            if roster_changed {
                // Nudge the sidebar to re-fetch itself.
                resp.headers_mut()
                    .insert("HX-Trigger", HeaderValue::from_static("refresh-roster"));
            }
            resp
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Template error: {e}")).into_response(),
    }
}

fn render<T: Template>(tmpl: T) -> Response {
    match tmpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Template error: {e}")).into_response(),
    }
}

fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let tmpl = ErrorFragmentTemplate { error_message: err.to_string() };
    match tmpl.render() {
        Ok(html) => (status, Html(html)).into_response(),
        Err(_) => (status, err.to_string()).into_response(),
    }
}
