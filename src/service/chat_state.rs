use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::AppError;
use crate::models::{Conversation, ConversationSummary, Message, MessageContent, Role};
use crate::store::ConversationStore;

const MAX_MESSAGE_LENGTH: usize = 8000;
const TITLE_MAX_CHARS: usize = 20;

#[derive(Default)]
struct StateInner {
    /// The one conversation currently loaded for display/editing.
    conversation: Option<Conversation>,
    /// Summaries of every known conversation, most recent first.
    roster: Vec<ConversationSummary>,
}

/// Immutable copy of the current state, handed to the render layer.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub conversation: Option<Conversation>,
    pub roster: Vec<ConversationSummary>,
}

/// In-memory chat state: the active conversation plus the conversation
/// roster, kept synchronized with the [`ConversationStore`].
///
/// Every mutation of the active messages or title persists before the
/// operation returns, so the store never trails the in-memory state. The
/// one exception is a message mid-stream, which is held in memory until
/// [`ChatState::finalize_streaming`].
///
/// A single cooperative writer is assumed. Two processes editing the same
/// conversation id race without detection; the later write wins.
#[derive(Clone)]
pub struct ChatState {
    store: ConversationStore,
    inner: Arc<RwLock<StateInner>>,
}

impl ChatState {
    pub fn new(store: ConversationStore) -> Self {
        Self { store, inner: Arc::new(RwLock::new(StateInner::default())) }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let guard = self.inner.read().await;
        ChatSnapshot {
            conversation: guard.conversation.clone(),
            roster: guard.roster.clone(),
        }
    }

    /// Re-fetches the conversation list from the store, replacing the
    /// roster outright.
    pub async fn refresh_roster(&self) -> Result<(), AppError> {
        let roster = self.store.list().await?;
        self.inner.write().await.roster = roster;
        Ok(())
    }

    /// Initial activation policy: after the first roster refresh, activate
    /// the most recently updated conversation if none is active yet.
    pub async fn bootstrap(&self) -> Result<(), AppError> {
        self.refresh_roster().await?;
        let first = {
            let guard = self.inner.read().await;
            match (&guard.conversation, guard.roster.first()) {
                (None, Some(summary)) => Some(summary.id.clone()),
                _ => None,
            }
        };
        if let Some(id) = first {
            info!("Activating most recent conversation {id}");
            self.activate(&id).await?;
        }
        Ok(())
    }

    /// Loads a conversation into the active slot, replacing whatever was
    /// there. An untitled record with messages gets its title derived (and
    /// persisted) on the way in.
    pub async fn activate(&self, id: &str) -> Result<(), AppError> {
        let mut conversation = self.store.load(id).await;
        let derived = derive_title_if_untitled(&mut conversation);
        self.inner.write().await.conversation = Some(conversation);
        if derived {
            self.persist_active().await?;
        }
        Ok(())
    }

    pub async fn create_and_activate(&self) -> Result<String, AppError> {
        let id = self.store.create().await?;
        self.refresh_roster().await?;
        self.activate(&id).await?;
        Ok(id)
    }

    /// Imports via the store. A produced id is refreshed and activated; a
    /// soft import failure leaves the state untouched.
    pub async fn import_and_activate(&self, source: &Path) -> Result<Option<String>, AppError> {
        match self.store.import(source).await? {
            Some(id) => {
                self.refresh_roster().await?;
                self.activate(&id).await?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Branches the active conversation: `messages[0..=at_index]` (clamped
    /// to the valid range) are copied into a fresh record, which becomes
    /// the active conversation. The source is untouched.
    pub async fn branch(&self, at_index: usize) -> Result<String, AppError> {
        let (subset, title) = {
            let guard = self.inner.read().await;
            let conv = guard.conversation.as_ref().ok_or(AppError::NoActiveConversation)?;
            let subset = if conv.messages.is_empty() {
                Vec::new()
            } else {
                let end = at_index.min(conv.messages.len() - 1);
                conv.messages[..=end].to_vec()
            };
            (subset, conv.title.clone())
        };

        let id = self.store.create().await?;
        self.store.save(&id, &subset, &title).await?;
        self.refresh_roster().await?;
        self.activate(&id).await?;
        Ok(id)
    }

    /// Replaces `messages[index]`'s content with plain text. Out-of-range
    /// indexes are a no-op.
    pub async fn edit_message_content(&self, index: usize, new_content: &str) -> Result<(), AppError> {
        {
            let mut guard = self.inner.write().await;
            let Some(conv) = guard.conversation.as_mut() else {
                return Ok(());
            };
            if index >= conv.messages.len() {
                debug!("Ignoring edit of message {index}, out of range");
                return Ok(());
            }
            conv.messages[index].content = MessageContent::Text(new_content.to_string());
            derive_title_if_untitled(conv);
        }
        self.persist_active().await
    }

    /// Drops the final message. Empty threads are a no-op.
    pub async fn remove_last_message(&self) -> Result<(), AppError> {
        {
            let mut guard = self.inner.write().await;
            let conv = guard.conversation.as_mut().ok_or(AppError::NoActiveConversation)?;
            if conv.messages.pop().is_none() {
                return Ok(());
            }
        }
        self.persist_active().await
    }

    /// Truncation primitive behind "regenerate": drops the final message,
    /// persists, and returns the remaining history for the host's
    /// completion request (which is outside this crate).
    pub async fn truncate_for_regenerate(&self) -> Result<Vec<Message>, AppError> {
        let remaining = {
            let mut guard = self.inner.write().await;
            let conv = guard.conversation.as_mut().ok_or(AppError::NoActiveConversation)?;
            conv.messages.pop();
            conv.messages.clone()
        };
        self.persist_active().await?;
        Ok(remaining)
    }

    /// Appends a user message, creating and activating a conversation first
    /// if none is active.
    pub async fn append_user_message(&self, text: &str) -> Result<(), AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        if text.len() > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: text.len(),
            });
        }

        let needs_conversation = self.inner.read().await.conversation.is_none();
        if needs_conversation {
            self.create_and_activate().await?;
        }
        self.append_message(Message::text(Role::User, text)).await
    }

    /// Appends a host-supplied message (assistant reply, tool result) to
    /// the active conversation.
    pub async fn append_message(&self, message: Message) -> Result<(), AppError> {
        {
            let mut guard = self.inner.write().await;
            let conv = guard.conversation.as_mut().ok_or(AppError::NoActiveConversation)?;
            conv.messages.push(message);
            derive_title_if_untitled(conv);
        }
        self.persist_active().await
    }

    /// Starts an assistant message that will arrive in chunks. The message
    /// exists only in memory until finalized; returns its index.
    pub async fn begin_streaming_assistant(&self) -> Result<usize, AppError> {
        let mut guard = self.inner.write().await;
        let conv = guard.conversation.as_mut().ok_or(AppError::NoActiveConversation)?;
        let mut message = Message::text(Role::Assistant, "");
        message.is_streaming = Some(true);
        conv.messages.push(message);
        Ok(conv.messages.len() - 1)
    }

    /// Grows the in-flight streamed message. Without one this is a no-op.
    pub async fn append_stream_chunk(&self, chunk: &str) -> Result<(), AppError> {
        let mut guard = self.inner.write().await;
        let conv = guard.conversation.as_mut().ok_or(AppError::NoActiveConversation)?;
        match conv.messages.last_mut() {
            Some(last) if last.is_streaming() => {
                match &mut last.content {
                    MessageContent::Text(text) => text.push_str(chunk),
                    parts @ MessageContent::Parts(_) => {
                        *parts = MessageContent::Text(chunk.to_string());
                    }
                }
                Ok(())
            }
            _ => {
                warn!("Dropping stream chunk, no message is streaming");
                Ok(())
            }
        }
    }

    /// Clears the streaming flag and performs the first persist of the
    /// streamed message. Without an in-flight message this is a no-op.
    pub async fn finalize_streaming(&self) -> Result<(), AppError> {
        {
            let mut guard = self.inner.write().await;
            let conv = guard.conversation.as_mut().ok_or(AppError::NoActiveConversation)?;
            match conv.messages.last_mut() {
                Some(last) if last.is_streaming() => last.is_streaming = None,
                _ => return Ok(()),
            }
            derive_title_if_untitled(conv);
        }
        self.persist_active().await
    }

    /// Explicitly retitles the active conversation.
    pub async fn rename_title(&self, title: &str) -> Result<(), AppError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::EmptyField { field_name: "title".to_string() });
        }
        {
            let mut guard = self.inner.write().await;
            let conv = guard.conversation.as_mut().ok_or(AppError::NoActiveConversation)?;
            conv.title = title.to_string();
        }
        self.persist_active().await
    }

    /// Saves the active conversation as it currently stands.
    async fn persist_active(&self) -> Result<(), AppError> {
        let (id, messages, title) = {
            let guard = self.inner.read().await;
            let conv = guard.conversation.as_ref().ok_or(AppError::NoActiveConversation)?;
            (conv.id.clone(), conv.messages.clone(), conv.title.clone())
        };
        self.store.save(&id, &messages, &title).await
    }
}

/// Derives a title from the first user message when the conversation has
/// never been titled (title still equals its id). Plain-string content is
/// used verbatim; text parts are joined with single spaces. The result is
/// cut to [`TITLE_MAX_CHARS`]. Returns whether the title changed.
///
/// Known quirk, preserved from the source behavior: manually renaming a
/// conversation to exactly its id re-arms derivation.
fn derive_title_if_untitled(conversation: &mut Conversation) -> bool {
    if conversation.title != conversation.id || conversation.messages.is_empty() {
        return false;
    }
    let Some(first_user) = conversation.messages.iter().find(|m| m.role == Role::User) else {
        return false;
    };
    let text = first_user.content.joined_text(" ");
    if text.is_empty() {
        return false;
    }
    conversation.title = text.chars().take(TITLE_MAX_CHARS).collect();
    true
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::models::ContentPart;

    async fn state_in(dir: &TempDir) -> ChatState {
        let store = ConversationStore::open(dir.path().join("conversations"))
            .await
            .expect("store should open in a temp dir");
        ChatState::new(store)
    }

    async fn active(state: &ChatState) -> Conversation {
        state
            .snapshot()
            .await
            .conversation
            .expect("a conversation should be active")
    }

    #[tokio::test]
    async fn create_and_activate_yields_an_empty_untitled_conversation() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;

        let id = state.create_and_activate().await.unwrap();
        let conv = active(&state).await;
        assert_eq!(conv.id, id);
        assert_eq!(conv.title, id);
        assert_eq!(conv.messages, vec![]);
        assert_eq!(state.snapshot().await.roster.len(), 1);
    }

    #[tokio::test]
    async fn first_user_message_titles_the_conversation() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.create_and_activate().await.unwrap();

        state
            .append_user_message("Hello there, how are you doing today friend")
            .await
            .unwrap();

        let conv = active(&state).await;
        assert_eq!(conv.title, "Hello there, how are");
        // The derived title is persisted, not just in memory.
        assert_eq!(state.store().load(&id).await.title, "Hello there, how are");
    }

    #[tokio::test]
    async fn title_derivation_joins_text_parts_with_spaces() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        state.create_and_activate().await.unwrap();

        let mut message = Message::text(Role::User, "");
        message.content = MessageContent::Parts(vec![
            ContentPart::text("Hello"),
            ContentPart::text("world"),
        ]);
        state.append_message(message).await.unwrap();

        assert_eq!(active(&state).await.title, "Hello world");
    }

    #[tokio::test]
    async fn titles_are_derived_only_once() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        state.create_and_activate().await.unwrap();

        state.append_user_message("First message wins").await.unwrap();
        state.append_user_message("Second message changes nothing").await.unwrap();

        assert_eq!(active(&state).await.title, "First message wins");
    }

    #[tokio::test]
    async fn activation_titles_an_untitled_record_with_messages() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.store().create().await.unwrap();
        state
            .store()
            .save(&id, &[Message::text(Role::User, "Recovered transcript")], &id)
            .await
            .unwrap();

        state.activate(&id).await.unwrap();

        assert_eq!(active(&state).await.title, "Recovered transcript");
        assert_eq!(state.store().load(&id).await.title, "Recovered transcript");
    }

    #[tokio::test]
    async fn branch_copies_the_prefix_and_leaves_the_source_alone() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let source = state.create_and_activate().await.unwrap();
        for text in ["one", "two", "three", "four"] {
            state.append_message(Message::text(Role::User, text)).await.unwrap();
        }
        let source_messages = active(&state).await.messages;

        let branched = state.branch(1).await.unwrap();

        let conv = active(&state).await;
        assert_ne!(branched, source);
        assert_eq!(conv.id, branched);
        assert_eq!(conv.messages, source_messages[..2].to_vec());
        assert_eq!(state.store().load(&source).await.messages, source_messages);
        assert_eq!(state.snapshot().await.roster.len(), 2);
    }

    #[tokio::test]
    async fn branch_clamps_an_out_of_range_index() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        state.create_and_activate().await.unwrap();
        state.append_message(Message::text(Role::User, "a")).await.unwrap();
        state.append_message(Message::text(Role::Assistant, "b")).await.unwrap();

        state.branch(99).await.unwrap();

        assert_eq!(active(&state).await.messages.len(), 2);
    }

    #[tokio::test]
    async fn edit_replaces_content_in_place() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.create_and_activate().await.unwrap();
        state.append_user_message("draft wording").await.unwrap();

        state.edit_message_content(0, "final wording").await.unwrap();

        let conv = active(&state).await;
        assert_eq!(conv.messages[0].content, MessageContent::Text("final wording".into()));
        assert_eq!(
            state.store().load(&id).await.messages[0].content,
            MessageContent::Text("final wording".into())
        );
    }

    #[tokio::test]
    async fn edit_out_of_range_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        state.create_and_activate().await.unwrap();
        state.append_user_message("only message").await.unwrap();
        let before = active(&state).await.messages;

        state.edit_message_content(5, "never applied").await.unwrap();

        assert_eq!(active(&state).await.messages, before);
    }

    #[tokio::test]
    async fn remove_last_message_pops_and_persists() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.create_and_activate().await.unwrap();
        state.append_message(Message::text(Role::User, "kept")).await.unwrap();
        state.append_message(Message::text(Role::Assistant, "dropped")).await.unwrap();

        state.remove_last_message().await.unwrap();

        assert_eq!(active(&state).await.messages, vec![Message::text(Role::User, "kept")]);
        assert_eq!(state.store().load(&id).await.messages.len(), 1);
    }

    #[tokio::test]
    async fn truncate_for_regenerate_returns_the_remaining_history() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.create_and_activate().await.unwrap();
        state.append_message(Message::text(Role::User, "question")).await.unwrap();
        state.append_message(Message::text(Role::Assistant, "poor answer")).await.unwrap();

        let history = state.truncate_for_regenerate().await.unwrap();

        assert_eq!(history, vec![Message::text(Role::User, "question")]);
        assert_eq!(state.store().load(&id).await.messages, history);
    }

    #[tokio::test]
    async fn append_user_message_rejects_blank_and_oversized_input() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;

        let blank = state.append_user_message("   ").await.expect_err("blank must fail");
        assert!(blank.is_validation());

        let oversized = "a".repeat(MAX_MESSAGE_LENGTH + 1);
        let too_long = state
            .append_user_message(&oversized)
            .await
            .expect_err("oversized must fail");
        assert!(too_long.is_validation());
        assert!(state.snapshot().await.conversation.is_none());
    }

    #[tokio::test]
    async fn append_user_message_creates_a_conversation_when_none_is_active() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;

        state.append_user_message("hello").await.unwrap();

        let conv = active(&state).await;
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(state.snapshot().await.roster.len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_activates_the_most_recent_conversation() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        state.store().create().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let newer = state.store().create().await.unwrap();

        state.bootstrap().await.unwrap();

        assert_eq!(active(&state).await.id, newer);
    }

    #[tokio::test]
    async fn bootstrap_with_no_conversations_stays_inactive() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;

        state.bootstrap().await.unwrap();

        assert!(state.snapshot().await.conversation.is_none());
    }

    #[tokio::test]
    async fn failed_import_leaves_the_state_untouched() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.create_and_activate().await.unwrap();

        let source = dir.path().join("garbage.json");
        tokio::fs::write(&source, "not a record").await.unwrap();
        assert_eq!(state.import_and_activate(&source).await.unwrap(), None);
        assert_eq!(active(&state).await.id, id);

        let missing = dir.path().join("missing.json");
        let err = state.import_and_activate(&missing).await.expect_err("hard error");
        assert!(err.is_not_found());
        assert_eq!(active(&state).await.id, id);
    }

    #[tokio::test]
    async fn successful_import_activates_the_new_record() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;

        let source = dir.path().join("export.json");
        tokio::fs::write(
            &source,
            r#"{"title":"X","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .await
        .unwrap();

        let id = state.import_and_activate(&source).await.unwrap().unwrap();
        let conv = active(&state).await;
        assert_eq!(conv.id, id);
        assert_eq!(conv.title, "X");
        assert_eq!(conv.messages.len(), 1);
    }

    #[tokio::test]
    async fn streamed_messages_persist_only_on_finalize() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.create_and_activate().await.unwrap();

        state.begin_streaming_assistant().await.unwrap();
        state.append_stream_chunk("Partial ").await.unwrap();
        state.append_stream_chunk("answer").await.unwrap();
        assert_eq!(state.store().load(&id).await.messages, vec![]);

        state.finalize_streaming().await.unwrap();

        let persisted = state.store().load(&id).await.messages;
        assert_eq!(persisted, vec![Message::text(Role::Assistant, "Partial answer")]);
        assert!(!persisted[0].is_streaming());
    }

    #[tokio::test]
    async fn rename_title_persists_and_rejects_blank_titles() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).await;
        let id = state.create_and_activate().await.unwrap();

        state.rename_title("Weekend plans").await.unwrap();
        assert_eq!(state.store().load(&id).await.title, "Weekend plans");

        let err = state.rename_title("  ").await.expect_err("blank title must fail");
        assert!(err.is_validation());
    }
}
