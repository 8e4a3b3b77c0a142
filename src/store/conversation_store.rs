use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Conversation, ConversationRecord, ConversationSummary, Message};

/// File-backed conversation storage: one pretty-printed JSON record per
/// conversation, named `{id}.json` under the directory given at `open`.
///
/// Read paths degrade (a missing or corrupt record loads as an empty
/// conversation); write paths propagate I/O failures. Writes are wholesale
/// overwrites with no cross-process coordination, so concurrent writers to
/// the same id are last-writer-wins.
#[derive(Clone)]
pub struct ConversationStore {
    root: PathBuf,
}

/// Borrowed view of a record for serialization, so `save` doesn't clone the
/// message list.
#[derive(Serialize)]
struct RecordRef<'a> {
    title: &'a str,
    messages: &'a [Message],
}

impl ConversationStore {
    /// Opens the store rooted at `root`, creating the directory tree if
    /// needed. Failure here is fatal to the application: without a writable
    /// root no other operation can succeed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            error!("Failed to create conversations directory {}: {e}", root.display());
            AppError::storage(
                format!("Failed to create conversations directory {}", root.display()),
                e,
            )
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Parses a conversation record. Callers decide the fallback policy;
    /// this function only reports.
    pub fn parse_record(content: &str) -> Result<ConversationRecord, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Reads and parses the record for `id`. `Ok(None)` means the file does
    /// not exist; read and parse failures are surfaced as errors.
    async fn read_record(&self, id: &str) -> Result<Option<ConversationRecord>, AppError> {
        let path = self.record_path(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::storage(
                    format!("Failed to read conversation file {}", path.display()),
                    e,
                ))
            }
        };
        Self::parse_record(&content)
            .map(Some)
            .map_err(AppError::MalformedRecord)
    }

    /// Loads a conversation. Never fails: a missing, unreadable, or
    /// malformed record degrades to `{messages: [], title: id}`.
    pub async fn load(&self, id: &str) -> Conversation {
        let record = match self.read_record(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Conversation {id} has no record yet, loading empty");
                ConversationRecord::default()
            }
            Err(e) => {
                warn!("Falling back to empty conversation for {id}: {e}");
                ConversationRecord::default()
            }
        };
        let title = if record.title.is_empty() {
            id.to_string()
        } else {
            record.title
        };
        Conversation { id: id.to_string(), title, messages: record.messages }
    }

    /// Overwrites the record for `id` wholesale.
    pub async fn save(&self, id: &str, messages: &[Message], title: &str) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(&RecordRef { title, messages })
            .map_err(AppError::MalformedRecord)?;
        let path = self.record_path(id);
        tokio::fs::write(&path, json).await.map_err(|e| {
            error!("Failed to write conversation {id}: {e}");
            AppError::storage(format!("Failed to write conversation file {}", path.display()), e)
        })
    }

    /// Creates and persists a fresh, empty conversation titled by its own id.
    /// Returns the generated id.
    pub async fn create(&self) -> Result<String, AppError> {
        let id = Uuid::new_v4().to_string();
        self.save(&id, &[], &id).await?;
        Ok(id)
    }

    /// Lists all conversations, most recently updated first. Every record
    /// file is listed even when its content is unreadable; the stored title
    /// is used when present and the id otherwise.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, AppError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            error!("Failed to read conversations directory {}: {e}", self.root.display());
            AppError::storage(
                format!("Failed to read conversations directory {}", self.root.display()),
                e,
            )
        })?;

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            AppError::storage("Failed to enumerate conversations directory", e)
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Skipping {} in listing, no metadata: {e}", path.display());
                    continue;
                }
            };

            // Defensive title read: a corrupt record still appears in the
            // listing under its filename-derived id.
            let title = match self.read_record(&id).await {
                Ok(Some(record)) if !record.title.is_empty() => record.title,
                Ok(_) => id.clone(),
                Err(e) => {
                    debug!("Using id as title for {id}: {e}");
                    id.clone()
                }
            };

            summaries.push(ConversationSummary {
                id,
                title,
                updated_at: DateTime::<Utc>::from(modified),
            });
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Imports a conversation record from an arbitrary path, persisting it
    /// under a fresh id. A missing source is a hard error; a source that
    /// exists but does not parse is reported as `Ok(None)` and logged.
    pub async fn import(&self, source: &Path) -> Result<Option<String>, AppError> {
        let content = match tokio::fs::read_to_string(source).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AppError::import_source_not_found(source))
            }
            Err(e) => {
                return Err(AppError::storage(
                    format!("Failed to read import source {}", source.display()),
                    e,
                ))
            }
        };

        match Self::parse_record(&content) {
            Ok(record) => {
                let id = Uuid::new_v4().to_string();
                let title = if record.title.is_empty() { id.clone() } else { record.title };
                self.save(&id, &record.messages, &title).await?;
                Ok(Some(id))
            }
            Err(e) => {
                error!("Failed to import conversation from {}: {e}", source.display());
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::models::Role;

    async fn open_store(dir: &TempDir) -> ConversationStore {
        ConversationStore::open(dir.path().join("conversations"))
            .await
            .expect("store should open in a temp dir")
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::text(Role::User, "hello"),
            Message::text(Role::Assistant, "hi, how can I help?"),
        ]
    }

    #[tokio::test]
    async fn save_then_load_round_trips_exactly() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let messages = sample_messages();
        store.save("abc", &messages, "Greetings").await.unwrap();

        let loaded = store.load("abc").await;
        assert_eq!(loaded.title, "Greetings");
        assert_eq!(loaded.messages, messages);
    }

    #[tokio::test]
    async fn save_overwrites_wholesale() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.save("abc", &sample_messages(), "First").await.unwrap();
        let shorter = vec![Message::text(Role::User, "only this")];
        store.save("abc", &shorter, "Second").await.unwrap();

        let loaded = store.load("abc").await;
        assert_eq!(loaded.title, "Second");
        assert_eq!(loaded.messages, shorter);
    }

    #[tokio::test]
    async fn load_missing_conversation_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let loaded = store.load("no-such-id").await;
        assert_eq!(loaded.title, "no-such-id");
        assert_eq!(loaded.messages, vec![]);
    }

    #[tokio::test]
    async fn load_corrupt_record_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        tokio::fs::write(store.root().join("broken.json"), "{not json at all")
            .await
            .unwrap();

        let loaded = store.load("broken").await;
        assert_eq!(loaded.title, "broken");
        assert_eq!(loaded.messages, vec![]);
    }

    #[tokio::test]
    async fn create_persists_an_empty_record_with_unique_ids() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();
        assert_ne!(a, b);

        let loaded = store.load(&a).await;
        assert_eq!(loaded.title, a);
        assert_eq!(loaded.messages, vec![]);
    }

    #[tokio::test]
    async fn list_orders_by_recency_descending() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let older = store.create().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let newer = store.create().await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![newer, older]);
    }

    #[tokio::test]
    async fn list_keeps_corrupt_records_titled_by_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.save("titled", &[], "A real title").await.unwrap();
        tokio::fs::write(store.root().join("corrupt.json"), "][").await.unwrap();

        let mut summaries = store.list().await.unwrap();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "corrupt");
        assert_eq!(summaries[0].title, "corrupt");
        assert_eq!(summaries[1].title, "A real title");
    }

    #[tokio::test]
    async fn import_missing_source_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let err = store
            .import(&dir.path().join("nowhere.json"))
            .await
            .expect_err("missing source must fail");
        assert!(err.is_not_found());
        assert_eq!(store.list().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn import_persists_under_a_fresh_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let existing = store.create().await.unwrap();

        let source = dir.path().join("export.json");
        tokio::fs::write(
            &source,
            r#"{"title":"X","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .await
        .unwrap();

        let id = store.import(&source).await.unwrap().expect("import should produce an id");
        assert_ne!(id, existing);

        let loaded = store.load(&id).await;
        assert_eq!(loaded.title, "X");
        assert_eq!(loaded.messages, vec![Message::text(Role::User, "hi")]);
    }

    #[tokio::test]
    async fn import_malformed_source_is_a_soft_failure() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let source = dir.path().join("garbage.json");
        tokio::fs::write(&source, "not a record").await.unwrap();

        assert_eq!(store.import(&source).await.unwrap(), None);
        assert_eq!(store.list().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn import_defaults_title_to_the_new_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let source = dir.path().join("untitled.json");
        tokio::fs::write(&source, r#"{"messages":[]}"#).await.unwrap();

        let id = store.import(&source).await.unwrap().unwrap();
        let loaded = store.load(&id).await;
        assert_eq!(loaded.title, id);
    }
}
