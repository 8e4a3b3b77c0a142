use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a chat message, stored lowercase in conversation files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a structured message body. Only `"text"` parts carry
/// renderable text; anything else round-trips through `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

/// Message body: either a plain string or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenates the renderable text of this body. Plain strings are
    /// returned verbatim; for parts, every `"text"`-typed entry is joined
    /// with `separator` and other kinds are skipped.
    pub fn joined_text(&self, separator: &str) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(separator),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// A tool invocation issued by an assistant message. The payload shape is
/// provider-defined, so everything beyond `id` stays an opaque map; the
/// paired result lives in a later `tool`-role message referencing this id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    /// Display name, dug out of `name` or `function.name` in the payload.
    pub fn display_name(&self) -> &str {
        if let Some(name) = self.payload.get("name").and_then(|v| v.as_str()) {
            return name;
        }
        self.payload
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("tool")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Transient marker for an assistant message still being streamed in.
    /// Cleared before the message is ever persisted.
    #[serde(
        rename = "isStreaming",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub is_streaming: Option<bool>,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
            is_streaming: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming == Some(true)
    }
}

/// Body of a conversation file. Both fields are optional on disk; a record
/// that is missing either still loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// A loaded conversation: the record plus the id it is stored under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

/// Roster row for the sidebar, sorted by recency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}
