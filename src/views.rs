use serde_json::Value;

use crate::models::{Message, Role};

/// Which interactions the host supports in the current context. The view
/// offers an affordance only when its capability is granted here, instead
/// of inferring support from the presence of a callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCapabilities {
    pub can_edit: bool,
    pub can_branch: bool,
    pub can_regenerate: bool,
    pub can_remove: bool,
}

impl MessageCapabilities {
    pub const fn all() -> Self {
        Self { can_edit: true, can_branch: true, can_regenerate: true, can_remove: true }
    }
}

/// A tool invocation flattened for rendering, paired with its result if one
/// has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallView {
    pub id: String,
    pub name: String,
    pub payload: String,
    pub result: Option<String>,
}

/// View model for a single message. Everything the template needs is
/// resolved here; the template itself stays logic-free.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub index: usize,
    pub role: &'static str,
    pub is_user: bool,
    pub is_last: bool,
    pub is_streaming: bool,
    /// Display text; also seeds the edit draft.
    pub text: String,
    /// Present only when disclosure should be offered.
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallView>,
    pub can_edit: bool,
    pub can_branch: bool,
    pub can_regenerate: bool,
    pub can_remove: bool,
}

impl MessageView {
    /// Builds the view model for `message`. Branch/regenerate/remove are
    /// offered only on the last message of the thread, and every affordance
    /// additionally requires its capability.
    pub fn build(
        index: usize,
        message: &Message,
        all_messages: &[Message],
        is_last: bool,
        caps: MessageCapabilities,
    ) -> Self {
        let is_user = message.role == Role::User;

        let reasoning = match &message.reasoning {
            Some(reasoning) if !is_user && !reasoning.is_empty() => Some(reasoning.clone()),
            _ => None,
        };

        let tool_calls = message
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|call| ToolCallView {
                id: call.id.clone(),
                name: call.display_name().to_string(),
                payload: serde_json::to_string_pretty(&Value::Object(call.payload.clone()))
                    .unwrap_or_default(),
                result: find_tool_result(all_messages, &call.id),
            })
            .collect();

        Self {
            index,
            role: message.role.as_str(),
            is_user,
            is_last,
            is_streaming: message.is_streaming(),
            text: message.content.joined_text("\n"),
            reasoning,
            tool_calls,
            can_edit: caps.can_edit,
            can_branch: caps.can_branch && is_last,
            can_regenerate: caps.can_regenerate && is_last,
            can_remove: caps.can_remove && is_last,
        }
    }
}

/// Builds the full thread, marking the final message.
pub fn build_thread(messages: &[Message], caps: MessageCapabilities) -> Vec<MessageView> {
    let last = messages.len().saturating_sub(1);
    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            MessageView::build(index, message, messages, index == last, caps)
        })
        .collect()
}

/// Locates the result paired with a tool call: the first `tool`-role
/// message whose `tool_call_id` matches. The reference is soft; a call
/// whose result has not arrived yet simply has none.
fn find_tool_result(all_messages: &[Message], tool_call_id: &str) -> Option<String> {
    if tool_call_id.is_empty() {
        return None;
    }
    all_messages
        .iter()
        .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(tool_call_id))
        .map(|m| m.content.joined_text("\n"))
}
