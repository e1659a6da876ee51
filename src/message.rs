//! Conversation messages and their metadata.
//!
//! Messages are the unit of the session history: user inputs, assistant
//! turns, system instructions, and tool results all flow through [`Message`].
//! Metadata carries engine annotations (callout tags, content hashes, source
//! cells) that context selection and analytics key on.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single entry in a session's conversation history.
///
/// # Examples
///
/// ```
/// use rvbbit::message::Message;
///
/// let user = Message::user("Summarize the report");
/// let reply = Message::assistant("Here is the summary...");
/// assert!(user.has_role(Message::USER));
/// assert!(!reply.has_role(Message::USER));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender (`user`, `assistant`, `system`, `tool`).
    pub role: String,
    /// Text content of the message.
    pub content: String,
    /// Engine annotations: callouts, content hash, source cell, turn index.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub metadata: FxHashMap<String, Value>,
}

impl Message {
    /// User input role.
    pub const USER: &'static str = "user";
    /// Assistant response role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System instruction role.
    pub const SYSTEM: &'static str = "system";
    /// Tool result role.
    pub const TOOL: &'static str = "tool";

    /// Metadata key carrying a callout label.
    pub const META_CALLOUT: &'static str = "callout";
    /// Metadata key recording which cell produced the message.
    pub const META_CELL: &'static str = "cell_name";
    /// Metadata key carrying the persisted content hash.
    pub const META_CONTENT_HASH: &'static str = "content_hash";

    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Self::USER, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    #[must_use]
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Self::TOOL, content)
    }

    /// Attach a metadata entry, returning the message for chaining.
    #[must_use]
    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Tag the message with the cell that produced it.
    #[must_use]
    pub fn from_cell(self, cell_name: &str) -> Self {
        self.with_meta(Self::META_CELL, Value::String(cell_name.to_string()))
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }

    /// The callout label attached to this message, if any.
    #[must_use]
    pub fn callout(&self) -> Option<&str> {
        self.metadata.get(Self::META_CALLOUT).and_then(Value::as_str)
    }

    /// The cell that produced this message, if recorded.
    #[must_use]
    pub fn source_cell(&self) -> Option<&str> {
        self.metadata.get(Self::META_CELL).and_then(Value::as_str)
    }

    /// The persisted content hash for this message, if recorded.
    #[must_use]
    pub fn content_hash(&self) -> Option<&str> {
        self.metadata
            .get(Self::META_CONTENT_HASH)
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_round_trips() {
        let msg = Message::assistant("done")
            .from_cell("extract")
            .with_meta(Message::META_CALLOUT, json!("final_answer"));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.source_cell(), Some("extract"));
        assert_eq!(decoded.callout(), Some("final_answer"));
    }

    #[test]
    fn empty_metadata_is_omitted_from_json() {
        let encoded = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!encoded.contains("metadata"));
    }
}
