//! Core identity types shared across the engine.
//!
//! Sessions, traces, and log-row node types are the vocabulary every other
//! module speaks. Runtime-only types (suspension records, run outcomes) live
//! in [`crate::runner`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classifies a row in the execution log.
///
/// One session produces many rows of different kinds: LLM calls, tool
/// activity, candidate attempts, ward verdicts, late-arriving cost patches.
/// The node type is the primary discriminator analytics queries filter on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// An LLM call made on behalf of a cell (one per turn).
    Agent,
    /// A tool invocation requested by the model or a deterministic cell.
    ToolCall,
    /// The result of a tool invocation.
    ToolResult,
    /// One candidate attempt in a fan-out batch.
    SoundingAttempt,
    /// A human-in-the-loop suspension point.
    Checkpoint,
    /// Late-arriving provider cost data patched onto an earlier request.
    CostUpdate,
    /// The verdict of a ward (pre/post/turn validator).
    WardResult,
    /// An embedding request (RAG indexing, semantic context selection).
    Embedding,
    /// Free-form user input injected into the session.
    User,
    /// Engine-generated bookkeeping (routing notes, suspensions, errors).
    System,
}

impl NodeType {
    /// Stable string form used in persisted rows and event payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Agent => "agent",
            NodeType::ToolCall => "tool_call",
            NodeType::ToolResult => "tool_result",
            NodeType::SoundingAttempt => "sounding_attempt",
            NodeType::Checkpoint => "checkpoint",
            NodeType::CostUpdate => "cost_update",
            NodeType::WardResult => "ward_result",
            NodeType::Embedding => "embedding",
            NodeType::User => "user",
            NodeType::System => "system",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh trace id (UUID v4).
#[must_use]
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a fresh session id.
///
/// Session ids are opaque strings; callers may supply their own when
/// resuming or correlating with external systems.
#[must_use]
pub fn new_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_through_serde() {
        let encoded = serde_json::to_string(&NodeType::SoundingAttempt).unwrap();
        assert_eq!(encoded, "\"sounding_attempt\"");
        let decoded: NodeType = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, NodeType::SoundingAttempt);
    }

    #[test]
    fn display_matches_serde_form() {
        assert_eq!(NodeType::CostUpdate.to_string(), "cost_update");
        assert_eq!(NodeType::Agent.to_string(), "agent");
    }
}
