//! The wide, append-only log row.
//!
//! Every message and event in a session becomes one row. Most fields are
//! nullable: a `cost_update` row has no content worth hashing, a ward result
//! has no token counts. Analytics reads these rows without ad-hoc parsing,
//! so the shape is fixed here rather than in whatever dict a call site had
//! on hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashes;
use crate::types::{new_trace_id, NodeType};

/// One row in the session log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub session_id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_requested: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub content_json: Value,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_embedding: Option<Vec<f32>>,
    /// Content hashes of every prior message injected into this LLM call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_winner: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_applied: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genus_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_request_json: Option<Value>,
}

impl LogRow {
    /// Start a row for a session with content hashed from `content_json`.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        node_type: NodeType,
        role: impl Into<String>,
        content_json: Value,
    ) -> Self {
        let content_hash = hashes::content_hash(&content_json);
        Self {
            session_id: session_id.into(),
            trace_id: new_trace_id(),
            parent_trace_id: None,
            timestamp: Utc::now(),
            role: role.into(),
            node_type,
            cell_name: None,
            cascade_id: None,
            model_requested: None,
            model_actual: None,
            cost: None,
            tokens_in: None,
            tokens_out: None,
            duration_ms: None,
            content_json,
            content_hash,
            content_embedding: None,
            context_hashes: Vec::new(),
            candidate_index: None,
            is_winner: None,
            mutation_applied: None,
            mutation_type: None,
            species_hash: None,
            genus_hash: None,
            full_request_json: None,
        }
    }

    #[must_use]
    pub fn in_cell(mut self, cell_name: &str, cascade_id: &str) -> Self {
        self.cell_name = Some(cell_name.to_string());
        self.cascade_id = Some(cascade_id.to_string());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_trace_id: &str) -> Self {
        self.parent_trace_id = Some(parent_trace_id.to_string());
        self
    }

    #[must_use]
    pub fn with_species(mut self, species_hash: &str) -> Self {
        self.species_hash = Some(species_hash.to_string());
        self
    }

    #[must_use]
    pub fn with_genus(mut self, genus_hash: &str) -> Self {
        self.genus_hash = Some(genus_hash.to_string());
        self
    }

    #[must_use]
    pub fn with_candidate(mut self, index: u32) -> Self {
        self.candidate_index = Some(index);
        self
    }

    #[must_use]
    pub fn with_context_hashes(mut self, hashes: Vec<String>) -> Self {
        self.context_hashes = hashes;
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
