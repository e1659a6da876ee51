//! The echo: in-memory session record.
//!
//! An echo accumulates everything a running cascade knows about itself:
//! conversation history, per-cell lineage, template-addressable state, the
//! last output of each cell, and any pending human checkpoints. It is
//! serializable so suspensions can persist it and a later process can resume.
//!
//! Echoes are single-writer within a cell; candidate attempts work against
//! shadow copies and merge only when a winner is selected.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::Message;

/// One completed cell, in execution order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub cell: String,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Why a session is suspended and what it is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// A human-in-the-loop ward or explicit approval gate.
    Human,
    /// A `<decision>` block emitted by an LLM cell.
    Decision,
    /// A human (or hybrid) candidate evaluator awaiting a pick.
    Evaluator,
    /// A screen cell presenting rendered UI.
    Screen,
    /// An explicit audible pause declared on the cell.
    Audible,
}

/// A pending human-input record attached to the echo.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub cell_name: String,
    pub kind: CheckpointKind,
    /// Presentation payload: the question, candidate set, rendered screen.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    #[must_use]
    pub fn new(cell_name: &str, kind: CheckpointKind, payload: Value) -> Self {
        Self {
            checkpoint_id: format!("ckpt_{}", uuid::Uuid::new_v4().simple()),
            cell_name: cell_name.to_string(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// In-memory session record, mirrored to the log.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Echo {
    pub session_id: String,
    /// Ordered conversation trace.
    pub history: Vec<Message>,
    /// One entry per terminated cell (suspended cells do not append until
    /// resumed and finished).
    pub lineage: Vec<LineageEntry>,
    /// Cell-addressed scratch state, read and written by templates.
    pub state: Map<String, Value>,
    /// Last dict output per cell, for `{{ outputs.<cell>... }}` injection.
    pub outputs: Map<String, Value>,
    /// Pending human-input records.
    pub checkpoints: Vec<CheckpointRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Sub-cascade nesting depth; zero for top-level sessions.
    #[serde(default)]
    pub depth: u32,
}

impl Echo {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Child echo for a sub-cascade session.
    #[must_use]
    pub fn child(&self, session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            parent_session_id: Some(self.session_id.clone()),
            depth: self.depth + 1,
            ..Self::default()
        }
    }

    pub fn push_history(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Record a terminated cell: append lineage and expose the output to
    /// templates when it is a dict.
    pub fn record_cell(&mut self, entry: LineageEntry) {
        if entry.output.is_object() {
            self.outputs.insert(entry.cell.clone(), entry.output.clone());
        }
        self.lineage.push(entry);
    }

    pub fn set_state(&mut self, key: &str, value: Value) {
        self.state.insert(key.to_string(), value);
    }

    pub fn add_checkpoint(&mut self, record: CheckpointRecord) {
        self.checkpoints.push(record);
    }

    /// Remove and return a pending checkpoint by id.
    pub fn take_checkpoint(&mut self, checkpoint_id: &str) -> Option<CheckpointRecord> {
        let index = self
            .checkpoints
            .iter()
            .position(|c| c.checkpoint_id == checkpoint_id)?;
        Some(self.checkpoints.remove(index))
    }

    /// Names of cells with lineage entries, in order.
    #[must_use]
    pub fn completed_cells(&self) -> Vec<&str> {
        self.lineage.iter().map(|entry| entry.cell.as_str()).collect()
    }

    /// The lineage as a JSON value for template scopes.
    #[must_use]
    pub fn lineage_value(&self) -> Value {
        serde_json::to_value(&self.lineage).unwrap_or(Value::Array(Vec::new()))
    }

    /// The history as a JSON value for template scopes.
    #[must_use]
    pub fn history_value(&self) -> Value {
        serde_json::to_value(&self.history).unwrap_or(Value::Array(Vec::new()))
    }

    /// Total cost recorded across lineage entries.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.lineage.iter().filter_map(|entry| entry.cost).sum()
    }
}

/// Shadow view used by candidate attempts.
///
/// Each attempt clones the echo, runs independently, and only the winner's
/// shadow is merged back.
#[must_use]
pub fn shadow(echo: &Echo) -> Echo {
    echo.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_cell_exposes_dict_outputs() {
        let mut echo = Echo::new("s1");
        echo.record_cell(LineageEntry {
            cell: "load".into(),
            output: json!({"data": [1, 2, 3]}),
            model: None,
            cost: None,
            duration_ms: Some(12),
        });
        echo.record_cell(LineageEntry {
            cell: "note".into(),
            output: json!("routed to: end"),
            model: None,
            cost: None,
            duration_ms: None,
        });
        assert_eq!(echo.outputs.get("load").unwrap()["data"], json!([1, 2, 3]));
        // String outputs never land in the template-visible outputs map.
        assert!(echo.outputs.get("note").is_none());
        assert_eq!(echo.lineage.len(), 2);
    }

    #[test]
    fn child_links_parent_and_increments_depth() {
        let parent = Echo::new("parent");
        let child = parent.child("child");
        assert_eq!(child.parent_session_id.as_deref(), Some("parent"));
        assert_eq!(child.depth, 1);
        assert!(child.history.is_empty());
    }

    #[test]
    fn echo_round_trips_through_serde() {
        let mut echo = Echo::new("s1");
        echo.set_state("phase", json!("ready"));
        echo.push_history(Message::user("hello"));
        echo.add_checkpoint(CheckpointRecord::new(
            "review",
            CheckpointKind::Human,
            json!({"question": "approve?"}),
        ));
        let encoded = serde_json::to_string(&echo).unwrap();
        let decoded: Echo = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.session_id, "s1");
        assert_eq!(decoded.checkpoints.len(), 1);
        assert_eq!(decoded.state.get("phase"), Some(&json!("ready")));
    }
}
