//! Context selection, token budget, and callout configuration.

use serde::{Deserialize, Serialize};

/// What to pull from a source cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeKind {
    Images,
    Output,
    Messages,
    State,
}

/// Structured source spec for explicit context mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSourceSpec {
    pub cell: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<IncludeKind>,
    /// Substring filter applied to message content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_filter: Option<String>,
    /// Substring filter applied to image identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images_filter: Option<String>,
    /// Override the role the injected messages carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_role: Option<String>,
    /// Template condition; the source is skipped when it renders falsy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A context source: a bare cell name or a structured spec.
///
/// The keywords `"all"`, `"first"`, and `"previous"` expand to sets of prior
/// cells at build time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextSource {
    Cell(String),
    Spec(ContextSourceSpec),
}

/// Typed slices always included in auto mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorSlice {
    Output,
    Callouts,
    Input,
    Errors,
}

fn default_last_turns() -> usize {
    1
}

/// Anchor on a specific cell's recent turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CellAnchor {
    pub cell: String,
    #[serde(default = "default_last_turns")]
    pub last_turns: usize,
}

/// Anchors: always-included context in auto mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnchorsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<CellAnchor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<AnchorSlice>,
}

/// Scoring strategy for non-anchor candidate messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Keyword overlap + recency + callout score.
    #[default]
    Heuristic,
    /// Cosine similarity against the rendered instructions.
    Semantic,
    /// A cheap model picks from short summaries.
    Llm,
    /// Heuristic prefilter, then LLM final selection.
    Hybrid,
}

fn default_similarity_threshold() -> f32 {
    0.35
}

/// Bounded candidate selection beyond anchors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<usize>,
    /// Minimum cosine similarity for semantic selection.
    #[serde(default = "default_similarity_threshold")]
    pub threshold: f32,
    /// Model override for llm/hybrid strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            max_tokens: None,
            max_messages: None,
            threshold: default_similarity_threshold(),
            model: None,
        }
    }
}

fn default_include_input() -> bool {
    true
}

/// A cell's context block.
///
/// Presence of `from` selects explicit mode; otherwise auto mode applies
/// with `anchors` plus `selection`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<ContextSource>>,
    /// Whether the cascade's original input is prepended.
    #[serde(default = "default_include_input")]
    pub include_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchors: Option<AnchorsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionConfig>,
}

/// Strategy when the assembled context exceeds the budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    /// Keep the most recent messages that fit.
    #[default]
    SlidingWindow,
    /// Drop oldest non-system messages until within budget.
    PruneOldest,
    /// Summarize the prunable prefix with a configured model.
    Summarize,
    /// Refuse to call the LLM.
    Fail,
}

/// Cascade-level token budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenBudgetConfig {
    pub max_total: usize,
    #[serde(default)]
    pub strategy: BudgetStrategy,
    /// Headroom reserved for the model's output.
    #[serde(default)]
    pub reserve_for_output: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer_model: Option<String>,
}

/// Callout tagging: a rendered label attached to the cell's final output
/// (and optionally each assistant turn).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalloutConfig {
    /// Label template rendered against the cell scope.
    pub label: String,
    #[serde(default)]
    pub each_turn: bool,
}

fn default_window() -> usize {
    3
}

/// Intra-cell context compression between turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntraContextConfig {
    /// Tool-result messages older than this many turns are masked.
    #[serde(default = "default_window")]
    pub window: usize,
    /// In loop_until cells, only this many prior attempts are retained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_history_limit: Option<usize>,
}

impl Default for IntraContextConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            loop_history_limit: None,
        }
    }
}
