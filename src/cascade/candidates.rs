//! Candidate (multi-sample) configuration.
//!
//! A candidate-enabled cell fans out N variant attempts, optionally mutating
//! the prompt per attempt, prefilters the survivors, and either selects a
//! winner or aggregates everything.

use serde::{Deserialize, Serialize};

use super::wards::ValidatorSpec;
use serde_json::Map;

/// How many variants to produce: a literal count or a template that renders
/// to an integer (`"{{ input.n }}"`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactorSpec {
    Count(u32),
    Template(String),
}

impl Default for FactorSpec {
    fn default() -> Self {
        FactorSpec::Count(1)
    }
}

/// Winner selection vs output combination.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatesMode {
    #[default]
    Evaluate,
    Aggregate,
}

/// How prompt variations are produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    /// An LLM rewrites the instructions preserving intent.
    #[default]
    Rewrite,
    /// A built-in prefix is prepended.
    Augment,
    /// A thinking-strategy phrase is appended.
    Approach,
}

/// Model list or weighted map for multi-model fan-out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelsSpec {
    List(Vec<String>),
    Weighted(std::collections::BTreeMap<String, f64>),
}

/// How the factor is distributed across `models`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStrategy {
    #[default]
    RoundRobin,
    Random,
    Weighted,
}

/// Cost normalization applied before cost-aware evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostNormalization {
    #[default]
    MinMax,
    ZScore,
    LogScale,
}

/// Winner policy on the Pareto frontier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoPolicy {
    PreferCheap,
    PreferQuality,
    /// Maximize the quality/cost ratio.
    #[default]
    Balanced,
    /// Surface the frontier to a human checkpoint.
    Interactive,
}

/// LLM evaluator details.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmEvaluator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Evaluator selection: a keyword (`human` / `hybrid` / `pareto`) or an LLM
/// spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluatorSpec {
    Keyword(String),
    Llm(LlmEvaluator),
}

/// Iterative refinement over the candidate winner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReforgeConfig {
    /// Number of refinement rounds after the first winner.
    pub steps: u32,
    /// Fresh variants per round, seeded from the previous winner.
    #[serde(default = "default_factor_per_step")]
    pub factor_per_step: u32,
    /// Template for the refinement prompt; sees `winner` and the original
    /// instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub honing_prompt: Option<String>,
    /// Early-stop ward: once the winner passes, remaining rounds are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<ValidatorSpec>,
}

fn default_factor_per_step() -> u32 {
    2
}

fn default_max_parallel() -> usize {
    4
}

fn default_llm_prefilter() -> usize {
    3
}

fn default_cost_weight() -> f64 {
    0.3
}

fn default_quality_weight() -> f64 {
    0.7
}

/// Full candidate configuration for a cell (or cascade-level default).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidatesConfig {
    #[serde(default)]
    pub factor: FactorSpec,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub mutate: bool,
    #[serde(default)]
    pub mutation_mode: MutationMode,
    /// Custom mutation texts applied in addition to the generated ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<String>,
    #[serde(default)]
    pub mode: CandidatesMode,
    /// Prefilter: attempts failing it never reach the evaluator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<ValidatorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsSpec>,
    #[serde(default)]
    pub model_strategy: ModelStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<EvaluatorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_model: Option<String>,
    /// Hybrid mode: how many attempts the LLM shortlists for the human.
    #[serde(default = "default_llm_prefilter")]
    pub llm_prefilter: usize,
    #[serde(default)]
    pub cost_aware_evaluation: bool,
    #[serde(default)]
    pub cost_normalization: CostNormalization,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    #[serde(default)]
    pub pareto_policy: ParetoPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reforge: Option<ReforgeConfig>,
}

impl Default for CandidatesConfig {
    fn default() -> Self {
        // Matches the serde defaults above so hand-built configs and parsed
        // configs agree.
        serde_json::from_value(serde_json::Value::Object(Map::new()))
            .expect("empty candidates config is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_uses_defaults() {
        let config: CandidatesConfig = serde_yaml::from_str("factor: 3").unwrap();
        assert_eq!(config.factor, FactorSpec::Count(3));
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.mode, CandidatesMode::Evaluate);
        assert!(!config.mutate);
    }

    #[test]
    fn factor_accepts_templates() {
        let config: CandidatesConfig =
            serde_yaml::from_str("factor: \"{{ input.n }}\"").unwrap();
        assert!(matches!(config.factor, FactorSpec::Template(_)));
    }

    #[test]
    fn weighted_models_parse() {
        let config: CandidatesConfig = serde_yaml::from_str(
            "factor: 4\nmodels: {\"openai/gpt-4o-mini\": 0.7, \"anthropic/claude-sonnet-4\": 0.3}\nmodel_strategy: weighted",
        )
        .unwrap();
        assert!(matches!(config.models, Some(ModelsSpec::Weighted(ref m)) if m.len() == 2));
        assert_eq!(config.model_strategy, ModelStrategy::Weighted);
    }

    #[test]
    fn evaluator_keyword_and_llm_spec_parse() {
        let config: CandidatesConfig =
            serde_yaml::from_str("factor: 2\nevaluator: human").unwrap();
        assert!(matches!(config.evaluator, Some(EvaluatorSpec::Keyword(ref k)) if k == "human"));

        let config: CandidatesConfig =
            serde_yaml::from_str("factor: 2\nevaluator: {model: openai/gpt-4o-mini}").unwrap();
        assert!(matches!(config.evaluator, Some(EvaluatorSpec::Llm(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<CandidatesConfig>("factor: 2\nbogus: 1");
        assert!(err.is_err());
    }
}
