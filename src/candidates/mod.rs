//! Candidate engine: fan-out, prefilter, evaluation, and reforge.
//!
//! A candidate-enabled cell runs N independent attempts of the same work,
//! each against its own echo shadow. Attempts are mutated variants of the
//! base instructions (one is always the pristine baseline), optionally
//! spread across models. A prefilter validator drops bad attempts before
//! the evaluator sees them; the evaluator picks a winner (LLM, Pareto,
//! human, hybrid) or aggregate mode combines everything. Reforge runs
//! refinement rounds seeded from the winner.

mod mutation;

pub use mutation::MutationRecord;

use async_trait::async_trait;
use miette::Diagnostic;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::cascade::{
    CandidatesConfig, CandidatesMode, CostNormalization, EvaluatorSpec, FactorSpec, ModelStrategy,
    ModelsSpec, ParetoPolicy,
};
use crate::log::{LogRow, LogStore, LogStoreError};
use crate::message::Message;
use crate::provider::{ChatClient, ChatRequest};
use crate::template::{render_value, RenderScope};
use crate::types::NodeType;
use crate::validators::{ValidatorDispatcher, ValidatorError};

/// Errors from candidate execution.
#[derive(Debug, Error, Diagnostic)]
pub enum CandidateError {
    #[error("all_candidates_filtered: every attempt failed the prefilter")]
    #[diagnostic(
        code(rvbbit::candidates::all_filtered),
        help("Loosen the prefilter validator or raise the factor.")
    )]
    AllFiltered,

    #[error("candidate factor is invalid: {0}")]
    #[diagnostic(code(rvbbit::candidates::factor))]
    Factor(String),

    #[error("evaluator failed: {0}")]
    #[diagnostic(code(rvbbit::candidates::evaluator))]
    Evaluator(String),

    #[error(transparent)]
    #[diagnostic(code(rvbbit::candidates::validator))]
    Validator(#[from] ValidatorError),

    #[error(transparent)]
    #[diagnostic(code(rvbbit::candidates::log))]
    Log(#[from] LogStoreError),
}

/// One attempt handed to the attempt runner.
#[derive(Clone, Debug)]
pub struct AttemptSpec {
    pub index: u32,
    pub instructions: String,
    pub model: Option<String>,
    pub mutation: Option<MutationRecord>,
}

/// What the attempt runner produced.
#[derive(Clone, Debug, Default)]
pub struct AttemptResult {
    pub content: String,
    pub output: Value,
    pub model: Option<String>,
    pub cost: Option<f64>,
    pub tokens_out: Option<u64>,
    pub duration_ms: u64,
}

/// Executes one candidate attempt end to end (the LLM cell's turn loop,
/// against a shadow echo).
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run_attempt(&self, spec: AttemptSpec) -> Result<AttemptResult, String>;
}

/// A completed attempt with engine bookkeeping.
#[derive(Clone, Debug)]
pub struct CandidateAttempt {
    pub index: u32,
    pub content: String,
    pub output: Value,
    pub model: Option<String>,
    pub mutation: Option<MutationRecord>,
    pub cost: Option<f64>,
    pub duration_ms: u64,
    pub filtered: bool,
    pub filter_reason: Option<String>,
    /// Quality score assigned during evaluation, when one exists.
    pub quality: Option<f64>,
}

impl CandidateAttempt {
    fn presentation(&self) -> Value {
        json!({
            "index": self.index,
            "content": self.content,
            "output": self.output,
            "model": self.model,
            "mutation_applied": self.mutation.as_ref().map(|m| m.applied.clone()),
            "cost": self.cost,
            "quality": self.quality,
        })
    }
}

/// Result of a candidate batch.
#[derive(Clone, Debug)]
pub struct CandidateOutcome {
    pub attempts: Vec<CandidateAttempt>,
    pub winner_index: Option<u32>,
    pub content: String,
    pub output: Value,
    /// Present when a human must pick: the checkpoint presentation payload.
    pub suspension: Option<Value>,
}

/// Everything a batch needs from the surrounding cell.
pub struct CandidateRun<'a> {
    pub config: &'a CandidatesConfig,
    pub base_instructions: String,
    pub session_id: String,
    pub cell_name: String,
    pub cascade_id: String,
    pub species_hash: String,
    pub original_input: Value,
    pub scope: RenderScope,
    pub default_model: String,
}

/// The engine. One instance per process; batches carry their own state.
pub struct CandidateEngine {
    chat: Arc<dyn ChatClient>,
    dispatcher: ValidatorDispatcher,
    log: Arc<dyn LogStore>,
    utility_model: String,
}

impl CandidateEngine {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatClient>,
        dispatcher: ValidatorDispatcher,
        log: Arc<dyn LogStore>,
        utility_model: &str,
    ) -> Self {
        Self {
            chat,
            dispatcher,
            log,
            utility_model: utility_model.to_string(),
        }
    }

    /// Run a candidate batch for a cell.
    pub async fn run(
        &self,
        run: CandidateRun<'_>,
        runner: Arc<dyn AttemptRunner>,
    ) -> Result<CandidateOutcome, CandidateError> {
        let factor = resolve_factor(&run.config.factor, &run.scope)?;

        // factor=1 without mutation collapses to a single attempt and no
        // evaluator.
        if factor == 1 && !run.config.mutate && run.config.mutations.is_empty() {
            let spec = AttemptSpec {
                index: 0,
                instructions: run.base_instructions.clone(),
                model: pick_model(run.config, 0, &run.default_model),
                mutation: None,
            };
            let result = runner
                .run_attempt(spec.clone())
                .await
                .map_err(CandidateError::Evaluator)?;
            let attempt = self.record_attempt(&run, &spec, Ok(result)).await?;
            let content = attempt.content.clone();
            let output = attempt.output.clone();
            self.log
                .mark_winner(&run.session_id, &run.cell_name, 0)
                .await?;
            return Ok(CandidateOutcome {
                attempts: vec![attempt],
                winner_index: Some(0),
                content,
                output,
                suspension: None,
            });
        }

        // Mutations for everything past the pristine baseline.
        let mutations = if run.config.mutate || !run.config.mutations.is_empty() {
            mutation::generate_mutations(
                run.config.mutation_mode,
                &run.config.mutations,
                &run.base_instructions,
                (factor as usize).saturating_sub(1),
                &self.chat,
                &self.utility_model,
            )
            .await
        } else {
            Vec::new()
        };

        let specs: Vec<AttemptSpec> = (0..factor)
            .map(|index| {
                let mutation = if index == 0 {
                    None
                } else {
                    mutations.get(index as usize - 1).cloned()
                };
                AttemptSpec {
                    index,
                    instructions: mutation
                        .as_ref()
                        .map(|m| m.instructions.clone())
                        .unwrap_or_else(|| run.base_instructions.clone()),
                    model: pick_model(run.config, index, &run.default_model),
                    mutation,
                }
            })
            .collect();

        let attempts = self.fan_out(&run, specs, Arc::clone(&runner)).await?;
        self.finish_batch(&run, attempts, runner).await
    }

    /// Evaluate a batch whose attempts are already known, applying
    /// prefilter, evaluation, and reforge.
    async fn finish_batch(
        &self,
        run: &CandidateRun<'_>,
        mut attempts: Vec<CandidateAttempt>,
        runner: Arc<dyn AttemptRunner>,
    ) -> Result<CandidateOutcome, CandidateError> {
        // Prefilter.
        if let Some(validator) = &run.config.validator {
            for attempt in &mut attempts {
                if attempt.filtered {
                    continue;
                }
                let outcome = self
                    .dispatcher
                    .run(
                        validator,
                        &Value::String(attempt.content.clone()),
                        &run.original_input,
                        &run.scope,
                    )
                    .await?;
                if !outcome.valid {
                    attempt.filtered = true;
                    attempt.filter_reason = Some(outcome.reason);
                }
            }
        }

        let survivors: Vec<u32> = attempts
            .iter()
            .filter(|a| !a.filtered)
            .map(|a| a.index)
            .collect();
        if survivors.is_empty() {
            return Err(CandidateError::AllFiltered);
        }

        if run.config.mode == CandidatesMode::Aggregate {
            let (content, output) = self.aggregate(run, &attempts).await?;
            return Ok(CandidateOutcome {
                attempts,
                winner_index: None,
                content,
                output,
                suspension: None,
            });
        }

        // Winner selection.
        let evaluation = self.evaluate(run, &mut attempts).await?;
        let winner = match evaluation {
            Evaluation::Winner(index) => index,
            Evaluation::NeedsHuman(payload) => {
                return Ok(CandidateOutcome {
                    attempts,
                    winner_index: None,
                    content: String::new(),
                    output: Value::Null,
                    suspension: Some(payload),
                });
            }
        };

        let winner = self
            .reforge(run, &mut attempts, winner, runner)
            .await?;

        self.log
            .mark_winner(&run.session_id, &run.cell_name, winner)
            .await?;

        let winning = attempts
            .iter()
            .find(|a| a.index == winner)
            .ok_or_else(|| CandidateError::Evaluator(format!("winner index {winner} unknown")))?;
        Ok(CandidateOutcome {
            content: winning.content.clone(),
            output: winning.output.clone(),
            attempts,
            winner_index: Some(winner),
            suspension: None,
        })
    }

    async fn fan_out(
        &self,
        run: &CandidateRun<'_>,
        specs: Vec<AttemptSpec>,
        runner: Arc<dyn AttemptRunner>,
    ) -> Result<Vec<CandidateAttempt>, CandidateError> {
        let semaphore = Arc::new(Semaphore::new(run.config.max_parallel.max(1)));
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let permit_source = Arc::clone(&semaphore);
            let runner = Arc::clone(&runner);
            handles.push((
                spec.clone(),
                tokio::spawn(async move {
                    let _permit = permit_source.acquire_owned().await;
                    runner.run_attempt(spec).await
                }),
            ));
        }

        let mut attempts = Vec::with_capacity(handles.len());
        for (spec, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(join_err.to_string()),
            };
            attempts.push(self.record_attempt(run, &spec, result).await?);
        }
        Ok(attempts)
    }

    /// Log a completed (or errored) attempt and fold it into the batch.
    /// Errored attempts become filtered rather than failing the cell.
    async fn record_attempt(
        &self,
        run: &CandidateRun<'_>,
        spec: &AttemptSpec,
        result: Result<AttemptResult, String>,
    ) -> Result<CandidateAttempt, CandidateError> {
        let attempt = match result {
            Ok(result) => CandidateAttempt {
                index: spec.index,
                content: result.content,
                output: result.output,
                model: result.model.or_else(|| spec.model.clone()),
                mutation: spec.mutation.clone(),
                cost: result.cost,
                duration_ms: result.duration_ms,
                filtered: false,
                filter_reason: None,
                quality: None,
            },
            Err(error) => {
                tracing::warn!(
                    target: "rvbbit::candidates",
                    index = spec.index,
                    error = %error,
                    "candidate attempt failed"
                );
                CandidateAttempt {
                    index: spec.index,
                    content: String::new(),
                    output: Value::Null,
                    model: spec.model.clone(),
                    mutation: spec.mutation.clone(),
                    cost: None,
                    duration_ms: 0,
                    filtered: true,
                    filter_reason: Some(error),
                    quality: None,
                }
            }
        };

        let mut row = LogRow::new(
            &run.session_id,
            NodeType::SoundingAttempt,
            "assistant",
            Value::String(attempt.content.clone()),
        )
        .in_cell(&run.cell_name, &run.cascade_id)
        .with_species(&run.species_hash)
        .with_candidate(attempt.index)
        .with_duration(attempt.duration_ms);
        row.model_requested = attempt.model.clone();
        row.cost = attempt.cost;
        if let Some(mutation) = &attempt.mutation {
            row.mutation_applied = Some(mutation.applied.clone());
            row.mutation_type = Some(mutation.mutation_type.clone());
        }
        self.log.append(row).await?;
        Ok(attempt)
    }

    async fn aggregate(
        &self,
        run: &CandidateRun<'_>,
        attempts: &[CandidateAttempt],
    ) -> Result<(String, Value), CandidateError> {
        let surviving: Vec<&CandidateAttempt> =
            attempts.iter().filter(|a| !a.filtered).collect();
        let content = if let Some(instructions) = &run.config.aggregator_instructions {
            let listing: Vec<String> = surviving
                .iter()
                .map(|a| format!("--- attempt {} ---\n{}", a.index, a.content))
                .collect();
            let model = run
                .config
                .aggregator_model
                .as_deref()
                .unwrap_or(&self.utility_model);
            let prompt = format!("{instructions}\n\n{}", listing.join("\n\n"));
            self.chat
                .complete(ChatRequest::new(model, vec![Message::user(prompt)]))
                .await
                .map_err(|e| CandidateError::Evaluator(e.to_string()))?
                .content
        } else {
            surviving
                .iter()
                .map(|a| a.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n")
        };
        let output = json!({
            "aggregated": content,
            "attempt_count": surviving.len(),
        });
        Ok((content, output))
    }

    async fn evaluate(
        &self,
        run: &CandidateRun<'_>,
        attempts: &mut [CandidateAttempt],
    ) -> Result<Evaluation, CandidateError> {
        let survivors: Vec<u32> = attempts
            .iter()
            .filter(|a| !a.filtered)
            .map(|a| a.index)
            .collect();
        if survivors.len() == 1 {
            return Ok(Evaluation::Winner(survivors[0]));
        }

        match &run.config.evaluator {
            Some(EvaluatorSpec::Keyword(keyword)) => match keyword.as_str() {
                "human" => Ok(Evaluation::NeedsHuman(human_payload(
                    attempts, None, "human",
                ))),
                "hybrid" => {
                    // The model shortlists; the human decides.
                    let scored = self.score_attempts(run, attempts).await?;
                    apply_scores(attempts, &scored);
                    let mut ranked = scored;
                    ranked.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    let shortlist: Vec<u32> = ranked
                        .iter()
                        .take(run.config.llm_prefilter.max(1))
                        .map(|(index, _)| *index)
                        .collect();
                    Ok(Evaluation::NeedsHuman(human_payload(
                        attempts,
                        Some(&shortlist),
                        "hybrid",
                    )))
                }
                "pareto" => {
                    let scored = self.score_attempts(run, attempts).await?;
                    apply_scores(attempts, &scored);
                    if run.config.pareto_policy == ParetoPolicy::Interactive {
                        let frontier = pareto_frontier(attempts);
                        return Ok(Evaluation::NeedsHuman(human_payload(
                            attempts,
                            Some(&frontier),
                            "pareto",
                        )));
                    }
                    Ok(Evaluation::Winner(pareto_winner(
                        attempts,
                        run.config.pareto_policy,
                    )?))
                }
                other => Err(CandidateError::Evaluator(format!(
                    "unknown evaluator keyword '{other}'"
                ))),
            },
            Some(EvaluatorSpec::Llm(spec)) => {
                let model = spec
                    .model
                    .clone()
                    .or_else(|| run.config.evaluator_model.clone())
                    .unwrap_or_else(|| self.utility_model.clone());
                let instructions = spec
                    .instructions
                    .clone()
                    .or_else(|| run.config.evaluator_instructions.clone());
                self.llm_evaluate(run, attempts, &model, instructions.as_deref())
                    .await
            }
            None => {
                let model = run
                    .config
                    .evaluator_model
                    .clone()
                    .unwrap_or_else(|| self.utility_model.clone());
                self.llm_evaluate(
                    run,
                    attempts,
                    &model,
                    run.config.evaluator_instructions.as_deref(),
                )
                .await
            }
        }
    }

    async fn llm_evaluate(
        &self,
        run: &CandidateRun<'_>,
        attempts: &mut [CandidateAttempt],
        model: &str,
        instructions: Option<&str>,
    ) -> Result<Evaluation, CandidateError> {
        let survivors: Vec<&CandidateAttempt> =
            attempts.iter().filter(|a| !a.filtered).collect();
        let survivor_indices: Vec<u32> = survivors.iter().map(|a| a.index).collect();
        let cost_note = if run.config.cost_aware_evaluation {
            let normalized = normalize_costs(&survivors, run.config.cost_normalization);
            let lines: Vec<String> = survivors
                .iter()
                .zip(&normalized)
                .map(|(a, c)| format!("attempt {}: normalized cost {c:.3}", a.index))
                .collect();
            format!("\n\nRelative costs (lower is cheaper):\n{}", lines.join("\n"))
        } else {
            String::new()
        };

        let listing: Vec<String> = survivors
            .iter()
            .map(|a| format!("=== attempt {} ===\n{}", a.index, a.content))
            .collect();
        let guidance = instructions.unwrap_or("Pick the best attempt for the task.");
        let prompt = format!(
            "{guidance}\n\n{}{cost_note}\n\n\
             Reply with ONLY JSON: {{\"winner\": <attempt index>, \
             \"scores\": [{{\"index\": <i>, \"score\": <0-10>}}]}}",
            listing.join("\n\n")
        );

        let response = self
            .chat
            .complete(ChatRequest::new(model, vec![Message::user(prompt)]))
            .await
            .map_err(|e| CandidateError::Evaluator(e.to_string()))?;

        let parsed: Value = serde_json::from_str(response.content.trim())
            .map_err(|e| CandidateError::Evaluator(format!("evaluator reply not JSON: {e}")))?;
        let scored: Vec<(u32, f64)> = parsed
            .get("scores")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some((
                            item.get("index")?.as_u64()? as u32,
                            item.get("score")?.as_f64()?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        apply_scores(attempts, &scored);

        if run.config.cost_aware_evaluation && !scored.is_empty() {
            // Combine quality with normalized cost in code so the weighting
            // is reproducible.
            let survivors: Vec<&CandidateAttempt> =
                attempts.iter().filter(|a| !a.filtered).collect();
            let costs = normalize_costs(&survivors, run.config.cost_normalization);
            let mut best: Option<(u32, f64)> = None;
            for (attempt, cost) in survivors.iter().zip(&costs) {
                let quality = attempt.quality.unwrap_or(0.0) / 10.0;
                let combined =
                    run.config.quality_weight * quality - run.config.cost_weight * cost;
                if best.map(|(_, b)| combined > b).unwrap_or(true) {
                    best = Some((attempt.index, combined));
                }
            }
            return Ok(Evaluation::Winner(best.map(|(index, _)| index).ok_or_else(
                || CandidateError::Evaluator("no survivors to combine".to_string()),
            )?));
        }

        let winner = parsed
            .get("winner")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .ok_or_else(|| CandidateError::Evaluator("evaluator reply missing winner".into()))?;
        if !survivor_indices.contains(&winner) {
            return Err(CandidateError::Evaluator(format!(
                "evaluator chose {winner}, not a surviving attempt"
            )));
        }
        Ok(Evaluation::Winner(winner))
    }

    /// Quality scores for every surviving attempt, via the utility model.
    async fn score_attempts(
        &self,
        run: &CandidateRun<'_>,
        attempts: &[CandidateAttempt],
    ) -> Result<Vec<(u32, f64)>, CandidateError> {
        let survivors: Vec<&CandidateAttempt> =
            attempts.iter().filter(|a| !a.filtered).collect();
        let listing: Vec<String> = survivors
            .iter()
            .map(|a| format!("=== attempt {} ===\n{}", a.index, a.content))
            .collect();
        let guidance = run
            .config
            .evaluator_instructions
            .as_deref()
            .unwrap_or("Score each attempt for quality.");
        let model = run
            .config
            .evaluator_model
            .clone()
            .unwrap_or_else(|| self.utility_model.clone());
        let prompt = format!(
            "{guidance}\n\n{}\n\nReply with ONLY JSON: \
             [{{\"index\": <i>, \"score\": <0-10>}}] covering every attempt.",
            listing.join("\n\n")
        );
        let response = self
            .chat
            .complete(ChatRequest::new(&model, vec![Message::user(prompt)]))
            .await
            .map_err(|e| CandidateError::Evaluator(e.to_string()))?;
        let scored: Vec<(u32, f64)> = serde_json::from_str::<Vec<Value>>(response.content.trim())
            .map_err(|e| CandidateError::Evaluator(format!("score reply not JSON: {e}")))?
            .into_iter()
            .filter_map(|item| {
                Some((
                    item.get("index")?.as_u64()? as u32,
                    item.get("score")?.as_f64()?,
                ))
            })
            .collect();
        Ok(scored)
    }

    /// Refinement rounds over the winner.
    async fn reforge(
        &self,
        run: &CandidateRun<'_>,
        attempts: &mut Vec<CandidateAttempt>,
        mut winner: u32,
        runner: Arc<dyn AttemptRunner>,
    ) -> Result<u32, CandidateError> {
        let Some(reforge) = &run.config.reforge else {
            return Ok(winner);
        };

        for step in 0..reforge.steps {
            let winning = attempts
                .iter()
                .find(|a| a.index == winner)
                .cloned()
                .ok_or_else(|| CandidateError::Evaluator("reforge lost its winner".into()))?;

            // Early stop once the quality bar is cleared.
            if let Some(threshold) = &reforge.threshold {
                let verdict = self
                    .dispatcher
                    .run(
                        threshold,
                        &Value::String(winning.content.clone()),
                        &run.original_input,
                        &run.scope,
                    )
                    .await?;
                if verdict.valid {
                    tracing::debug!(
                        target: "rvbbit::candidates",
                        step,
                        "reforge threshold cleared; stopping early"
                    );
                    break;
                }
            }

            let honing = reforge
                .honing_prompt
                .clone()
                .unwrap_or_else(|| {
                    "Improve on the previous best answer. Keep what works, fix what does not.\n\nPrevious best:\n{{ winner }}".to_string()
                });
            let scope = run.scope.clone().with("winner", json!(winning.content));
            let instructions = crate::template::render_text(&honing, &scope)
                .unwrap_or_else(|_| format!("Improve:\n{}", winning.content));

            let base_index = attempts.iter().map(|a| a.index).max().unwrap_or(0) + 1;
            let specs: Vec<AttemptSpec> = (0..reforge.factor_per_step.max(1))
                .map(|offset| AttemptSpec {
                    index: base_index + offset,
                    instructions: instructions.clone(),
                    model: pick_model(run.config, base_index + offset, &run.default_model),
                    mutation: Some(MutationRecord {
                        applied: format!("reforge step {}", step + 1),
                        mutation_type: "reforge".to_string(),
                        instructions: instructions.clone(),
                    }),
                })
                .collect();
            let fresh = self.fan_out(run, specs, Arc::clone(&runner)).await?;
            attempts.extend(fresh);

            // Winner defends its title against the fresh round.
            let candidates: Vec<u32> = attempts
                .iter()
                .filter(|a| !a.filtered && (a.index >= base_index || a.index == winner))
                .map(|a| a.index)
                .collect();
            if candidates.len() > 1 {
                let round: Vec<CandidateAttempt> = attempts
                    .iter()
                    .filter(|a| candidates.contains(&a.index))
                    .cloned()
                    .collect();
                let mut round = round;
                let model = run
                    .config
                    .evaluator_model
                    .clone()
                    .unwrap_or_else(|| self.utility_model.clone());
                match self
                    .llm_evaluate(
                        run,
                        &mut round,
                        &model,
                        run.config.evaluator_instructions.as_deref(),
                    )
                    .await
                {
                    Ok(Evaluation::Winner(new_winner)) => winner = new_winner,
                    Ok(Evaluation::NeedsHuman(_)) | Err(_) => {
                        tracing::warn!(
                            target: "rvbbit::candidates",
                            step,
                            "reforge evaluation failed; keeping current winner"
                        );
                    }
                }
                for scored in round {
                    if let Some(existing) =
                        attempts.iter_mut().find(|a| a.index == scored.index)
                    {
                        existing.quality = scored.quality;
                    }
                }
            }
        }
        Ok(winner)
    }
}

enum Evaluation {
    Winner(u32),
    NeedsHuman(Value),
}

fn resolve_factor(factor: &FactorSpec, scope: &RenderScope) -> Result<u32, CandidateError> {
    match factor {
        FactorSpec::Count(n) => Ok((*n).max(1)),
        FactorSpec::Template(template) => {
            let value = render_value(template, scope)
                .map_err(|e| CandidateError::Factor(e.to_string()))?;
            let n = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| {
                    CandidateError::Factor(format!("template rendered non-integer: {value}"))
                })?;
            Ok((n as u32).max(1))
        }
    }
}

fn pick_model(config: &CandidatesConfig, index: u32, default_model: &str) -> Option<String> {
    let models = config.models.as_ref()?;
    let chosen = match models {
        ModelsSpec::List(list) => {
            if list.is_empty() {
                return Some(default_model.to_string());
            }
            match config.model_strategy {
                ModelStrategy::RoundRobin | ModelStrategy::Weighted => {
                    list[(index as usize) % list.len()].clone()
                }
                ModelStrategy::Random => {
                    let mut rng = rand::rng();
                    list[rng.random_range(0..list.len())].clone()
                }
            }
        }
        ModelsSpec::Weighted(weights) => {
            if weights.is_empty() {
                return Some(default_model.to_string());
            }
            match config.model_strategy {
                ModelStrategy::RoundRobin => {
                    let names: Vec<&String> = weights.keys().collect();
                    names[(index as usize) % names.len()].clone()
                }
                ModelStrategy::Random | ModelStrategy::Weighted => {
                    let total: f64 = weights.values().sum();
                    let mut rng = rand::rng();
                    let mut roll = rng.random_range(0.0..total.max(f64::EPSILON));
                    let mut chosen = None;
                    for (name, weight) in weights {
                        if roll < *weight {
                            chosen = Some(name.clone());
                            break;
                        }
                        roll -= weight;
                    }
                    chosen.unwrap_or_else(|| {
                        weights.keys().next().cloned().unwrap_or_default()
                    })
                }
            }
        }
    };
    Some(chosen)
}

fn apply_scores(attempts: &mut [CandidateAttempt], scored: &[(u32, f64)]) {
    for (index, score) in scored {
        if let Some(attempt) = attempts.iter_mut().find(|a| a.index == *index) {
            attempt.quality = Some(*score);
        }
    }
}

fn normalize_costs(attempts: &[&CandidateAttempt], mode: CostNormalization) -> Vec<f64> {
    let costs: Vec<f64> = attempts
        .iter()
        .map(|a| a.cost.unwrap_or(0.0))
        .collect();
    match mode {
        CostNormalization::MinMax => min_max(&costs),
        CostNormalization::ZScore => {
            let n = costs.len().max(1) as f64;
            let mean = costs.iter().sum::<f64>() / n;
            let variance = costs.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            if std == 0.0 {
                vec![0.0; costs.len()]
            } else {
                costs.iter().map(|c| (c - mean) / std).collect()
            }
        }
        CostNormalization::LogScale => {
            let logged: Vec<f64> = costs.iter().map(|c| (1.0 + c.max(0.0)).ln()).collect();
            min_max(&logged)
        }
    }
}

fn min_max(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < f64::EPSILON {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

/// Indices of attempts on the (cost, quality) Pareto frontier.
fn pareto_frontier(attempts: &[CandidateAttempt]) -> Vec<u32> {
    let survivors: Vec<&CandidateAttempt> = attempts.iter().filter(|a| !a.filtered).collect();
    survivors
        .iter()
        .filter(|candidate| {
            !survivors.iter().any(|other| {
                let cheaper = other.cost.unwrap_or(0.0) <= candidate.cost.unwrap_or(0.0);
                let better = other.quality.unwrap_or(0.0) >= candidate.quality.unwrap_or(0.0);
                let strictly = other.cost.unwrap_or(0.0) < candidate.cost.unwrap_or(0.0)
                    || other.quality.unwrap_or(0.0) > candidate.quality.unwrap_or(0.0);
                other.index != candidate.index && cheaper && better && strictly
            })
        })
        .map(|a| a.index)
        .collect()
}

fn pareto_winner(
    attempts: &[CandidateAttempt],
    policy: ParetoPolicy,
) -> Result<u32, CandidateError> {
    let frontier = pareto_frontier(attempts);
    let on_frontier: Vec<&CandidateAttempt> = attempts
        .iter()
        .filter(|a| frontier.contains(&a.index))
        .collect();
    let chosen = match policy {
        ParetoPolicy::PreferCheap => on_frontier.iter().min_by(|a, b| {
            a.cost
                .unwrap_or(0.0)
                .partial_cmp(&b.cost.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        ParetoPolicy::PreferQuality => on_frontier.iter().max_by(|a, b| {
            a.quality
                .unwrap_or(0.0)
                .partial_cmp(&b.quality.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        ParetoPolicy::Balanced | ParetoPolicy::Interactive => on_frontier.iter().max_by(|a, b| {
            let ratio_a = a.quality.unwrap_or(0.0) / a.cost.unwrap_or(0.0).max(1e-9);
            let ratio_b = b.quality.unwrap_or(0.0) / b.cost.unwrap_or(0.0).max(1e-9);
            ratio_a
                .partial_cmp(&ratio_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    };
    chosen
        .map(|a| a.index)
        .ok_or_else(|| CandidateError::Evaluator("empty Pareto frontier".to_string()))
}

fn human_payload(
    attempts: &[CandidateAttempt],
    shortlist: Option<&[u32]>,
    evaluator: &str,
) -> Value {
    let presented: Vec<Value> = attempts
        .iter()
        .filter(|a| !a.filtered)
        .filter(|a| shortlist.map(|s| s.contains(&a.index)).unwrap_or(true))
        .map(CandidateAttempt::presentation)
        .collect();
    json!({
        "kind": "candidate_selection",
        "evaluator": evaluator,
        "question": "Select the winning attempt",
        "attempts": presented,
        // Everything needed to finish the cell lives in the payload, so
        // resumption is a pure function of (checkpoint, response).
        "all_attempts": attempts.iter().map(CandidateAttempt::presentation).collect::<Vec<_>>(),
    })
}
