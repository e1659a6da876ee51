//! The cascade runner: top-level graph execution.
//!
//! `run` validates inputs, initializes the echo, and walks cells until no
//! routing target remains. Each cell gets its own ephemeral RAG scope,
//! pre/post wards, lifecycle hooks, and bus events. Suspensions serialize
//! the echo and a resume mode; `resume` re-enters the dispatch loop as a
//! pure function of the stored checkpoint plus the human response.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::analytics::SessionRecord;
use crate::candidates::{
    AttemptResult, AttemptRunner, AttemptSpec, CandidateEngine, CandidateError, CandidateOutcome,
    CandidateRun,
};
use crate::cascade::{
    AsyncTrigger, Cascade, CandidatesConfig, Cell, CellVariant, DeterministicCell, LlmCell,
    OnErrorSpec, ScreenCell, SubCascadeSpec,
};
use crate::echo::{CheckpointKind, CheckpointRecord, Echo, LineageEntry};
use crate::event_bus::{
    Event, EVENT_CASCADE_COMPLETE, EVENT_CASCADE_ERROR, EVENT_CASCADE_START,
    EVENT_CELL_COMPLETE, EVENT_CELL_START, EVENT_CHECKPOINT_RESUMED, EVENT_CHECKPOINT_SUSPENDED,
};
use crate::hashes;
use crate::log::LogRow;
use crate::message::Message;
use crate::rag::{EphemeralConfig, EphemeralRag};
use crate::template::{render_inputs, render_text, render_value, RenderScope};
use crate::types::{new_session_id, new_trace_id, NodeType};
use crate::validators::{apply_wards, ValidatorDispatcher, WardVerdict};

use super::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use super::deterministic::{determine_routing, execute_deterministic};
use super::hooks::{CascadeHooks, NoHooks};
use super::llm_cell::{parse_output, run_turn_loop, TurnLoopParams, TurnLoopResult};
use super::outcome::{
    CascadeFailure, FailureKind, ResumeMode, RunOutcome, RunnerError, SuspendedSession,
};
use super::services::Services;

/// Executes cascades against a service bundle.
pub struct CascadeRunner {
    services: Arc<Services>,
    hooks: Arc<dyn CascadeHooks>,
    checkpoints: Arc<dyn CheckpointStore>,
    cascade_dir: Option<PathBuf>,
    caller_id: Option<String>,
}

/// What a resumed session carries back into the dispatch loop.
#[derive(Clone, Debug)]
struct ResumeDirective {
    checkpoint: CheckpointRecord,
    mode: ResumeMode,
    response: Value,
}

/// How one cell's execution ended.
enum CellStep {
    Complete {
        output: Value,
        content: Option<String>,
        model: Option<String>,
        duration_ms: u64,
        messages: Vec<Message>,
    },
    Suspend {
        kind: CheckpointKind,
        payload: Value,
        resume_mode: ResumeMode,
    },
    Fail(CascadeFailure),
}

impl CascadeRunner {
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            hooks: Arc::new(NoHooks),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            cascade_dir: None,
            caller_id: None,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn CascadeHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    #[must_use]
    pub fn with_cascade_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cascade_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller_id: &str) -> Self {
        self.caller_id = Some(caller_id.to_string());
        self
    }

    /// Run a cascade from the top with a fresh session.
    pub async fn run(
        &self,
        cascade: Arc<Cascade>,
        input: Value,
    ) -> Result<RunOutcome, RunnerError> {
        let session_id = new_session_id();
        self.run_session(cascade, input, Echo::new(session_id)).await
    }

    /// Run a cascade with a caller-chosen session id (or a child echo).
    ///
    /// Boxed and type-erased: `run_session` participates in a recursion
    /// cycle through `dispatch` -> `spawn_async_cascades` ->
    /// `tokio::spawn` (fire-and-forget children call back into
    /// `run_session`). Without erasing the returned future's concrete
    /// type here, the compiler cannot terminate Send-auto-trait inference
    /// across that cycle.
    pub fn run_session(
        &self,
        cascade: Arc<Cascade>,
        input: Value,
        echo: Echo,
    ) -> futures_util::future::BoxFuture<'_, Result<RunOutcome, RunnerError>> {
        Box::pin(async move {
            // Configuration errors surface before any cell runs.
            cascade.validate_inputs(&input)?;

            let session_id = echo.session_id.clone();
            let genus = hashes::genus_hash(&cascade.cascade_id, &cascade.cells, &input);

            self.upsert_session(&cascade, &echo, &genus, "active").await;

            // The input is the first logged row; context that injects it points
            // back at this hash.
            let mut input_row =
                LogRow::new(&session_id, NodeType::User, Message::USER, input.clone());
            input_row.cascade_id = Some(cascade.cascade_id.clone());
            input_row.genus_hash = Some(genus.clone());
            self.services.log.append(input_row).await?;

            if self
                .hooks
                .on_cascade_start(&cascade.cascade_id, &session_id, &input)
                .await
                .is_abort()
            {
                let failure =
                    CascadeFailure::new(FailureKind::Aborted, "hook aborted cascade start");
                return self.finish_failed(&cascade, echo, failure).await;
            }
            self.services.bus.publish(Event::now(
                EVENT_CASCADE_START,
                &session_id,
                json!({"cascade_id": cascade.cascade_id.clone(), "depth": echo.depth}),
            ));

            let start_cell = match cascade.first_cell() {
                Some(cell) => cell.name.clone(),
                None => {
                    let failure =
                        CascadeFailure::new(FailureKind::Configuration, "cascade has no cells");
                    return self.finish_failed(&cascade, echo, failure).await;
                }
            };

            self.dispatch(cascade, echo, input, genus, start_cell, None)
                .await
        })
    }

    /// Resume a suspended session with a human response.
    pub async fn resume(
        &self,
        resume_token: &str,
        response: Value,
    ) -> Result<RunOutcome, RunnerError> {
        let suspended = self
            .checkpoints
            .take(resume_token)
            .await?
            .ok_or_else(|| RunnerError::UnknownToken {
                token: resume_token.to_string(),
            })?;
        let cascade = self.services.cascades.get(&suspended.cascade_id)?;

        if self
            .hooks
            .on_checkpoint_resumed(
                &suspended.session_id,
                &suspended.checkpoint.checkpoint_id,
                &suspended.cell_name,
                &response,
            )
            .await
            .is_abort()
        {
            let failure =
                CascadeFailure::new(FailureKind::Aborted, "hook aborted checkpoint resume");
            return self.finish_failed(&cascade, suspended.echo, failure).await;
        }
        self.services.bus.publish(Event::now(
            EVENT_CHECKPOINT_RESUMED,
            &suspended.session_id,
            json!({
                "checkpoint_id": suspended.checkpoint.checkpoint_id.clone(),
                "cell": suspended.cell_name.clone(),
            }),
        ));

        let mut echo = suspended.echo.clone();
        echo.take_checkpoint(&suspended.checkpoint.checkpoint_id);
        let genus =
            hashes::genus_hash(&cascade.cascade_id, &cascade.cells, &suspended.input);
        let directive = ResumeDirective {
            checkpoint: suspended.checkpoint,
            mode: suspended.resume_mode,
            response,
        };
        self.dispatch(
            cascade,
            echo,
            suspended.input,
            genus,
            suspended.cell_name,
            Some(directive),
        )
        .await
    }

    /// The dispatch loop.
    async fn dispatch(
        &self,
        cascade: Arc<Cascade>,
        mut echo: Echo,
        input: Value,
        genus: String,
        start_cell: String,
        mut resume: Option<ResumeDirective>,
    ) -> Result<RunOutcome, RunnerError> {
        let session_id = echo.session_id.clone();
        let mut current = Some(start_cell);
        let mut invocations = 0usize;

        while let Some(cell_name) = current.take() {
            invocations += 1;
            if invocations > self.services.config.max_cell_invocations {
                let failure = CascadeFailure::new(
                    FailureKind::Runaway,
                    format!("cell invocation cap {} reached", invocations - 1),
                )
                .in_cell(&cell_name);
                return self.finish_failed(&cascade, echo, failure).await;
            }

            let Some(cell) = cascade.cell(&cell_name).cloned() else {
                let failure = CascadeFailure::new(
                    FailureKind::Configuration,
                    format!("routing targeted unknown cell '{cell_name}'"),
                );
                return self.finish_failed(&cascade, echo, failure).await;
            };

            let resuming_here = resume.is_some();
            if !resuming_here {
                if self
                    .hooks
                    .on_cell_start(&cell.name, &session_id)
                    .await
                    .is_abort()
                {
                    let failure =
                        CascadeFailure::new(FailureKind::Aborted, "hook aborted cell start")
                            .in_cell(&cell.name);
                    return self.finish_failed(&cascade, echo, failure).await;
                }
                self.services.bus.publish(Event::now(
                    EVENT_CELL_START,
                    &session_id,
                    json!({"cell": cell.name.clone(), "cascade_id": cascade.cascade_id.clone()}),
                ));

                // Explicit audible pause gates the cell before any work.
                if let Some(audible) = &cell.audibles {
                    if audible.pause {
                        let payload = json!({
                            "prompt": audible.prompt.clone().unwrap_or_else(|| format!("Paused before cell '{}'", cell.name)),
                        });
                        return self
                            .suspend(
                                &cascade,
                                echo,
                                &input,
                                &cell.name,
                                CheckpointKind::Audible,
                                payload,
                                ResumeMode::Acknowledge,
                            )
                            .await;
                    }
                }

                // Fire-and-forget children declared for cell start.
                self.spawn_async_cascades(&cell, &echo, &input, AsyncTrigger::OnStart)
                    .await;
            }

            // One ephemeral scope per cell execution, closed on every path.
            let mut ephemeral = EphemeralRag::new(
                &session_id,
                &cell.name,
                EphemeralConfig {
                    threshold: self.services.config.ephemeral_threshold,
                    chunk_size: self.services.config.chunk_size,
                    chunk_overlap: self.services.config.chunk_overlap,
                    embed_model: self.services.config.default_embed_model.clone(),
                },
                Arc::clone(&self.services.chunks),
                Arc::clone(&self.services.embedder),
            );

            let step = self
                .execute_cell(
                    &cascade,
                    &cell,
                    &mut echo,
                    &input,
                    &genus,
                    resume.take(),
                    &mut ephemeral,
                )
                .await;
            ephemeral.close().await;

            match step {
                CellStep::Complete {
                    output,
                    content: _,
                    model,
                    duration_ms,
                    messages,
                } => {
                    // Decision routing can ask for a re-run of the same cell
                    // or a jump to a named cell.
                    if output.get("_route").and_then(Value::as_str) == Some("retry_self") {
                        current = Some(cell.name.clone());
                        continue;
                    }
                    if let Some(target) = output.get("decision_target").and_then(Value::as_str) {
                        let target = target.to_string();
                        echo.record_cell(LineageEntry {
                            cell: cell.name.clone(),
                            output: output.clone(),
                            model,
                            cost: None,
                            duration_ms: Some(duration_ms),
                        });
                        current = Some(target);
                        continue;
                    }

                    // Conversation from the cell joins the session history
                    // with hashes pointing back at logged rows.
                    for mut message in messages {
                        if message.has_role(Message::ASSISTANT)
                            && message.content_hash().is_none()
                        {
                            let hash = hashes::content_hash(&Value::String(
                                message.content.clone(),
                            ));
                            message.metadata.insert(
                                Message::META_CONTENT_HASH.into(),
                                Value::String(hash),
                            );
                        }
                        echo.push_history(message);
                    }

                    // Persist the cell output so later context injection
                    // references a logged hash.
                    let output_row =
                        LogRow::new(&session_id, NodeType::System, "system", output.clone())
                            .in_cell(&cell.name, &cascade.cascade_id)
                            .with_duration(duration_ms);
                    self.services.log.append(output_row).await?;

                    echo.record_cell(LineageEntry {
                        cell: cell.name.clone(),
                        output: output.clone(),
                        model,
                        cost: None,
                        duration_ms: Some(duration_ms),
                    });

                    // Synchronous children finish before this cell is
                    // considered complete; their templates see this cell's
                    // output.
                    if !cell.sub_cascades.is_empty() {
                        if let Err(failure) = self
                            .run_sub_cascades(&cell, &mut echo, &input)
                            .await
                        {
                            return self.finish_failed(&cascade, echo, failure).await;
                        }
                    }

                    if self
                        .hooks
                        .on_cell_complete(&cell.name, &session_id, &output)
                        .await
                        .is_abort()
                    {
                        let failure =
                            CascadeFailure::new(FailureKind::Aborted, "hook aborted cell complete")
                                .in_cell(&cell.name);
                        return self.finish_failed(&cascade, echo, failure).await;
                    }
                    self.services.bus.publish(Event::now(
                        EVENT_CELL_COMPLETE,
                        &session_id,
                        json!({"cell": cell.name.clone(), "duration_ms": duration_ms}),
                    ));

                    self.spawn_async_cascades(&cell, &echo, &input, AsyncTrigger::OnEnd)
                        .await;

                    current =
                        determine_routing(&output, cell.routing.as_ref(), &cell.handoffs);
                }
                CellStep::Suspend {
                    kind,
                    payload,
                    resume_mode,
                } => {
                    return self
                        .suspend(&cascade, echo, &input, &cell.name, kind, payload, resume_mode)
                        .await;
                }
                CellStep::Fail(failure) => {
                    // Local recovery: an on_error route sends the failure to
                    // a handler cell instead of ending the session.
                    if let Some(OnErrorSpec::Route(target)) = &cell.on_error {
                        if target != "auto_fix" && cascade.cell(target).is_some() {
                            echo.set_state(
                                "last_error",
                                json!({
                                    "cell": cell.name.clone(),
                                    "kind": format!("{:?}", failure.kind),
                                    "reason": failure.reason.clone(),
                                }),
                            );
                            echo.record_cell(LineageEntry {
                                cell: cell.name.clone(),
                                output: json!({"error": failure.reason.clone(), "_route": "error"}),
                                model: None,
                                cost: None,
                                duration_ms: None,
                            });
                            current = Some(target.clone());
                            continue;
                        }
                    }
                    return self.finish_failed(&cascade, echo, failure).await;
                }
            }
        }

        // No routing target left: the cascade is done.
        let output = echo
            .lineage
            .last()
            .map(|entry| entry.output.clone())
            .unwrap_or(Value::Null);
        self.hooks
            .on_cascade_complete(&cascade.cascade_id, &session_id, &output)
            .await;
        self.services.bus.publish(Event::now(
            EVENT_CASCADE_COMPLETE,
            &session_id,
            json!({"cascade_id": cascade.cascade_id.clone(), "cells": echo.lineage.len()}),
        ));
        self.upsert_session(&cascade, &echo, "", "completed").await;
        self.schedule_analytics(&session_id, &cascade.cascade_id);

        Ok(RunOutcome::Completed {
            session_id,
            output,
            echo,
        })
    }

    /// Execute one cell, including pre/post wards and resume directives.
    #[allow(clippy::too_many_arguments)]
    async fn execute_cell(
        &self,
        cascade: &Arc<Cascade>,
        cell: &Cell,
        echo: &mut Echo,
        input: &Value,
        genus: &str,
        resume: Option<ResumeDirective>,
        ephemeral: &mut EphemeralRag,
    ) -> CellStep {
        let dispatcher =
            ValidatorDispatcher::new(self.services.registry.clone(), cascade.validators.clone());
        let species = hashes::species_hash(cell, input);
        let scope = self.scope_for(echo, input);

        // Resume directives short-circuit parts of the cell.
        if let Some(directive) = &resume {
            match directive.mode {
                ResumeMode::SelectWinner => {
                    return self.finish_candidate_resume(cell, echo, directive).await;
                }
                ResumeMode::Decision => {
                    return self.finish_decision_resume(cell, directive);
                }
                ResumeMode::Acknowledge => {
                    if directive.checkpoint.kind == CheckpointKind::Screen {
                        let output = match &directive.response {
                            Value::Object(map) => Value::Object(map.clone()),
                            other => json!({"response": other}),
                        };
                        return CellStep::Complete {
                            output,
                            content: None,
                            model: None,
                            duration_ms: 0,
                            messages: Vec::new(),
                        };
                    }
                    // Audible acknowledged: fall through and run the cell.
                }
                ResumeMode::InjectAndContinue => {
                    let text = match &directive.response {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    echo.push_history(Message::user(text).from_cell(&cell.name));
                    // Fall through and re-run the cell with the response in
                    // history.
                }
            }
        }

        // Pre wards gate the cell's input.
        if let Some(wards) = &cell.wards {
            if !wards.pre.is_empty() {
                let mut attempt = 0u32;
                loop {
                    match apply_wards(&dispatcher, &wards.pre, input, input, &scope, attempt).await
                    {
                        Ok(verdict @ WardVerdict::Pass { .. }) => {
                            self.log_ward(cascade, &echo.session_id, &cell.name, "pre", &verdict)
                                .await;
                            break;
                        }
                        Ok(verdict @ WardVerdict::Retry { .. }) => {
                            self.log_ward(cascade, &echo.session_id, &cell.name, "pre", &verdict)
                                .await;
                            attempt += 1;
                            continue;
                        }
                        Ok(WardVerdict::Block { reason }) => {
                            self.log_ward(
                                cascade,
                                &echo.session_id,
                                &cell.name,
                                "pre",
                                &WardVerdict::Block {
                                    reason: reason.clone(),
                                },
                            )
                            .await;
                            return CellStep::Fail(
                                CascadeFailure::new(FailureKind::Validation, reason)
                                    .in_cell(&cell.name),
                            );
                        }
                        Err(err) => {
                            return CellStep::Fail(
                                CascadeFailure::new(FailureKind::Resolution, err.to_string())
                                    .in_cell(&cell.name),
                            );
                        }
                    }
                }
            }
        }

        // Main work with post-ward retry around it.
        let mut post_attempt = 0u32;
        loop {
            let step = self
                .run_cell_body(cascade, cell, echo, input, genus, &species, &dispatcher, ephemeral)
                .await;

            let CellStep::Complete {
                output,
                content,
                model,
                duration_ms,
                messages,
            } = step
            else {
                return step;
            };

            if let Some(wards) = &cell.wards {
                if !wards.post.is_empty() {
                    match apply_wards(
                        &dispatcher,
                        &wards.post,
                        &output,
                        input,
                        &scope,
                        post_attempt,
                    )
                    .await
                    {
                        Ok(verdict @ WardVerdict::Pass { .. }) => {
                            self.log_ward(cascade, &echo.session_id, &cell.name, "post", &verdict)
                                .await;
                        }
                        Ok(verdict @ WardVerdict::Retry { .. }) => {
                            self.log_ward(cascade, &echo.session_id, &cell.name, "post", &verdict)
                                .await;
                            post_attempt += 1;
                            continue;
                        }
                        Ok(WardVerdict::Block { reason }) => {
                            self.log_ward(
                                cascade,
                                &echo.session_id,
                                &cell.name,
                                "post",
                                &WardVerdict::Block {
                                    reason: reason.clone(),
                                },
                            )
                            .await;
                            return CellStep::Fail(
                                CascadeFailure::new(FailureKind::Validation, reason)
                                    .in_cell(&cell.name)
                                    .with_partial(output),
                            );
                        }
                        Err(err) => {
                            return CellStep::Fail(
                                CascadeFailure::new(FailureKind::Resolution, err.to_string())
                                    .in_cell(&cell.name),
                            );
                        }
                    }
                }
            }

            return CellStep::Complete {
                output,
                content,
                model,
                duration_ms,
                messages,
            };
        }
    }

    /// The variant-specific main work of a cell.
    #[allow(clippy::too_many_arguments)]
    async fn run_cell_body(
        &self,
        cascade: &Arc<Cascade>,
        cell: &Cell,
        echo: &mut Echo,
        input: &Value,
        genus: &str,
        species: &str,
        dispatcher: &ValidatorDispatcher,
        ephemeral: &mut EphemeralRag,
    ) -> CellStep {
        let scope = self.scope_for(echo, input);
        match &cell.variant {
            CellVariant::Deterministic(det) => {
                self.run_deterministic_body(cell, det, echo, input, &scope).await
            }
            CellVariant::Llm(llm) => {
                self.run_llm_body(
                    cascade, cell, llm, echo, input, genus, species, dispatcher, ephemeral, &scope,
                )
                .await
            }
            CellVariant::ForEachRow(map_cfg) => {
                self.run_for_each_row(cell, map_cfg, &scope).await
            }
            CellVariant::Screen(screen) => self.run_screen(cell, screen, &scope),
        }
    }

    async fn run_deterministic_body(
        &self,
        cell: &Cell,
        det: &DeterministicCell,
        echo: &Echo,
        input: &Value,
        scope: &RenderScope,
    ) -> CellStep {
        let outputs = Value::Object(echo.outputs.clone());
        let state = Value::Object(echo.state.clone());
        match execute_deterministic(
            &self.services,
            cell,
            det,
            scope,
            &echo.session_id,
            input,
            &outputs,
            &state,
            self.cascade_dir.as_deref(),
        )
        .await
        {
            Ok(result) => CellStep::Complete {
                output: result.output,
                content: None,
                model: None,
                duration_ms: result.duration_ms,
                messages: Vec::new(),
            },
            Err(failure) => {
                // Inline LLM fallback: `on_error.instructions` runs a repair
                // prompt in place of the failed tool.
                if let Some(OnErrorSpec::Config(config)) = &cell.on_error {
                    if let Some(instructions) = &config.instructions {
                        let model = config
                            .model
                            .clone()
                            .unwrap_or_else(|| self.services.config.utility_model.clone());
                        let error_scope = scope
                            .clone()
                            .with("error", json!(failure.reason.clone()));
                        let prompt = render_text(instructions, &error_scope)
                            .unwrap_or_else(|_| instructions.clone());
                        match self
                            .services
                            .chat
                            .complete(crate::provider::ChatRequest::new(
                                model,
                                vec![Message::user(prompt)],
                            ))
                            .await
                        {
                            Ok(response) => {
                                return CellStep::Complete {
                                    output: parse_output(&response.content),
                                    content: Some(response.content),
                                    model: None,
                                    duration_ms: 0,
                                    messages: Vec::new(),
                                };
                            }
                            Err(err) => {
                                tracing::warn!(
                                    target: "rvbbit::runner",
                                    cell = %cell.name,
                                    error = %err,
                                    "on_error fallback instructions failed"
                                );
                            }
                        }
                    }
                }
                CellStep::Fail(failure)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_llm_body(
        &self,
        cascade: &Arc<Cascade>,
        cell: &Cell,
        llm: &LlmCell,
        echo: &mut Echo,
        input: &Value,
        genus: &str,
        species: &str,
        dispatcher: &ValidatorDispatcher,
        ephemeral: &mut EphemeralRag,
        scope: &RenderScope,
    ) -> CellStep {
        // Large template data is swapped for search tools before the
        // instructions render.
        let processed_input = ephemeral
            .process_template_data(input.clone(), "input")
            .await;
        let render_scope = {
            let mut updated = scope.clone();
            updated.bind("input", processed_input.clone());
            updated
        };
        let instructions = match render_text(&llm.instructions, &render_scope) {
            Ok(instructions) => instructions,
            Err(err) => {
                return CellStep::Fail(
                    CascadeFailure::new(FailureKind::Resolution, err.to_string())
                        .in_cell(&cell.name),
                );
            }
        };

        let context_config = cell.context.as_ref().or(cascade.auto_context.as_ref());
        let mut context = match self
            .services
            .context
            .build(context_config, echo, input, &instructions, scope)
            .await
        {
            Ok(context) => context,
            Err(err) => {
                return CellStep::Fail(
                    CascadeFailure::new(FailureKind::Resolution, err.to_string())
                        .in_cell(&cell.name),
                );
            }
        };

        // Oversized injected context also becomes searchable.
        let mut gated = Vec::with_capacity(context.messages.len());
        for mut message in context.messages.drain(..) {
            let source_cell = message.source_cell().map(str::to_string);
            let content = Value::String(message.content.clone());
            let (content, _) = match source_cell {
                Some(cell_name) => {
                    ephemeral
                        .process_context_injection(&cell_name, content)
                        .await
                }
                None => {
                    ephemeral
                        .check_message_content(content, "context:input")
                        .await
                }
            };
            if let Value::String(text) = content {
                message.content = text;
            }
            gated.push(message);
        }
        context.messages = gated;

        // Cascade token budget applies before the model sees anything.
        if let Some(budget) = &cascade.token_budget {
            let summarizer = (&self.services.chat, self.services.config.utility_model.as_str());
            match crate::context::apply_token_budget(
                std::mem::take(&mut context.messages),
                budget,
                Some((summarizer.0, summarizer.1)),
            )
            .await
            {
                Ok(messages) => context.messages = messages,
                Err(err) => {
                    return CellStep::Fail(
                        CascadeFailure::new(FailureKind::Validation, err.to_string())
                            .in_cell(&cell.name),
                    );
                }
            }
        }

        let model = llm
            .model
            .clone()
            .unwrap_or_else(|| self.services.config.default_model.clone());

        // Candidate fan-out when configured (cell overrides cascade).
        let candidates = cell.candidates.as_ref().or(cascade.candidates.as_ref());
        if let Some(config) = candidates {
            return self
                .run_candidates(
                    cascade,
                    cell,
                    llm,
                    config,
                    echo,
                    input,
                    genus,
                    species,
                    dispatcher,
                    &instructions,
                    &context,
                    scope,
                    &model,
                )
                .await;
        }

        let result = run_turn_loop(TurnLoopParams {
            services: &self.services,
            dispatcher,
            hooks: &self.hooks,
            cell,
            llm,
            instructions,
            context,
            ephemeral,
            scope,
            original_input: input,
            session_id: &echo.session_id,
            cascade_id: &cascade.cascade_id,
            species_hash: species,
            genus_hash: genus,
            model: model.clone(),
            candidate_index: None,
        })
        .await;

        match result {
            Ok(TurnLoopResult::Done {
                content,
                output,
                messages,
                turns: _,
                duration_ms,
            }) => CellStep::Complete {
                output,
                content: Some(content),
                model: Some(model),
                duration_ms,
                messages,
            },
            Ok(TurnLoopResult::Decision {
                decision,
                content,
                output,
                messages: _,
            }) => CellStep::Suspend {
                kind: CheckpointKind::Decision,
                payload: json!({
                    "question": decision.question,
                    "options": decision.options,
                    "content": content,
                    "output": output,
                }),
                resume_mode: ResumeMode::Decision,
            },
            Err(failure) => CellStep::Fail(failure),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_candidates(
        &self,
        cascade: &Arc<Cascade>,
        cell: &Cell,
        llm: &LlmCell,
        config: &CandidatesConfig,
        echo: &Echo,
        input: &Value,
        genus: &str,
        species: &str,
        dispatcher: &ValidatorDispatcher,
        instructions: &str,
        context: &crate::context::BuiltContext,
        scope: &RenderScope,
        model: &str,
    ) -> CellStep {
        let engine = CandidateEngine::new(
            Arc::clone(&self.services.chat),
            dispatcher.clone(),
            Arc::clone(&self.services.log),
            &self.services.config.utility_model,
        );

        // Attempts run the full turn loop against an echo shadow; decision
        // points stay out of candidate attempts.
        let mut attempt_cell = cell.clone();
        attempt_cell.decision_points = None;
        let attempt_runner: Arc<dyn AttemptRunner> = Arc::new(CellAttemptRunner {
            services: Arc::clone(&self.services),
            dispatcher: dispatcher.clone(),
            hooks: Arc::clone(&self.hooks),
            cell: attempt_cell,
            llm: llm.clone(),
            context: context.clone(),
            scope: scope.clone(),
            original_input: input.clone(),
            session_id: echo.session_id.clone(),
            cascade_id: cascade.cascade_id.clone(),
            species_hash: species.to_string(),
            genus_hash: genus.to_string(),
            default_model: model.to_string(),
        });

        let run = CandidateRun {
            config,
            base_instructions: instructions.to_string(),
            session_id: echo.session_id.clone(),
            cell_name: cell.name.clone(),
            cascade_id: cascade.cascade_id.clone(),
            species_hash: species.to_string(),
            original_input: input.clone(),
            scope: scope.clone(),
            default_model: model.to_string(),
        };

        match engine.run(run, attempt_runner).await {
            Ok(CandidateOutcome {
                suspension: Some(payload),
                ..
            }) => CellStep::Suspend {
                kind: CheckpointKind::Evaluator,
                payload,
                resume_mode: ResumeMode::SelectWinner,
            },
            Ok(outcome) => {
                let mut message = Message::assistant(&outcome.content).from_cell(&cell.name);
                if let Some(winner) = outcome.winner_index {
                    message
                        .metadata
                        .insert("candidate_index".into(), json!(winner));
                }
                CellStep::Complete {
                    output: outcome.output,
                    content: Some(outcome.content),
                    model: Some(model.to_string()),
                    duration_ms: outcome
                        .attempts
                        .iter()
                        .map(|a| a.duration_ms)
                        .max()
                        .unwrap_or(0),
                    messages: vec![message],
                }
            }
            Err(CandidateError::AllFiltered) => CellStep::Fail(
                CascadeFailure::new(FailureKind::Validation, "all_candidates_filtered")
                    .in_cell(&cell.name),
            ),
            Err(err) => CellStep::Fail(
                CascadeFailure::new(FailureKind::LlmExecution, err.to_string())
                    .in_cell(&cell.name),
            ),
        }
    }

    async fn run_for_each_row(
        &self,
        cell: &Cell,
        map_cfg: &crate::cascade::ForEachRowConfig,
        scope: &RenderScope,
    ) -> CellStep {
        let started = Instant::now();

        // Rows come from a SQL query or a template resolving to a list.
        let rows: Vec<Value> = if let Some(query_template) = &map_cfg.query {
            let query = match render_text(query_template, scope) {
                Ok(query) => query,
                Err(err) => {
                    return CellStep::Fail(
                        CascadeFailure::new(FailureKind::Resolution, err.to_string())
                            .in_cell(&cell.name),
                    );
                }
            };
            let sql_tool = match self.services.registry.resolve("sql_data") {
                Ok(tool) => tool,
                Err(err) => {
                    return CellStep::Fail(
                        CascadeFailure::new(FailureKind::Resolution, err.to_string())
                            .in_cell(&cell.name),
                    );
                }
            };
            let mut args = Map::new();
            args.insert("query".into(), Value::String(query));
            match sql_tool.invoke(Value::Object(args)).await {
                Ok(result) => result
                    .get("data")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Err(err) => {
                    return CellStep::Fail(
                        CascadeFailure::new(FailureKind::ToolExecution, err.to_string())
                            .in_cell(&cell.name),
                    );
                }
            }
        } else if let Some(rows_template) = &map_cfg.rows {
            match render_value(rows_template, scope) {
                Ok(Value::Array(rows)) => rows,
                Ok(other) => {
                    return CellStep::Fail(
                        CascadeFailure::new(
                            FailureKind::Resolution,
                            format!("for_each_row rows template produced {other}, expected a list"),
                        )
                        .in_cell(&cell.name),
                    );
                }
                Err(err) => {
                    return CellStep::Fail(
                        CascadeFailure::new(FailureKind::Resolution, err.to_string())
                            .in_cell(&cell.name),
                    );
                }
            }
        } else {
            return CellStep::Fail(
                CascadeFailure::new(
                    FailureKind::Configuration,
                    "for_each_row needs `query` or `rows`",
                )
                .in_cell(&cell.name),
            );
        };

        let tool = match self.services.registry.resolve(&map_cfg.tool) {
            Ok(tool) => tool,
            Err(err) => {
                return CellStep::Fail(
                    CascadeFailure::new(FailureKind::Resolution, err.to_string())
                        .in_cell(&cell.name),
                );
            }
        };

        let mut results = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let row_scope = scope.clone().with("row", row.clone());
            let rendered = match render_inputs(&map_cfg.tool_inputs, &row_scope) {
                Ok(rendered) => rendered,
                Err(err) => {
                    return CellStep::Fail(
                        CascadeFailure::new(FailureKind::Resolution, err.to_string())
                            .in_cell(&cell.name),
                    );
                }
            };
            let mut args = rendered;
            args.entry("row".to_string()).or_insert_with(|| row.clone());
            match tool.invoke(Value::Object(args)).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    return CellStep::Fail(
                        CascadeFailure::new(
                            FailureKind::ToolExecution,
                            format!("row {index}: {err}"),
                        )
                        .in_cell(&cell.name)
                        .with_partial(json!({"rows": results})),
                    );
                }
            }
        }

        CellStep::Complete {
            output: json!({
                "rows": results,
                "row_count": rows.len(),
                "_route": "success",
            }),
            content: None,
            model: None,
            duration_ms: started.elapsed().as_millis() as u64,
            messages: Vec::new(),
        }
    }

    fn run_screen(&self, cell: &Cell, screen: &ScreenCell, scope: &RenderScope) -> CellStep {
        let html = render_text(&screen.htmx, scope)
            .unwrap_or_else(|_| screen.htmx.clone());
        CellStep::Suspend {
            kind: CheckpointKind::Screen,
            payload: json!({"htmx": html, "cell": cell.name.clone()}),
            resume_mode: ResumeMode::Acknowledge,
        }
    }

    /// Resume path: the human picked a candidate winner.
    async fn finish_candidate_resume(
        &self,
        cell: &Cell,
        echo: &Echo,
        directive: &ResumeDirective,
    ) -> CellStep {
        let winner = directive
            .response
            .get("winner_index")
            .or_else(|| directive.response.get("winner"))
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        let Some(winner) = winner else {
            return CellStep::Fail(
                CascadeFailure::new(
                    FailureKind::Validation,
                    "resume response missing winner_index",
                )
                .in_cell(&cell.name),
            );
        };
        let attempts = directive
            .checkpoint
            .payload
            .get("all_attempts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let Some(chosen) = attempts
            .iter()
            .find(|a| a.get("index").and_then(Value::as_u64) == Some(u64::from(winner)))
        else {
            return CellStep::Fail(
                CascadeFailure::new(
                    FailureKind::Validation,
                    format!("winner_index {winner} not in candidate set"),
                )
                .in_cell(&cell.name),
            );
        };

        if let Err(err) = self
            .services
            .log
            .mark_winner(&echo.session_id, &cell.name, winner)
            .await
        {
            tracing::warn!(target: "rvbbit::runner", error = %err, "winner marking failed");
        }

        let content = chosen
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let output = chosen.get("output").cloned().unwrap_or(Value::Null);
        let message = Message::assistant(&content).from_cell(&cell.name);
        CellStep::Complete {
            output,
            content: Some(content),
            model: chosen
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            duration_ms: 0,
            messages: vec![message],
        }
    }

    /// Resume path: a decision block was answered.
    fn finish_decision_resume(&self, cell: &Cell, directive: &ResumeDirective) -> CellStep {
        let option_id = directive
            .response
            .get("option_id")
            .or_else(|| directive.response.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let routing = cell
            .decision_points
            .as_ref()
            .map(|d| d.routing.clone())
            .unwrap_or_default();
        let action = routing
            .get(&option_id)
            .cloned()
            .unwrap_or_else(|| "continue".to_string());

        let content = directive
            .checkpoint
            .payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let output = directive
            .checkpoint
            .payload
            .get("output")
            .cloned()
            .unwrap_or(Value::Null);

        match action.as_str() {
            "continue" => CellStep::Complete {
                output,
                content: Some(content.clone()),
                model: None,
                duration_ms: 0,
                messages: vec![Message::assistant(&content).from_cell(&cell.name)],
            },
            "retry" => {
                // Re-run the cell: report a routed output pointing at the
                // cell itself.
                CellStep::Complete {
                    output: json!({"_route": "retry_self"}),
                    content: None,
                    model: None,
                    duration_ms: 0,
                    messages: Vec::new(),
                }
            }
            "fail" => CellStep::Fail(
                CascadeFailure::new(
                    FailureKind::Validation,
                    format!("decision '{option_id}' routed to fail"),
                )
                .in_cell(&cell.name)
                .with_partial(output),
            ),
            target => CellStep::Complete {
                output: json!({"_route": "decision", "decision_target": target, "content": content.clone()}),
                content: Some(content.clone()),
                model: None,
                duration_ms: 0,
                messages: vec![Message::assistant(&content).from_cell(&cell.name)],
            },
        }
    }

    /// Synchronous sub-cascades on the calling cell's task.
    async fn run_sub_cascades(
        &self,
        cell: &Cell,
        echo: &mut Echo,
        input: &Value,
    ) -> Result<(), CascadeFailure> {
        for spec in &cell.sub_cascades {
            let child_outcome = self.run_one_sub_cascade(cell, echo, input, spec).await?;
            if spec.fold_outputs {
                if let RunOutcome::Completed { output, .. } = &child_outcome {
                    if output.is_object() {
                        echo.outputs
                            .insert(spec.cascade_ref.clone(), output.clone());
                    }
                    echo.set_state(
                        &format!("sub:{}", spec.cascade_ref),
                        output.clone(),
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_one_sub_cascade(
        &self,
        cell: &Cell,
        echo: &Echo,
        input: &Value,
        spec: &SubCascadeSpec,
    ) -> Result<RunOutcome, CascadeFailure> {
        let child_cascade = self
            .services
            .cascades
            .get(&spec.cascade_ref)
            .map_err(|err| {
                CascadeFailure::new(FailureKind::Resolution, err.to_string()).in_cell(&cell.name)
            })?;
        let scope = self.scope_for(echo, input);
        let child_input = render_inputs(&spec.input_map, &scope).map_err(|err| {
            CascadeFailure::new(FailureKind::Resolution, err.to_string()).in_cell(&cell.name)
        })?;

        let mut child_echo = echo.child(new_session_id());
        if spec.context_in {
            child_echo.history = echo.history.clone();
        }

        let outcome = Box::pin(self.run_session(
            child_cascade,
            Value::Object(child_input),
            child_echo,
        ))
        .await
        .map_err(|err| {
            CascadeFailure::new(FailureKind::Resolution, err.to_string()).in_cell(&cell.name)
        })?;

        match &outcome {
            RunOutcome::Failed { failure, .. } => Err(CascadeFailure::new(
                FailureKind::ToolExecution,
                format!("sub-cascade '{}' failed: {}", spec.cascade_ref, failure.reason),
            )
            .in_cell(&cell.name)),
            RunOutcome::Suspended { .. } => Err(CascadeFailure::new(
                FailureKind::Validation,
                format!(
                    "sub-cascade '{}' suspended; synchronous children cannot wait on humans",
                    spec.cascade_ref
                ),
            )
            .in_cell(&cell.name)),
            RunOutcome::Completed { .. } => Ok(outcome),
        }
    }

    /// Independent child sessions, fired and forgotten.
    async fn spawn_async_cascades(
        &self,
        cell: &Cell,
        echo: &Echo,
        input: &Value,
        trigger: AsyncTrigger,
    ) {
        for spec in cell
            .async_cascades
            .iter()
            .filter(|s| s.trigger == trigger)
        {
            let Ok(child_cascade) = self.services.cascades.get(&spec.cascade_ref) else {
                tracing::warn!(
                    target: "rvbbit::runner",
                    cascade_ref = %spec.cascade_ref,
                    "async cascade ref did not resolve"
                );
                continue;
            };
            let scope = self.scope_for(echo, input);
            let child_input = match render_inputs(&spec.input_map, &scope) {
                Ok(inputs) => Value::Object(inputs),
                Err(err) => {
                    tracing::warn!(
                        target: "rvbbit::runner",
                        error = %err,
                        "async cascade input rendering failed"
                    );
                    continue;
                }
            };
            let child_echo = echo.child(new_session_id());
            let runner = CascadeRunner {
                services: Arc::clone(&self.services),
                hooks: Arc::clone(&self.hooks),
                checkpoints: Arc::clone(&self.checkpoints),
                cascade_dir: self.cascade_dir.clone(),
                caller_id: self.caller_id.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = runner
                    .run_session(child_cascade, child_input, child_echo)
                    .await
                {
                    tracing::warn!(
                        target: "rvbbit::runner",
                        error = %err,
                        "async sub-cascade errored"
                    );
                }
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn suspend(
        &self,
        cascade: &Arc<Cascade>,
        mut echo: Echo,
        input: &Value,
        cell_name: &str,
        kind: CheckpointKind,
        payload: Value,
        resume_mode: ResumeMode,
    ) -> Result<RunOutcome, RunnerError> {
        let checkpoint = CheckpointRecord::new(cell_name, kind, payload.clone());
        echo.add_checkpoint(checkpoint.clone());

        let checkpoint_row = LogRow::new(
            &echo.session_id,
            NodeType::Checkpoint,
            "system",
            json!({
                "checkpoint_id": checkpoint.checkpoint_id.clone(),
                "kind": checkpoint.kind,
                "payload": payload,
            }),
        )
        .in_cell(cell_name, &cascade.cascade_id);
        self.services.log.append(checkpoint_row).await?;

        let resume_token = format!("resume_{}", new_trace_id());
        self.checkpoints
            .save(SuspendedSession {
                resume_token: resume_token.clone(),
                session_id: echo.session_id.clone(),
                cascade_id: cascade.cascade_id.clone(),
                echo: echo.clone(),
                cell_name: cell_name.to_string(),
                resume_mode,
                checkpoint: checkpoint.clone(),
                input: input.clone(),
            })
            .await?;

        self.hooks
            .on_checkpoint_suspended(
                &echo.session_id,
                &checkpoint.checkpoint_id,
                checkpoint_kind_name(kind),
                &checkpoint.payload,
            )
            .await;
        self.services.bus.publish(Event::now(
            EVENT_CHECKPOINT_SUSPENDED,
            &echo.session_id,
            json!({
                "checkpoint_id": checkpoint.checkpoint_id.clone(),
                "cell": cell_name,
                "kind": checkpoint_kind_name(kind),
            }),
        ));
        self.upsert_session(cascade, &echo, "", "suspended").await;

        Ok(RunOutcome::Suspended {
            session_id: echo.session_id,
            resume_token,
            checkpoint,
        })
    }

    async fn finish_failed(
        &self,
        cascade: &Arc<Cascade>,
        echo: Echo,
        failure: CascadeFailure,
    ) -> Result<RunOutcome, RunnerError> {
        let session_id = echo.session_id.clone();
        let failure_row = LogRow::new(
            &session_id,
            NodeType::System,
            "system",
            serde_json::to_value(&failure).unwrap_or(Value::Null),
        );
        let _ = self.services.log.append(failure_row).await;

        self.hooks
            .on_cascade_error(&cascade.cascade_id, &session_id, &failure.reason)
            .await;
        self.services.bus.publish(Event::now(
            EVENT_CASCADE_ERROR,
            &session_id,
            json!({"cascade_id": cascade.cascade_id.clone(), "reason": failure.reason.clone()}),
        ));
        self.upsert_session(cascade, &echo, "", "error").await;
        // Analytics runs on failed sessions too.
        self.schedule_analytics(&session_id, &cascade.cascade_id);

        Ok(RunOutcome::Failed {
            session_id,
            failure,
            echo,
        })
    }

    /// One `ward_result` row per ward application, advisory failures
    /// included.
    async fn log_ward(
        &self,
        cascade: &Arc<Cascade>,
        session_id: &str,
        cell_name: &str,
        phase: &str,
        verdict: &WardVerdict,
    ) {
        let content = match verdict {
            WardVerdict::Pass { advisories } if advisories.is_empty() => {
                json!({"phase": phase, "passed": true})
            }
            WardVerdict::Pass { advisories } => json!({
                "phase": phase,
                "passed": true,
                "advisories": advisories.iter().map(|a| a.reason.clone()).collect::<Vec<_>>(),
            }),
            WardVerdict::Retry { reason, .. } => {
                json!({"phase": phase, "passed": false, "retry": true, "reason": reason})
            }
            WardVerdict::Block { reason } => {
                json!({"phase": phase, "passed": false, "reason": reason})
            }
        };
        let row = LogRow::new(session_id, NodeType::WardResult, "system", content)
            .in_cell(cell_name, &cascade.cascade_id);
        if let Err(err) = self.services.log.append(row).await {
            tracing::warn!(target: "rvbbit::runner", error = %err, "ward_result append failed");
        }
    }

    fn schedule_analytics(&self, session_id: &str, cascade_id: &str) {
        let services = Arc::clone(&self.services);
        let session_id = session_id.to_string();
        let cascade_id = cascade_id.to_string();
        tokio::spawn(async move {
            let worker = crate::analytics::AnalyticsWorker::new(services);
            if let Err(err) = worker.analyze(&session_id, &cascade_id).await {
                tracing::warn!(
                    target: "rvbbit::analytics",
                    session = %session_id,
                    error = %err,
                    "post-session analytics failed"
                );
            }
        });
    }

    async fn upsert_session(&self, cascade: &Arc<Cascade>, echo: &Echo, genus: &str, status: &str) {
        let existing = self
            .services
            .analytics
            .session_record(&echo.session_id)
            .await
            .ok()
            .flatten();
        let created_at = existing
            .as_ref()
            .map(|r| r.created_at)
            .unwrap_or_else(chrono::Utc::now);
        let genus_hash = if genus.is_empty() {
            existing.and_then(|r| r.genus_hash)
        } else {
            Some(genus.to_string())
        };
        let record = SessionRecord {
            session_id: echo.session_id.clone(),
            cascade_id: cascade.cascade_id.clone(),
            parent_session_id: echo.parent_session_id.clone(),
            caller_id: self.caller_id.clone(),
            invocation_metadata_json: json!({"depth": echo.depth}),
            genus_hash,
            status: status.to_string(),
            created_at,
            updated_at: chrono::Utc::now(),
        };
        if let Err(err) = self.services.analytics.upsert_session_record(record).await {
            tracing::warn!(target: "rvbbit::runner", error = %err, "session record upsert failed");
        }
    }

    fn scope_for(&self, echo: &Echo, input: &Value) -> RenderScope {
        RenderScope::for_cell(
            input,
            &Value::Object(echo.state.clone()),
            &Value::Object(echo.outputs.clone()),
            &echo.lineage_value(),
            &echo.history_value(),
        )
    }
}

fn checkpoint_kind_name(kind: CheckpointKind) -> &'static str {
    match kind {
        CheckpointKind::Human => "human",
        CheckpointKind::Decision => "decision",
        CheckpointKind::Evaluator => "evaluator",
        CheckpointKind::Screen => "screen",
        CheckpointKind::Audible => "audible",
    }
}

/// Runs one candidate attempt: the cell's full turn loop against an echo
/// shadow with its own ephemeral scope.
struct CellAttemptRunner {
    services: Arc<Services>,
    dispatcher: ValidatorDispatcher,
    hooks: Arc<dyn CascadeHooks>,
    cell: Cell,
    llm: LlmCell,
    context: crate::context::BuiltContext,
    scope: RenderScope,
    original_input: Value,
    session_id: String,
    cascade_id: String,
    species_hash: String,
    genus_hash: String,
    default_model: String,
}

#[async_trait]
impl AttemptRunner for CellAttemptRunner {
    async fn run_attempt(&self, spec: AttemptSpec) -> Result<AttemptResult, String> {
        let mut ephemeral = EphemeralRag::new(
            &self.session_id,
            &self.cell.name,
            EphemeralConfig {
                threshold: self.services.config.ephemeral_threshold,
                chunk_size: self.services.config.chunk_size,
                chunk_overlap: self.services.config.chunk_overlap,
                embed_model: self.services.config.default_embed_model.clone(),
            },
            Arc::clone(&self.services.chunks),
            Arc::clone(&self.services.embedder),
        );

        let model = spec
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let result = run_turn_loop(TurnLoopParams {
            services: &self.services,
            dispatcher: &self.dispatcher,
            hooks: &self.hooks,
            cell: &self.cell,
            llm: &self.llm,
            instructions: spec.instructions.clone(),
            context: self.context.clone(),
            ephemeral: &mut ephemeral,
            scope: &self.scope,
            original_input: &self.original_input,
            session_id: &self.session_id,
            cascade_id: &self.cascade_id,
            species_hash: &self.species_hash,
            genus_hash: &self.genus_hash,
            model: model.clone(),
            candidate_index: Some(spec.index),
        })
        .await;
        ephemeral.close().await;

        match result {
            Ok(TurnLoopResult::Done {
                content,
                output,
                duration_ms,
                ..
            }) => Ok(AttemptResult {
                content,
                output,
                model: Some(model),
                cost: None,
                tokens_out: None,
                duration_ms,
            }),
            Ok(TurnLoopResult::Decision { content, output, .. }) => Ok(AttemptResult {
                content,
                output,
                model: Some(model),
                cost: None,
                tokens_out: None,
                duration_ms: 0,
            }),
            Err(failure) => Err(failure.to_string()),
        }
    }
}
