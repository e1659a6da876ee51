//! Candidate fan-out, evaluation, aggregation, and human selection.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{harness, register_content_validator, session_rows, ScriptedChat};
use rvbbit::cascade::Cascade;
use rvbbit::provider::{ChatRequest, ChatResponse};
use rvbbit::runner::{CascadeRunner, FailureKind, RunOutcome};
use rvbbit::types::NodeType;

/// Parse "=== attempt N ===" blocks out of an evaluator prompt.
fn attempts_in_prompt(prompt: &str) -> Vec<(u32, String)> {
    let mut attempts = Vec::new();
    let mut current: Option<(u32, Vec<String>)> = None;
    for line in prompt.lines() {
        if let Some(rest) = line.strip_prefix("=== attempt ") {
            if let Some((index, _)) = rest.split_once(' ') {
                if let Some((index_done, body)) = current.take() {
                    attempts.push((index_done, body.join("\n")));
                }
                current = Some((index.parse().unwrap_or(0), Vec::new()));
                continue;
            }
        }
        if line.starts_with("Reply with ONLY JSON") {
            break;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line.to_string());
        }
    }
    if let Some((index, body)) = current.take() {
        attempts.push((index, body.join("\n")));
    }
    attempts
}

/// Responder implementing: rewrite mutations, distinct attempt outputs of
/// different lengths, and a shortest-wins evaluator.
fn candidate_responder(request: &ChatRequest, _call: usize) -> ChatResponse {
    let prompt = request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let content = if prompt.contains("Rewrite the following instructions") {
        r#"["Variant wording one", "Variant wording two"]"#.to_string()
    } else if prompt.contains("\"winner\"") {
        // Evaluator: pick the shortest attempt by character length.
        let attempts = attempts_in_prompt(&prompt);
        let winner = attempts
            .iter()
            .min_by_key(|(_, body)| body.trim().len())
            .map(|(index, _)| *index)
            .unwrap_or(0);
        format!("{{\"winner\": {winner}, \"scores\": []}}")
    } else {
        // Attempt responses: length keyed off the instructions so mutated
        // prompts produce visibly different outputs.
        let system = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if system.contains("Variant wording one") {
            "short".to_string()
        } else if system.contains("Variant wording two") {
            "a medium length answer here".to_string()
        } else {
            "this is the pristine baseline answer, quite a bit longer than the others".to_string()
        }
    };
    ChatResponse {
        content,
        model: "scripted".to_string(),
        ..ChatResponse::default()
    }
}

const CANDIDATES_DOC: &str = r#"
cascade_id: soundings
cells:
  - name: gen
    instructions: "Write the answer"
    candidates:
      factor: 3
      mutate: true
      max_parallel: 3
      evaluator_instructions: "pick the shortest"
"#;

#[tokio::test]
async fn three_attempts_distinct_mutations_one_winner() {
    let h = harness(ScriptedChat::new(candidate_responder));
    let cascade = h
        .services
        .cascades
        .register(Cascade::from_str(CANDIDATES_DOC).unwrap());
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Completed {
        session_id, output, ..
    } = outcome
    else {
        panic!("expected completion");
    };
    // The winner is the shortest content.
    assert_eq!(output["content"], json!("short"));

    let rows = session_rows(&h.services, &session_id).await;
    let attempts: Vec<_> = rows
        .iter()
        .filter(|r| r.node_type == NodeType::SoundingAttempt)
        .collect();
    assert_eq!(attempts.len(), 3);

    // One pristine baseline, two distinct mutations.
    let mutations: Vec<Option<&str>> = attempts
        .iter()
        .map(|r| r.mutation_applied.as_deref())
        .collect();
    assert!(mutations.contains(&None));
    let applied: Vec<&str> = mutations.iter().flatten().copied().collect();
    assert_eq!(applied.len(), 2);
    assert_ne!(applied[0], applied[1]);

    // Exactly one winner, and all attempts share the species hash.
    let winners: Vec<_> = attempts
        .iter()
        .filter(|r| r.is_winner == Some(true))
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].content_json, json!("short"));
    let species: Vec<_> = attempts
        .iter()
        .map(|r| r.species_hash.clone())
        .collect();
    assert!(species.windows(2).all(|w| w[0] == w[1]));

    // Fan-out calls: 1 rewrite, 3 attempts, 1 evaluator.
    assert_eq!(h.chat.call_count(), 5);
}

#[tokio::test]
async fn factor_one_without_mutation_skips_the_evaluator() {
    let h = harness(ScriptedChat::constant("only answer"));
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: single
cells:
  - name: gen
    instructions: "Write it"
    candidates:
      factor: 1
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Completed { session_id, .. } = outcome else {
        panic!("expected completion");
    };
    // One attempt, zero evaluator calls.
    assert_eq!(h.chat.call_count(), 1);
    let rows = session_rows(&h.services, &session_id).await;
    let attempts = rows
        .iter()
        .filter(|r| r.node_type == NodeType::SoundingAttempt)
        .count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn prefilter_dropping_everything_fails_the_cell() {
    let h = harness(ScriptedChat::constant("garbage"));
    register_content_validator(&h.services.registry, "never_pass", |_| {
        (false, "rejected".to_string())
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: filtered
cells:
  - name: gen
    instructions: "Write it"
    candidates:
      factor: 2
      validator: never_pass
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Failed { failure, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::Validation);
    assert!(failure.reason.contains("all_candidates_filtered"));
}

#[tokio::test]
async fn aggregate_mode_concatenates_without_a_winner() {
    let h = harness(ScriptedChat::new(|request, _| {
        let system = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        ChatResponse {
            content: format!("take on: {}", system.len()),
            model: "scripted".to_string(),
            ..ChatResponse::default()
        }
    }));
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: agg
cells:
  - name: gen
    instructions: "Write it"
    candidates:
      factor: 2
      mode: aggregate
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Completed {
        session_id, output, ..
    } = outcome
    else {
        panic!("expected completion");
    };
    assert_eq!(output["attempt_count"], json!(2));

    let rows = session_rows(&h.services, &session_id).await;
    let winners = rows
        .iter()
        .filter(|r| r.is_winner == Some(true))
        .count();
    assert_eq!(winners, 0, "aggregate mode never marks a winner");
}

#[tokio::test]
async fn human_evaluator_suspends_and_resume_selects_winner() {
    let h = harness(ScriptedChat::new(|request, call| {
        let _ = request;
        ChatResponse {
            content: format!("attempt body {call}"),
            model: "scripted".to_string(),
            ..ChatResponse::default()
        }
    }));
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: hitl
cells:
  - name: gen
    instructions: "Write it"
    candidates:
      factor: 2
      evaluator: human
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(Arc::clone(&cascade), json!({})).await.unwrap();
    let RunOutcome::Suspended {
        resume_token,
        checkpoint,
        session_id,
    } = outcome
    else {
        panic!("expected suspension for human evaluator");
    };
    assert_eq!(checkpoint.payload["kind"], json!("candidate_selection"));
    assert_eq!(
        checkpoint.payload["attempts"].as_array().unwrap().len(),
        2
    );

    let outcome = runner
        .resume(&resume_token, json!({"winner_index": 1}))
        .await
        .unwrap();
    let RunOutcome::Completed { echo, .. } = outcome else {
        panic!("expected completion after winner pick");
    };
    assert_eq!(echo.lineage.len(), 1);

    let rows = session_rows(&h.services, &session_id).await;
    let winners: Vec<_> = rows
        .iter()
        .filter(|r| r.node_type == NodeType::SoundingAttempt && r.is_winner == Some(true))
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].candidate_index, Some(1));
}
