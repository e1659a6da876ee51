//! Ward semantics through full cascade runs.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{harness, register_content_validator, register_json_tool, session_rows, ScriptedChat};
use rvbbit::cascade::Cascade;
use rvbbit::provider::ChatResponse;
use rvbbit::runner::{CascadeRunner, FailureKind, RunOutcome};
use rvbbit::types::NodeType;

#[tokio::test]
async fn blocking_post_ward_fails_the_cell_with_reason() {
    let h = harness(ScriptedChat::constant("unused"));
    register_json_tool(&h.services.registry, "emit", |_| {
        Ok(json!({"text": "contains forbidden word"}))
    });
    register_content_validator(&h.services.registry, "no_forbidden", |content| {
        if content.contains("forbidden") {
            (false, "output mentions forbidden".to_string())
        } else {
            (true, String::new())
        }
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: warded
cells:
  - name: emit
    tool: emit
    wards:
      post:
        - validator: no_forbidden
          mode: blocking
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
    assert!(failure.reason.contains("forbidden"));
    assert!(failure.partial_output.is_some());
}

#[tokio::test]
async fn advisory_ward_failure_never_blocks() {
    let h = harness(ScriptedChat::constant("unused"));
    register_json_tool(&h.services.registry, "emit", |_| {
        Ok(json!({"text": "whatever"}))
    });
    register_content_validator(&h.services.registry, "grumpy", |_| {
        (false, "always unhappy".to_string())
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: advisory
cells:
  - name: emit
    tool: emit
    wards:
      post:
        - validator: grumpy
          mode: advisory
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    assert!(outcome.is_completed(), "advisory wards are observational");
}

#[tokio::test]
async fn retry_turn_ward_injects_instructions_then_blocks_on_exhaustion() {
    // The model never improves; the turn ward retries twice, then blocks.
    let chat = ScriptedChat::new(|_request, _call| ChatResponse {
        content: "too short".to_string(),
        model: "scripted".to_string(),
        ..ChatResponse::default()
    });
    let h = harness(chat);
    register_content_validator(&h.services.registry, "long_enough", |content| {
        if content.len() >= 100 {
            (true, String::new())
        } else {
            (false, "answer is too short".to_string())
        }
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: turn_retry
cells:
  - name: write
    instructions: "Write at length"
    rules:
      max_turns: 6
    wards:
      turn:
        - validator: long_enough
          mode: retry
          max_attempts: 3
          retry_instructions: "Expand the answer substantially."
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Failed {
        session_id,
        failure,
        ..
    } = outcome
    else {
        panic!("expected failure after retry exhaustion");
    };
    assert_eq!(failure.kind, FailureKind::Validation);

    // Three attempts: two retries plus the blocking one.
    assert_eq!(h.chat.call_count(), 3);
    // Retry instructions arrived as user messages.
    let second = &h.chat.requests()[1];
    assert!(second
        .messages
        .iter()
        .any(|m| m.content == "Expand the answer substantially."));

    // Ward verdicts are logged.
    let rows = session_rows(&h.services, &session_id).await;
    let ward_rows = rows
        .iter()
        .filter(|r| r.node_type == NodeType::WardResult)
        .count();
    assert!(ward_rows >= 3);
}

#[tokio::test]
async fn retry_turn_ward_passes_once_the_model_complies() {
    let chat = ScriptedChat::new(|_request, call| ChatResponse {
        content: if call == 0 {
            "short".to_string()
        } else {
            "x".repeat(150)
        },
        model: "scripted".to_string(),
        ..ChatResponse::default()
    });
    let h = harness(chat);
    register_content_validator(&h.services.registry, "long_enough", |content| {
        (content.len() >= 100, "answer is too short".to_string())
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: turn_retry_ok
cells:
  - name: write
    instructions: "Write at length"
    wards:
      turn:
        - validator: long_enough
          mode: retry
          max_attempts: 3
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.chat.call_count(), 2);
}

#[tokio::test]
async fn pre_ward_blocks_before_any_work() {
    let h = harness(ScriptedChat::constant("should never be called"));
    register_content_validator(&h.services.registry, "input_has_doc", |content| {
        // Pre wards see the cascade input as content.
        (content.contains("doc"), "input missing doc".to_string())
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: pre_gate
cells:
  - name: work
    instructions: "Do the work"
    wards:
      pre:
        - validator: input_has_doc
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({"other": 1})).await.unwrap();
    let RunOutcome::Failed { failure, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::Validation);
    assert_eq!(h.chat.call_count(), 0, "pre ward blocked before the LLM ran");
}
