//! LLM cell turn loops: loop_until, tool calls, decision points.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;

use common::{harness, register_content_validator, register_json_tool, session_rows, ScriptedChat};
use rvbbit::cascade::Cascade;
use rvbbit::provider::{ChatResponse, ToolInvocation};
use rvbbit::runner::{CascadeRunner, FailureKind, RunOutcome};
use rvbbit::types::NodeType;

const LOOP_UNTIL_DOC: &str = r#"
cascade_id: answer_42
cells:
  - name: solve
    instructions: "Output a JSON with key 'answer' equal to 42"
    rules:
      max_turns: 3
      loop_until: answer_is_42
"#;

fn register_answer_validator(services: &rvbbit::runner::Services) {
    register_content_validator(&services.registry, "answer_is_42", |content| {
        let parsed: Value = serde_json::from_str(content).unwrap_or(Value::Null);
        if parsed.get("answer").and_then(Value::as_i64) == Some(42) {
            (true, String::new())
        } else {
            (false, "bad".to_string())
        }
    });
}

#[tokio::test]
async fn loop_until_passes_on_a_later_turn() {
    // Turn 1 answers wrong, turn 2 answers right.
    let chat = ScriptedChat::new(|_request, call| ChatResponse {
        content: if call == 0 {
            r#"{"answer": 7}"#.to_string()
        } else {
            r#"{"answer": 42}"#.to_string()
        },
        model: "scripted".to_string(),
        ..ChatResponse::default()
    });
    let h = harness(chat);
    register_answer_validator(&h.services);
    let cascade = h
        .services
        .cascades
        .register(Cascade::from_str(LOOP_UNTIL_DOC).unwrap());

    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Completed {
        session_id, output, ..
    } = outcome
    else {
        panic!("expected completion");
    };
    assert_eq!(output["answer"], json!(42));

    let rows = session_rows(&h.services, &session_id).await;
    let agent_rows = rows
        .iter()
        .filter(|r| r.node_type == NodeType::Agent)
        .count();
    assert_eq!(agent_rows, 2);
    // The failure reason was injected between attempts.
    assert_eq!(h.chat.requests()[1].messages.last().unwrap().content, "bad");
}

#[tokio::test]
async fn loop_until_exhaustion_fails_with_at_most_three_agent_rows() {
    let chat = ScriptedChat::constant(r#"{"answer": 7}"#);
    let h = harness(chat);
    register_answer_validator(&h.services);
    let cascade = h
        .services
        .cascades
        .register(Cascade::from_str(LOOP_UNTIL_DOC).unwrap());

    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Failed {
        session_id,
        failure,
        ..
    } = outcome
    else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::Validation);
    assert!(failure.reason.contains("loop_until_exhausted"));
    assert!(failure.partial_output.is_some());

    let rows = session_rows(&h.services, &session_id).await;
    let agent_rows = rows
        .iter()
        .filter(|r| r.node_type == NodeType::Agent)
        .count();
    assert_eq!(agent_rows, 3);
}

#[tokio::test]
async fn inline_python_loop_until_routes_through_interpreter_tool() {
    // An in-process python_data stand-in parses the content and checks the
    // answer, proving the inline block resolved to the interpreter tool
    // with the code under `code`.
    let chat = ScriptedChat::constant(r#"{"answer": 42}"#);
    let h = harness(chat);
    h.services.registry.register_fn(
        "python_data",
        "in-process interpreter stand-in",
        json!({"type": "object"}),
        rvbbit::tools::ToolKind::Function,
        |args: Value| async move {
            assert!(args["code"].as_str().unwrap().contains("json.loads"));
            let content = args["content"].as_str().unwrap_or_default();
            let parsed: Value = serde_json::from_str(content).unwrap_or(Value::Null);
            Ok(json!({
                "valid": parsed.get("answer").and_then(Value::as_i64) == Some(42),
                "reason": "bad",
            }))
        },
    );
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: inline_loop
cells:
  - name: solve
    instructions: "Output a JSON with key 'answer' equal to 42"
    rules:
      max_turns: 3
      loop_until:
        python: "import json; r = json.loads(content); result = {'valid': r.get('answer') == 42, 'reason': 'bad'}"
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    assert!(outcome.is_completed());
}

#[tokio::test]
async fn tool_calls_execute_and_feed_the_next_turn() {
    let chat = ScriptedChat::new(|_request, call| {
        if call == 0 {
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolInvocation {
                    id: "call_1".to_string(),
                    name: "lookup".to_string(),
                    arguments: json!({"key": "x"}),
                }],
                model: "scripted".to_string(),
                ..ChatResponse::default()
            }
        } else {
            ChatResponse {
                content: r#"{"found": "value-of-x"}"#.to_string(),
                model: "scripted".to_string(),
                ..ChatResponse::default()
            }
        }
    });
    let h = harness(chat);
    register_json_tool(&h.services.registry, "lookup", |args| {
        assert_eq!(args["key"], json!("x"));
        Ok(json!({"value": "value-of-x"}))
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: tools
cells:
  - name: fetch
    instructions: "Look up x"
    traits: [lookup]
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Completed { session_id, .. } = outcome else {
        panic!("expected completion");
    };

    let rows = session_rows(&h.services, &session_id).await;
    assert!(rows.iter().any(|r| r.node_type == NodeType::ToolCall));
    assert!(rows.iter().any(|r| r.node_type == NodeType::ToolResult));
    // The second request carried the tool result back to the model.
    let second = &h.chat.requests()[1];
    assert!(second
        .messages
        .iter()
        .any(|m| m.content.contains("value-of-x")));
    // The declared trait was exposed in the schema.
    assert!(h.chat.requests()[0].tools.iter().any(|t| t.name == "lookup"));
}

#[tokio::test]
async fn decision_block_suspends_and_resumes_through_routing() {
    let chat = ScriptedChat::new(|_request, call| ChatResponse {
        content: if call == 0 {
            "Analysis done.\n<decision>{\"question\": \"Ship it?\", \"options\": [{\"id\": \"ship\", \"label\": \"Ship\"}, {\"id\": \"hold\", \"label\": \"Hold\"}]}</decision>".to_string()
        } else {
            r#"{"handled": "followup"}"#.to_string()
        },
        model: "scripted".to_string(),
        ..ChatResponse::default()
    });
    let h = harness(chat);
    register_json_tool(&h.services.registry, "ship_tool", |_| {
        Ok(json!({"shipped": true}))
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: decisions
cells:
  - name: analyze
    instructions: "Analyze and decide"
    decision_points:
      routing:
        ship: shipping
        hold: fail
  - name: shipping
    tool: ship_tool
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner
        .run(Arc::clone(&cascade), json!({}))
        .await
        .unwrap();
    let RunOutcome::Suspended {
        resume_token,
        checkpoint,
        ..
    } = outcome
    else {
        panic!("expected suspension");
    };
    assert_eq!(checkpoint.payload["question"], json!("Ship it?"));

    let outcome = runner
        .resume(&resume_token, json!({"option_id": "ship"}))
        .await
        .unwrap();
    let RunOutcome::Completed { output, echo, .. } = outcome else {
        panic!("expected completion after resume");
    };
    assert_eq!(output["shipped"], json!(true));
    assert!(echo.completed_cells().contains(&"shipping"));
}

#[tokio::test]
async fn suspended_cell_appends_no_lineage_until_resumed() {
    let chat = ScriptedChat::constant(
        "<decision>{\"question\": \"Q?\", \"options\": [{\"id\": \"a\", \"label\": \"A\"}]}</decision>",
    );
    let h = harness(chat);
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: pending
cells:
  - name: ask
    instructions: "Ask"
    decision_points:
      routing:
        a: continue
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(Arc::clone(&cascade), json!({})).await.unwrap();
    let RunOutcome::Suspended { resume_token, .. } = outcome else {
        panic!("expected suspension");
    };

    let outcome = runner
        .resume(&resume_token, json!({"option_id": "a"}))
        .await
        .unwrap();
    let RunOutcome::Completed { echo, .. } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(echo.lineage.len(), 1);
    assert_eq!(echo.lineage[0].cell, "ask");
}
