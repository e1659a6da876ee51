//! Inter-cell context selection and token budget behavior.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{harness, register_json_tool, session_rows, ScriptedChat};
use rvbbit::cascade::{BudgetStrategy, Cascade, TokenBudgetConfig};
use rvbbit::context::{apply_token_budget, estimate_total_tokens};
use rvbbit::message::Message;
use rvbbit::runner::{CascadeRunner, RunOutcome};
use rvbbit::types::NodeType;

#[tokio::test]
async fn explicit_context_injects_source_cell_output() {
    let chat = ScriptedChat::constant("summary of the loaded data");
    let h = harness(chat);
    register_json_tool(&h.services.registry, "load", |_| {
        Ok(json!({"data": [10, 20, 30]}))
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: ctx_explicit
cells:
  - name: load
    tool: load
    handoffs: [summarize]
  - name: summarize
    instructions: "Summarize what was loaded"
    context:
      from: [load]
      include_input: false
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Completed { session_id, .. } = outcome else {
        panic!("expected completion");
    };

    // The LLM request carried the load cell's output.
    let request = &h.chat.requests()[0];
    assert!(request
        .messages
        .iter()
        .any(|m| m.content.contains("Output from load") && m.content.contains("[10,20,30]")));

    // context_hashes of the agent row point at previously logged content.
    let rows = session_rows(&h.services, &session_id).await;
    let agent = rows
        .iter()
        .find(|r| r.node_type == NodeType::Agent)
        .unwrap();
    assert!(!agent.context_hashes.is_empty());
    let earlier_hashes: Vec<&str> = rows
        .iter()
        .take_while(|r| r.trace_id != agent.trace_id)
        .map(|r| r.content_hash.as_str())
        .collect();
    for hash in &agent.context_hashes {
        assert!(
            earlier_hashes.contains(&hash.as_str()),
            "context hash {hash} must reference an earlier logged row"
        );
    }
}

#[tokio::test]
async fn include_input_prepends_the_cascade_input() {
    let chat = ScriptedChat::constant("ok");
    let h = harness(chat);
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: ctx_input
cells:
  - name: work
    instructions: "Work on it"
    context:
      from: []
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    runner
        .run(cascade, json!({"topic": "volcanoes"}))
        .await
        .unwrap();
    let request = &h.chat.requests()[0];
    assert!(request
        .messages
        .iter()
        .any(|m| m.has_role(Message::USER) && m.content.contains("volcanoes")));
}

#[tokio::test]
async fn budget_fail_strategy_refuses_oversized_context() {
    let budget = TokenBudgetConfig {
        max_total: 50,
        strategy: BudgetStrategy::Fail,
        reserve_for_output: 10,
        summarizer_model: None,
    };
    let messages = vec![Message::user("x".repeat(800))];
    let err = apply_token_budget(messages, &budget, None).await.unwrap_err();
    assert!(err.to_string().contains("token budget"));
}

#[tokio::test]
async fn budget_sliding_window_keeps_most_recent_within_cap() {
    let budget = TokenBudgetConfig {
        max_total: 60,
        strategy: BudgetStrategy::SlidingWindow,
        reserve_for_output: 0,
        summarizer_model: None,
    };
    let messages: Vec<Message> = (0..10)
        .map(|i| Message::user(format!("message number {i} {}", "pad ".repeat(10))))
        .collect();
    let kept = apply_token_budget(messages, &budget, None).await.unwrap();
    assert!(estimate_total_tokens(&kept) <= 60);
    assert!(kept.last().unwrap().content.contains("message number 9"));
}

#[tokio::test]
async fn budget_prune_oldest_drops_from_the_front() {
    let budget = TokenBudgetConfig {
        max_total: 60,
        strategy: BudgetStrategy::PruneOldest,
        reserve_for_output: 0,
        summarizer_model: None,
    };
    let mut messages = vec![Message::system("keep the system prompt")];
    for i in 0..10 {
        messages.push(Message::user(format!("filler {i} {}", "pad ".repeat(10))));
    }
    let kept = apply_token_budget(messages, &budget, None).await.unwrap();
    assert!(estimate_total_tokens(&kept) <= 60);
    assert!(kept.iter().any(|m| m.has_role(Message::SYSTEM)));
    assert!(kept.iter().any(|m| m.content.contains("filler 9")));
}

#[tokio::test]
async fn budget_summarize_replaces_prefix_with_summary() {
    let chat = ScriptedChat::new(|request, _| {
        let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        assert!(prompt.contains("Summarize this conversation prefix"));
        rvbbit::provider::ChatResponse {
            content: "dense recap of the earlier exchange".to_string(),
            model: "scripted".to_string(),
            ..rvbbit::provider::ChatResponse::default()
        }
    });
    let budget = TokenBudgetConfig {
        max_total: 120,
        strategy: BudgetStrategy::Summarize,
        reserve_for_output: 0,
        summarizer_model: None,
    };
    let messages: Vec<Message> = (0..12)
        .map(|i| Message::user(format!("long exchange {i} {}", "pad ".repeat(12))))
        .collect();
    let chat_client: Arc<dyn rvbbit::provider::ChatClient> = chat;
    let kept = apply_token_budget(messages, &budget, Some((&chat_client, "utility")))
        .await
        .unwrap();
    assert!(kept[0].content.contains("dense recap"));
    assert!(kept.last().unwrap().content.contains("long exchange 11"));
    assert!(estimate_total_tokens(&kept) <= 120);
}

#[tokio::test]
async fn auto_context_anchors_pull_recent_cell_turns() {
    // Two LLM cells; the second anchors on the first.
    let chat = ScriptedChat::new(|_request, call| rvbbit::provider::ChatResponse {
        content: if call == 0 {
            "the plan is to dig a tunnel".to_string()
        } else {
            "executing the tunnel plan".to_string()
        },
        model: "scripted".to_string(),
        ..rvbbit::provider::ChatResponse::default()
    });
    let h = harness(chat);
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: anchored
cells:
  - name: plan
    instructions: "Make a plan"
    handoffs: [execute]
  - name: execute
    instructions: "Execute the plan"
    context:
      include_input: false
      anchors:
        cells: [{cell: plan, last_turns: 1}]
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    assert!(outcome.is_completed());

    let second = &h.chat.requests()[1];
    assert!(second
        .messages
        .iter()
        .any(|m| m.content.contains("dig a tunnel")));
}
