//! Ephemeral RAG: large content detection, search tool injection, cleanup.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;

use common::{harness, register_json_tool, ScriptedChat};
use rvbbit::cascade::Cascade;
use rvbbit::provider::{ChatResponse, ToolInvocation};
use rvbbit::rag::{ChunkStore, EphemeralConfig, EphemeralRag};
use rvbbit::runner::{CascadeRunner, RunOutcome};

fn sixty_kb() -> String {
    let mut text = String::with_capacity(60_000);
    let mut i = 0;
    while text.len() < 60_000 {
        text.push_str(&format!("Section {i}: operational telemetry line with details.\n"));
        if i % 20 == 19 {
            text.push('\n');
        }
        i += 1;
    }
    text
}

#[tokio::test]
async fn oversized_tool_result_becomes_a_search_tool_and_cleans_up() {
    let big = sixty_kb();
    let chat = ScriptedChat::new(|_request, call| {
        if call == 0 {
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolInvocation {
                    id: "call_1".to_string(),
                    name: "dump_logs".to_string(),
                    arguments: json!({}),
                }],
                model: "scripted".to_string(),
                ..ChatResponse::default()
            }
        } else {
            ChatResponse {
                content: r#"{"summary": "done"}"#.to_string(),
                model: "scripted".to_string(),
                ..ChatResponse::default()
            }
        }
    });
    let h = harness(chat);
    let payload = big.clone();
    register_json_tool(&h.services.registry, "dump_logs", move |_| {
        Ok(Value::String(payload.clone()))
    });
    let cascade = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: ephemeral
cells:
  - name: investigate
    instructions: "Investigate the logs"
    traits: [dump_logs]
"#,
        )
        .unwrap(),
    );

    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(cascade, json!({})).await.unwrap();
    let RunOutcome::Completed { session_id, echo, .. } = outcome else {
        panic!("expected completion");
    };

    // The second turn saw the generated search tool in its schema.
    let requests = h.chat.requests();
    assert!(requests[1]
        .tools
        .iter()
        .any(|t| t.name == "search_dump_logs_result"));

    // The message history carries the placeholder, never the 60 KB blob.
    let tool_message = requests[1]
        .messages
        .iter()
        .find(|m| m.content.contains("[Large content from"))
        .expect("placeholder message present");
    assert!(tool_message.content.contains("search_dump_logs_result(query)"));
    assert!(tool_message.content.len() < 1_000);
    // 60 KB at the default chunk size lands well past 20 sections.
    let sections: usize = tool_message
        .content
        .split(" chars, ")
        .nth(1)
        .and_then(|rest| rest.split(' ').next())
        .and_then(|n| n.parse().ok())
        .expect("placeholder reports section count");
    assert!(sections >= 20, "expected >= 20 sections, got {sections}");
    assert!(echo
        .history
        .iter()
        .all(|m| m.content.len() < 10_000));

    // The scope deleted its chunks on cell exit: nothing remains with an
    // ephemeral rag_id for this session.
    let prefix = format!("ephemeral_{session_id}_investigate_");
    // Probe by recreating the deterministic rag_id from the content hash.
    let content_hash = rvbbit::hashes::short_hash(big.as_bytes());
    let rag_id = format!("{prefix}tool_dump_logs_{content_hash}");
    assert_eq!(h.services.chunks.count_chunks(&rag_id).await.unwrap(), 0);
}

#[tokio::test]
async fn threshold_is_strictly_greater_than() {
    let h = harness(ScriptedChat::constant("unused"));
    let config = EphemeralConfig {
        threshold: 100,
        chunk_size: 40,
        chunk_overlap: 5,
        embed_model: "test-embed".to_string(),
    };

    // Exactly N chars: not indexed.
    let mut scope = EphemeralRag::new(
        "s1",
        "cell",
        config.clone(),
        Arc::clone(&h.services.chunks),
        h.embedder.clone(),
    );
    let exact: String = "x".repeat(100);
    let (kept, tool) = scope
        .process_tool_result("gen", Value::String(exact.clone()))
        .await;
    assert_eq!(kept, Value::String(exact));
    assert!(tool.is_none());

    // N+1 chars: indexed and replaced.
    let over: String = "word ".repeat(21);
    assert!(over.len() > 100);
    let (replaced, tool) = scope
        .process_tool_result("gen", Value::String(over))
        .await;
    let tool_name = tool.expect("over-threshold content indexed");
    assert!(tool_name.starts_with("search_gen"));
    assert!(replaced
        .as_str()
        .unwrap()
        .starts_with("[Large content from 'tool:gen'"));

    let rag_id = scope.replacements()[0].rag_id.clone();
    assert!(rag_id.starts_with("ephemeral_s1_cell_"));
    assert!(h.services.chunks.count_chunks(&rag_id).await.unwrap() > 0);

    // Cleanup removes everything, even mid-scope state.
    scope.close().await;
    assert_eq!(h.services.chunks.count_chunks(&rag_id).await.unwrap(), 0);
}

#[tokio::test]
async fn dicts_are_measured_serialized_and_search_returns_hits() {
    let h = harness(ScriptedChat::constant("unused"));
    let config = EphemeralConfig {
        threshold: 200,
        chunk_size: 80,
        chunk_overlap: 10,
        embed_model: "test-embed".to_string(),
    };
    let mut scope = EphemeralRag::new(
        "s2",
        "cell",
        config,
        Arc::clone(&h.services.chunks),
        h.embedder.clone(),
    );

    let rows: Vec<Value> = (0..40)
        .map(|i| json!({"id": i, "city": format!("metropolis number {i}")}))
        .collect();
    let (replaced, tool) = scope
        .process_tool_result("sql_data", json!({"data": rows}))
        .await;
    let tool_name = tool.expect("large dict indexed");
    assert!(replaced.as_str().unwrap().contains("serialized from dict"));

    let results = scope
        .search(&tool_name, "metropolis number 7", 3, false, None)
        .await
        .unwrap();
    assert!(results.contains("relevant sections"));

    scope.close().await;
}

#[tokio::test]
async fn same_content_is_deduplicated_within_a_scope() {
    let h = harness(ScriptedChat::constant("unused"));
    let config = EphemeralConfig {
        threshold: 50,
        chunk_size: 40,
        chunk_overlap: 5,
        embed_model: "test-embed".to_string(),
    };
    let mut scope = EphemeralRag::new(
        "s3",
        "cell",
        config,
        Arc::clone(&h.services.chunks),
        h.embedder.clone(),
    );
    let content = "repeated payload ".repeat(10);
    let (_, first) = scope
        .process_tool_result("gen", Value::String(content.clone()))
        .await;
    let (_, second) = scope
        .process_tool_result("gen", Value::String(content))
        .await;
    assert_eq!(first, second);
    assert_eq!(scope.replacements().len(), 1);
    scope.close().await;
}
