//! Sub-cascade spawning: input maps, context rejection, parent linkage.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{harness, register_json_tool, ScriptedChat};
use rvbbit::cascade::Cascade;
use rvbbit::event_bus::SubscriptionFilter;
use rvbbit::runner::{CascadeRunner, RunOutcome};

const CHILD: &str = r#"
cascade_id: child
inputs_schema:
  doc: the document to process
cells:
  - name: process
    tool: child_tool
    tool_inputs:
      doc: "{{ input.doc }}"
"#;

const PARENT: &str = r#"
cascade_id: parent
cells:
  - name: prepare
    tool: prepare_tool
    sub_cascades:
      - ref: child
        input_map:
          doc: "{{ outputs.prepare.payload }}"
        context_in: false
"#;

#[tokio::test]
async fn sub_cascade_rejects_context_and_links_parent() {
    let h = harness(ScriptedChat::constant("unused"));
    register_json_tool(&h.services.registry, "prepare_tool", |_| {
        Ok(json!({"payload": "the doc"}))
    });
    register_json_tool(&h.services.registry, "child_tool", |args| {
        assert_eq!(args["doc"], json!("the doc"));
        Ok(json!({"processed": true}))
    });
    h.services
        .cascades
        .register(Cascade::from_str(CHILD).unwrap());
    let parent = h
        .services
        .cascades
        .register(Cascade::from_str(PARENT).unwrap());

    // Child lifecycle events fire before the parent finishes its cell.
    let events = h.services.bus.subscribe(
        SubscriptionFilter::default().with_types(["cascade_complete", "cell_complete"]),
    );

    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(parent, json!({})).await.unwrap();
    let RunOutcome::Completed {
        session_id, echo, ..
    } = outcome
    else {
        panic!("expected completion");
    };

    // Child outputs folded back into the parent echo.
    assert_eq!(echo.outputs["child"]["processed"], json!(true));
    assert_eq!(echo.state["sub:child"]["processed"], json!(true));

    // Child session record carries the parent linkage.
    let child_record = list_sessions(&h.analytics)
        .into_iter()
        .find(|r| r.parent_session_id.as_deref() == Some(session_id.as_str()))
        .expect("child session record");
    assert_eq!(child_record.cascade_id, "child");
    assert_eq!(child_record.status, "completed");

    // Event ordering: the child's cascade_complete lands before the
    // parent's final cell_complete.
    let drained = events.drain();
    let child_complete = drained
        .iter()
        .position(|e| {
            e.event_type == "cascade_complete" && e.data["cascade_id"] == json!("child")
        })
        .expect("child cascade_complete event");
    let parent_cell_complete = drained
        .iter()
        .position(|e| {
            e.event_type == "cell_complete"
                && e.session_id == session_id
                && e.data["cell"] == json!("prepare")
        })
        .expect("parent cell_complete event");
    assert!(
        child_complete < parent_cell_complete,
        "child completes before the parent cell does"
    );
}

#[tokio::test]
async fn child_session_has_parent_id_and_empty_history() {
    let h = harness(ScriptedChat::constant("unused"));
    register_json_tool(&h.services.registry, "prepare_tool", |_| {
        Ok(json!({"payload": "the doc"}))
    });
    register_json_tool(&h.services.registry, "child_tool", |args| {
        // context_in: false means the child template scope has no parent
        // history to lean on; only the mapped input arrived.
        assert_eq!(args["doc"], json!("the doc"));
        Ok(json!({"processed": true}))
    });
    h.services
        .cascades
        .register(Cascade::from_str(CHILD).unwrap());
    let parent = h
        .services
        .cascades
        .register(Cascade::from_str(PARENT).unwrap());

    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(parent, json!({})).await.unwrap();
    let RunOutcome::Completed { session_id, .. } = outcome else {
        panic!("expected completion");
    };

    // Find the child session record: the one whose parent_session_id is
    // the parent session.
    let child = list_sessions(&h.analytics)
        .into_iter()
        .find(|r| r.parent_session_id.as_deref() == Some(session_id.as_str()))
        .expect("child session record with parent linkage");
    assert_eq!(child.cascade_id, "child");
    assert_eq!(child.status, "completed");
    assert_eq!(child.invocation_metadata_json["depth"], json!(1));
}

#[tokio::test]
async fn async_cascade_runs_in_an_independent_session() {
    let h = harness(ScriptedChat::constant("unused"));
    register_json_tool(&h.services.registry, "prepare_tool", |_| {
        Ok(json!({"payload": "x"}))
    });
    register_json_tool(&h.services.registry, "child_tool", |_| {
        Ok(json!({"processed": true}))
    });
    h.services
        .cascades
        .register(Cascade::from_str(CHILD).unwrap());
    let parent = h.services.cascades.register(
        Cascade::from_str(
            r#"
cascade_id: parent_async
cells:
  - name: prepare
    tool: prepare_tool
    async_cascades:
      - ref: child
        input_map:
          doc: "{{ outputs.prepare.payload }}"
        trigger: on_end
"#,
        )
        .unwrap(),
    );
    let runner = CascadeRunner::new(Arc::clone(&h.services));
    let outcome = runner.run(parent, json!({})).await.unwrap();
    let RunOutcome::Completed { session_id, echo, .. } = outcome else {
        panic!("expected completion");
    };
    // Fire-and-forget: the parent's echo never folds the async child in.
    assert!(echo.outputs.get("child").is_none());

    // The child completes in its own session shortly after.
    let mut found = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        found = list_sessions(&h.analytics).iter().any(|r| {
            r.parent_session_id.as_deref() == Some(session_id.as_str())
                && r.status == "completed"
        });
        if found {
            break;
        }
    }
    assert!(found, "async child session completed with parent linkage");
}

/// All session records via the harness's concrete store handle.
fn list_sessions(
    analytics: &rvbbit::analytics::InMemoryAnalyticsStore,
) -> Vec<rvbbit::analytics::SessionRecord> {
    analytics.sessions_snapshot()
}
