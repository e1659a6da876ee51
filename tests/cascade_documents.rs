//! Document loading, round-trips, and the cascade library.

mod common;

use pretty_assertions::assert_eq;
use rvbbit::cascade::{Cascade, CascadeLibrary, CellVariant, ContextSource, WardMode};

const FULL_DOC: &str = r#"
cascade_id: kitchen_sink
description: exercises every section
inputs_schema:
  report: the report to process
validators:
  non_empty:
    python: "result = {'valid': bool(content), 'reason': 'empty'}"
token_budget:
  max_total: 6000
  strategy: summarize
  reserve_for_output: 800
candidates:
  factor: 2
  mode: evaluate
auto_context:
  anchors:
    include: [output]
tool_caching: {enabled: true}
research_db: {name: findings}
triggers: [{cron: "0 * * * *"}]
narrator: {voice: dry}
cells:
  - name: ingest
    tool: "sql:queries/ingest.sql"
    tool_inputs:
      source: "{{ input.report }}"
    timeout: 2m
    retry:
      max_attempts: 3
      backoff: exponential
    handoffs: [analyze]
  - name: analyze
    instructions: "Analyze {{ outputs.ingest.data }}"
    traits: [search_web]
    rules:
      max_turns: 5
      loop_until: non_empty
    wards:
      post:
        - validator: non_empty
          mode: retry
          max_attempts: 2
    context:
      from:
        - ingest
        - {cell: ingest, include: [state], as_role: system}
    callouts:
      label: "analysis of {{ input.report }}"
    handoffs: [fanout, publish]
    routing:
      deep: fanout
      default: publish
  - name: fanout
    for_each_row:
      query: "SELECT * FROM findings"
      tool: sql_data
      tool_inputs:
        query: "SELECT {{ row.id }}"
    handoffs: [publish]
  - name: publish
    htmx: "<div>{{ outputs.analyze.content }}</div>"
"#;

#[test]
fn full_document_round_trips_equal() {
    let cascade = Cascade::from_str(FULL_DOC).unwrap();
    assert_eq!(cascade.cells.len(), 4);
    assert!(matches!(
        cascade.cell("ingest").unwrap().variant,
        CellVariant::Deterministic(_)
    ));
    assert!(matches!(
        cascade.cell("analyze").unwrap().variant,
        CellVariant::Llm(_)
    ));
    assert!(matches!(
        cascade.cell("fanout").unwrap().variant,
        CellVariant::ForEachRow(_)
    ));
    assert!(matches!(
        cascade.cell("publish").unwrap().variant,
        CellVariant::Screen(_)
    ));

    let yaml = cascade.to_yaml().unwrap();
    let reloaded = Cascade::from_str(&yaml).unwrap();
    assert_eq!(cascade, reloaded);

    // External-collaborator sections survive the round trip untouched.
    assert_eq!(reloaded.triggers, cascade.triggers);
    assert_eq!(reloaded.narrator, cascade.narrator);
    assert_eq!(reloaded.research_db, cascade.research_db);
}

#[test]
fn parsed_details_land_in_typed_config() {
    let cascade = Cascade::from_str(FULL_DOC).unwrap();
    let analyze = cascade.cell("analyze").unwrap();
    let wards = analyze.wards.as_ref().unwrap();
    assert_eq!(wards.post[0].mode, WardMode::Retry);
    assert_eq!(wards.post[0].max_attempts, 2);

    let context = analyze.context.as_ref().unwrap();
    let from = context.from.as_ref().unwrap();
    assert!(matches!(&from[0], ContextSource::Cell(name) if name == "ingest"));
    assert!(matches!(&from[1], ContextSource::Spec(spec) if spec.as_role.as_deref() == Some("system")));

    let budget = cascade.token_budget.as_ref().unwrap();
    assert_eq!(budget.max_total, 6000);
    assert_eq!(budget.reserve_for_output, 800);

    assert!(cascade.validators.contains_key("non_empty"));
}

#[test]
fn library_resolves_registered_and_disk_refs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("on_disk.yaml"),
        "cascade_id: on_disk\ncells:\n  - name: a\n    htmx: \"<div/>\"\n",
    )
    .unwrap();

    let library = CascadeLibrary::with_root(dir.path());
    library.register(
        Cascade::from_str("cascade_id: in_memory\ncells:\n  - name: a\n    htmx: \"<div/>\"\n")
            .unwrap(),
    );

    assert!(library.get("in_memory").is_ok());
    assert!(library.get("on_disk").is_ok());
    assert!(library.get("nowhere").is_err());
    assert!(library.contains("on_disk"));
}
