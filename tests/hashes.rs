//! Species and genus hash stability properties.

mod common;

use serde_json::json;

use rvbbit::cascade::Cascade;
use rvbbit::hashes::{genus_hash, species_hash};

const DOC: &str = r#"
cascade_id: hash_demo
cells:
  - name: gen
    instructions: "Write a poem about {{ input.topic }}"
    candidates:
      factor: 3
  - name: load
    tool: loader
    tool_inputs:
      path: "{{ input.path }}"
"#;

#[test]
fn species_hash_is_stable_across_runs() {
    let a = Cascade::from_str(DOC).unwrap();
    let b = Cascade::from_str(DOC).unwrap();
    let input = json!({"topic": "cats", "path": "/x"});
    assert_eq!(
        species_hash(a.cell("gen").unwrap(), &input),
        species_hash(b.cell("gen").unwrap(), &input)
    );
    assert_eq!(
        species_hash(a.cell("load").unwrap(), &input),
        species_hash(b.cell("load").unwrap(), &input)
    );
}

#[test]
fn different_instructions_change_the_species() {
    let a = Cascade::from_str(DOC).unwrap();
    let changed = DOC.replace("Write a poem", "Write an essay");
    let b = Cascade::from_str(&changed).unwrap();
    let input = json!({"topic": "cats"});
    assert_ne!(
        species_hash(a.cell("gen").unwrap(), &input),
        species_hash(b.cell("gen").unwrap(), &input)
    );
}

#[test]
fn different_rendered_inputs_change_the_species() {
    let cascade = Cascade::from_str(DOC).unwrap();
    let cell = cascade.cell("gen").unwrap();
    assert_ne!(
        species_hash(cell, &json!({"topic": "cats"})),
        species_hash(cell, &json!({"topic": "dogs"}))
    );
}

#[test]
fn model_is_not_part_of_the_species() {
    let with_model = DOC.replace(
        "instructions: \"Write a poem about {{ input.topic }}\"",
        "instructions: \"Write a poem about {{ input.topic }}\"\n    model: some/other-model",
    );
    let a = Cascade::from_str(DOC).unwrap();
    let b = Cascade::from_str(&with_model).unwrap();
    let input = json!({"topic": "cats"});
    assert_eq!(
        species_hash(a.cell("gen").unwrap(), &input),
        species_hash(b.cell("gen").unwrap(), &input)
    );
}

#[test]
fn genus_tracks_structure_and_input_shape() {
    let cascade = Cascade::from_str(DOC).unwrap();
    let a = genus_hash("hash_demo", &cascade.cells, &json!({"topic": "cats"}));
    let b = genus_hash("hash_demo", &cascade.cells, &json!({"topic": "cats"}));
    assert_eq!(a, b);

    // Different cascade id, different genus.
    let c = genus_hash("other_id", &cascade.cells, &json!({"topic": "cats"}));
    assert_ne!(a, c);

    // Different input content, different genus (exact matching).
    let d = genus_hash("hash_demo", &cascade.cells, &json!({"topic": "dogs"}));
    assert_ne!(a, d);

    // Different cell structure, different genus.
    let trimmed: Vec<_> = cascade.cells[..1].to_vec();
    let e = genus_hash("hash_demo", &trimmed, &json!({"topic": "cats"}));
    assert_ne!(a, e);
}

#[test]
fn hashes_are_16_hex_chars() {
    let cascade = Cascade::from_str(DOC).unwrap();
    let species = species_hash(cascade.cell("gen").unwrap(), &json!({}));
    let genus = genus_hash("hash_demo", &cascade.cells, &json!({}));
    for hash in [species, genus] {
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
