//! Round-trip tests for the declarative cascade model: cascades arrive as
//! already-parsed JSON from the embedder and must validate + hash
//! deterministically.

use casc_domain::cascade::Cascade;
use casc_domain::hash::{genus_hash, species_hash};
use serde_json::json;

fn sample_cascade() -> Cascade {
    serde_json::from_value(json!({
        "cascade_id": "report",
        "cells": [
            {
                "name": "load",
                "tool": "sql_data",
                "inputs": {"query": "SELECT 1 AS n"}
            },
            {
                "name": "summarize",
                "instructions": "Result: {{outputs.load.rows | totoon}}",
                "context": [{"name": "load", "include": ["output"], "as_role": "user"}],
                "rules": {"max_turns": 4}
            }
        ]
    }))
    .unwrap()
}

#[test]
fn cascade_file_shape_parses_and_validates() {
    let cascade = sample_cascade();
    cascade.validate().unwrap();
    assert_eq!(cascade.cells.len(), 2);
    assert!(cascade.cells[0].is_deterministic());
    assert_eq!(cascade.cells[1].rules.max_turns, 4);
    assert_eq!(cascade.rules.max_turns, 50);
}

#[test]
fn hashes_stable_across_reparse() {
    let input = json!({"region": "emea"});
    let a = sample_cascade();
    let b = sample_cascade();
    assert_eq!(genus_hash(&a, &input), genus_hash(&b, &input));
    for (ca, cb) in a.cells.iter().zip(&b.cells) {
        assert_eq!(species_hash(ca, &input), species_hash(cb, &input));
    }
}

#[test]
fn genus_hash_tracks_structure_not_model() {
    let input = json!({"region": "emea"});
    let mut modelled = sample_cascade();
    let baseline = genus_hash(&modelled, &input);
    modelled.cells[1].model = Some("other/model".into());
    // Model choice is invisible to both genus and species identity.
    assert_eq!(genus_hash(&modelled, &input), baseline);

    let mut renamed = sample_cascade();
    renamed.cells[1].name = "digest".into();
    assert_ne!(genus_hash(&renamed, &input), baseline);
}
