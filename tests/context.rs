use chainweave::awaitable::Awaitable;
use chainweave::context::{Context, ContextError, ContextValue};
use chainweave::nodes::ProcessNode;
use serde_json::json;

#[test]
fn set_and_get_roundtrip() {
    let mut ctx = Context::new();
    ctx.set("answer", json!(42).into()).unwrap();
    assert_eq!(
        ctx.get("answer").and_then(ContextValue::as_json),
        Some(&json!(42))
    );
    assert_eq!(ctx.len(), 1);
}

#[test]
fn dotted_paths_create_intermediate_maps() {
    let mut ctx = Context::new();
    ctx.set("relax.scf.cutoff", json!(520).into()).unwrap();
    ctx.set("relax.scf.mixing", json!(0.4).into()).unwrap();

    let relax = ctx.get("relax").and_then(ContextValue::as_map).unwrap();
    assert_eq!(relax.len(), 1);
    assert_eq!(
        ctx.get("relax.scf.cutoff").and_then(ContextValue::as_json),
        Some(&json!(520))
    );
}

#[test]
fn set_overwrites_existing_value() {
    let mut ctx = Context::new();
    ctx.set("k", json!(1).into()).unwrap();
    ctx.set("k", json!(2).into()).unwrap();
    assert_eq!(ctx.get("k").and_then(ContextValue::as_json), Some(&json!(2)));
}

#[test]
fn push_creates_and_extends_sequences() {
    let mut ctx = Context::new();
    ctx.push("jobs", json!("a").into()).unwrap();
    ctx.push("jobs", json!("b").into()).unwrap();
    let jobs = ctx.get("jobs").and_then(ContextValue::as_list).unwrap();
    assert_eq!(jobs.len(), 2);
}

#[test]
fn push_onto_non_sequence_is_rejected() {
    let mut ctx = Context::new();
    ctx.set("jobs", json!(1).into()).unwrap();
    let err = ctx.push("jobs", json!("a").into()).unwrap_err();
    assert!(matches!(err, ContextError::NotASequence { .. }));
}

#[test]
fn writing_through_a_scalar_is_a_path_conflict() {
    let mut ctx = Context::new();
    ctx.set("a", json!(1).into()).unwrap();
    let err = ctx.set("a.b", json!(2).into()).unwrap_err();
    assert!(matches!(err, ContextError::PathConflict { .. }));
}

#[test]
fn empty_segments_are_invalid_keys() {
    let mut ctx = Context::new();
    assert!(matches!(
        ctx.set("", json!(1).into()),
        Err(ContextError::InvalidKey { .. })
    ));
    assert!(matches!(
        ctx.set("a..b", json!(1).into()),
        Err(ContextError::InvalidKey { .. })
    ));
    assert!(ctx.get("a..b").is_none());
}

#[test]
fn remove_takes_the_value_out() {
    let mut ctx = Context::new();
    ctx.set("nested.value", json!(7).into()).unwrap();
    let removed = ctx.remove("nested.value").unwrap();
    assert_eq!(removed.as_json(), Some(&json!(7)));
    assert!(ctx.get("nested.value").is_none());
}

#[test]
fn placeholders_are_pending_values() {
    let mut ctx = Context::new();
    ctx.set("result", Awaitable::assign(7).into()).unwrap();
    let value = ctx.get("result").unwrap();
    assert!(value.is_pending());
    assert_eq!(value.as_pending().map(|a| a.pk), Some(7));
}

#[test]
fn nodes_compare_by_identity() {
    let node = ProcessNode::new();
    let a: ContextValue = node.clone().into();
    let b: ContextValue = node.into();
    assert_eq!(a, b);

    let other: ContextValue = ProcessNode::new().into();
    assert_ne!(a, other);
}
