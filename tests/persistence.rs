mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chainweave::chain::{StepError, StepOutcome, WorkChain};
use chainweave::context::{Context, ContextValue};
use chainweave::nodes::{InMemoryNodeStore, NodeRef, NodeStore, NodeStoreError, ProcessNode};
use chainweave::outline::{step, Outline};
use chainweave::persistence::{
    ChainCheckpoint, Checkpointer, InMemoryCheckpointer, PersistedValue, PersistenceError,
};
use chainweave::process::{ChainError, ChainHandle};
use chainweave::runner::LocalRunner;
use chainweave::stepper::StepperError;
use chainweave::types::{Pk, ProcessState};
use common::{seed_child, test_env, AssignChain};
use serde_json::json;

#[test]
fn checkpoint_mid_wait_then_restore() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[("x", json!(42))]);
    let (logic, _observed) = AssignChain::new(child);

    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();
    assert_eq!(chain.state(), ProcessState::Waiting);

    let checkpoint = chain.checkpoint().unwrap();
    assert_eq!(checkpoint.state, ProcessState::Waiting);
    assert_eq!(checkpoint.awaitables.len(), 1);
    assert!(checkpoint.stepper_state.is_some());
    drop(chain);
    drop(runner);

    // A fresh host: new runner, same store, same checkpoint.
    let host = Arc::new(LocalRunner::new());
    let (logic, observed) = AssignChain::new(child);
    let restored =
        ChainHandle::restore(&checkpoint, Box::new(logic), host.clone(), store.clone()).unwrap();
    assert_eq!(restored.state(), ProcessState::Waiting);
    assert!(restored.ctx_value("result").unwrap().is_pending());

    host.notify_process_finished(child);
    host.run_until_idle();

    assert_eq!(restored.state(), ProcessState::Finished);
    assert_eq!(restored.exit_code(), None);
    assert_eq!(*observed.lock().unwrap(), Some(42));
}

#[test]
fn restore_waiting_with_drained_awaitables_resumes() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[("x", json!(42))]);
    let (logic, _) = AssignChain::new(child);
    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();
    assert_eq!(chain.state(), ProcessState::Waiting);

    // Shape the snapshot like one captured between the last resolution and
    // the resume tick: still waiting, list drained, placeholder replaced.
    let mut checkpoint = chain.checkpoint().unwrap();
    checkpoint.awaitables.clear();
    checkpoint.status = None;
    checkpoint
        .context
        .insert("result".to_string(), PersistedValue::Node { pk: child });
    drop(chain);

    let host = Arc::new(LocalRunner::new());
    let (logic, observed) = AssignChain::new(child);
    let restored =
        ChainHandle::restore(&checkpoint, Box::new(logic), host.clone(), store.clone()).unwrap();
    assert_eq!(restored.state(), ProcessState::Waiting);

    // No completion callback exists to wake the chain; the restore itself
    // must have scheduled the resume.
    host.run_until_idle();
    assert_eq!(restored.state(), ProcessState::Finished);
    assert_eq!(restored.exit_code(), None);
    assert_eq!(*observed.lock().unwrap(), Some(42));
}

#[test]
fn restored_context_matches_the_no_crash_path() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[("x", json!(7))]);

    // Path A: no crash.
    let (logic, _) = AssignChain::new(child);
    let direct = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    direct.launch().unwrap();
    runner.run_until_idle();
    runner.notify_process_finished(child);
    runner.run_until_idle();
    assert_eq!(direct.state(), ProcessState::Finished);

    // Path B: checkpoint mid-wait, restore, then resolve.
    let runner_b = Arc::new(LocalRunner::new());
    let (logic, _) = AssignChain::new(child);
    let crashed = ChainHandle::new(Box::new(logic), runner_b.clone(), store.clone()).unwrap();
    crashed.launch().unwrap();
    runner_b.run_until_idle();
    let checkpoint = crashed.checkpoint().unwrap();
    drop(crashed);

    let host = Arc::new(LocalRunner::new());
    let (logic, _) = AssignChain::new(child);
    let restored =
        ChainHandle::restore(&checkpoint, Box::new(logic), host.clone(), store.clone()).unwrap();
    host.notify_process_finished(child);
    host.run_until_idle();
    assert_eq!(restored.state(), ProcessState::Finished);

    assert_eq!(
        direct.ctx_value("result").unwrap(),
        restored.ctx_value("result").unwrap()
    );
}

#[test]
fn restoring_twice_yields_identical_chains() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[("x", json!(1))]);
    let (logic, _) = AssignChain::new(child);
    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();
    let checkpoint = chain.checkpoint().unwrap();

    let host = Arc::new(LocalRunner::new());
    let (first_logic, first_observed) = AssignChain::new(child);
    let (second_logic, second_observed) = AssignChain::new(child);
    let first =
        ChainHandle::restore(&checkpoint, Box::new(first_logic), host.clone(), store.clone())
            .unwrap();
    let second = ChainHandle::restore(
        &checkpoint,
        Box::new(second_logic),
        host.clone(),
        store.clone(),
    )
    .unwrap();
    assert_eq!(first.state(), second.state());
    assert_eq!(first.status(), second.status());

    host.notify_process_finished(child);
    host.run_until_idle();
    assert_eq!(first.state(), ProcessState::Finished);
    assert_eq!(second.state(), ProcessState::Finished);
    assert_eq!(*first_observed.lock().unwrap(), Some(1));
    assert_eq!(*second_observed.lock().unwrap(), Some(1));
}

#[test]
fn checkpoint_survives_a_json_roundtrip() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[("x", json!(3))]);
    let (logic, _) = AssignChain::new(child);
    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();

    let checkpoint = chain.checkpoint().unwrap();
    let json = checkpoint.to_json_string().unwrap();
    let reloaded = ChainCheckpoint::from_json_str(&json).unwrap();

    assert_eq!(reloaded.chain_pk, checkpoint.chain_pk);
    assert_eq!(reloaded.state, checkpoint.state);
    assert_eq!(reloaded.status, checkpoint.status);
    assert_eq!(reloaded.awaitables, checkpoint.awaitables);
    assert_eq!(reloaded.stepper_state, checkpoint.stepper_state);
    assert_eq!(reloaded.step_count, checkpoint.step_count);
}

#[test]
fn unknown_checkpoint_fields_are_tolerated() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[]);
    let (logic, _) = AssignChain::new(child);
    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();

    let json = chain.checkpoint().unwrap().to_json_string().unwrap();
    let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
    value
        .as_object_mut()
        .unwrap()
        .insert("added_in_a_future_version".to_string(), json!({"n": 1}));
    let widened = serde_json::to_string(&value).unwrap();

    let reloaded = ChainCheckpoint::from_json_str(&widened).unwrap();
    assert_eq!(reloaded.chain_pk, chain.pk());
}

#[test]
fn restore_rejects_a_mismatched_outline() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[]);
    let (logic, _) = AssignChain::new(child);
    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();
    let checkpoint = chain.checkpoint().unwrap();

    struct Unrelated;
    impl WorkChain for Unrelated {
        fn outline(&self) -> Outline {
            step("only")
        }
        fn execute_step(
            &mut self,
            _name: &str,
            _ctx: &mut Context,
        ) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Done)
        }
        fn evaluate_predicate(&mut self, name: &str, _ctx: &Context) -> Result<bool, StepError> {
            Err(StepError::UnknownPredicate {
                name: name.to_string(),
            })
        }
    }

    let host = Arc::new(LocalRunner::new());
    let err = ChainHandle::restore(&checkpoint, Box::new(Unrelated), host, store.clone())
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::Stepper(StepperError::CursorMismatch { .. })
    ));
}

#[test]
fn restore_requires_the_chain_node() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[]);
    let (logic, _) = AssignChain::new(child);
    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();
    let checkpoint = chain.checkpoint().unwrap();

    let empty_store = Arc::new(InMemoryNodeStore::new());
    let host = Arc::new(LocalRunner::new());
    let (logic, _) = AssignChain::new(child);
    let err = ChainHandle::restore(&checkpoint, Box::new(logic), host, empty_store).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Persistence(PersistenceError::MissingNode { .. })
    ));
}

/// Produces a fresh (unstored) node into the context.
struct Producer {
    made: Arc<Mutex<Option<NodeRef>>>,
}

impl WorkChain for Producer {
    fn outline(&self) -> Outline {
        Outline::sequence(vec![step("make")])
    }

    fn execute_step(&mut self, _name: &str, ctx: &mut Context) -> Result<StepOutcome, StepError> {
        let node = ProcessNode::new();
        ctx.set("fresh", node.clone().into())
            .map_err(|e| StepError::failed(e.to_string()))?;
        *self.made.lock().unwrap() = Some(node);
        Ok(StepOutcome::Done)
    }

    fn evaluate_predicate(&mut self, name: &str, _ctx: &Context) -> Result<bool, StepError> {
        Err(StepError::UnknownPredicate {
            name: name.to_string(),
        })
    }
}

#[test]
fn exit_time_walk_stores_fresh_context_nodes() {
    let (runner, store) = test_env();
    let made = Arc::new(Mutex::new(None));
    let chain = ChainHandle::new(
        Box::new(Producer { made: made.clone() }),
        runner.clone(),
        store.clone(),
    )
    .unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();
    assert_eq!(chain.state(), ProcessState::Finished);

    // The Running -> Finished transition stored the node on the way out.
    let node = made.lock().unwrap().clone().unwrap();
    assert!(node.is_stored());

    let checkpoint = chain.checkpoint().unwrap();
    assert!(checkpoint.context.contains_key("fresh"));
}

/// Node store whose writes can be switched off, to exercise the best-effort
/// exit-time walk.
struct FlakyStore {
    inner: InMemoryNodeStore,
    fail_stores: AtomicBool,
}

impl NodeStore for FlakyStore {
    fn load(&self, pk: Pk) -> Result<NodeRef, NodeStoreError> {
        self.inner.load(pk)
    }

    fn store(&self, node: &NodeRef) -> Result<Pk, NodeStoreError> {
        if self.fail_stores.load(Ordering::Relaxed) {
            return Err(NodeStoreError::Backend {
                message: "store offline".to_string(),
            });
        }
        self.inner.store(node)
    }

    fn outgoing(&self, pk: Pk) -> Result<Vec<(String, NodeRef)>, NodeStoreError> {
        self.inner.outgoing(pk)
    }
}

#[test]
fn failed_exit_time_store_is_swallowed_but_checkpoint_refuses() {
    common::init_tracing();
    let runner = Arc::new(LocalRunner::new());
    let store = Arc::new(FlakyStore {
        inner: InMemoryNodeStore::new(),
        fail_stores: AtomicBool::new(false),
    });
    let made = Arc::new(Mutex::new(None));
    let chain = ChainHandle::new(
        Box::new(Producer { made: made.clone() }),
        runner.clone(),
        store.clone(),
    )
    .unwrap();

    store.fail_stores.store(true, Ordering::Relaxed);
    chain.launch().unwrap();
    runner.run_until_idle();

    // The chain still finished: the exit-time failure was logged, not raised.
    assert_eq!(chain.state(), ProcessState::Finished);
    let node = made.lock().unwrap().clone().unwrap();
    assert!(!node.is_stored());

    // But the unstored node cannot be captured.
    let err = chain.checkpoint().unwrap_err();
    assert!(matches!(err, PersistenceError::UnstoredNode { .. }));

    // Once the store recovers, checkpointing heals itself.
    store.fail_stores.store(false, Ordering::Relaxed);
    let checkpoint = chain.checkpoint().unwrap();
    assert!(node.is_stored());
    assert!(checkpoint.context.contains_key("fresh"));
}

#[tokio::test]
async fn checkpointer_save_and_load_roundtrip() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[]);
    let (logic, _) = AssignChain::new(child);
    let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
    chain.launch().unwrap();
    runner.run_until_idle();

    let checkpointer = InMemoryCheckpointer::new();
    let checkpoint = chain.checkpoint().unwrap();
    checkpointer.save(checkpoint.clone()).await.unwrap();

    let loaded = checkpointer.load_latest(chain.pk()).await.unwrap().unwrap();
    assert_eq!(loaded.chain_pk, checkpoint.chain_pk);
    assert_eq!(loaded.state, checkpoint.state);
    assert_eq!(loaded.awaitables, checkpoint.awaitables);

    assert!(checkpointer.load_latest(9999).await.unwrap().is_none());
}

#[tokio::test]
async fn checkpointer_lists_known_chains() {
    let (runner, store) = test_env();
    let child = seed_child(&store, &[]);
    let checkpointer = InMemoryCheckpointer::new();

    let mut pks = Vec::new();
    for _ in 0..2 {
        let (logic, _) = AssignChain::new(child);
        let chain = ChainHandle::new(Box::new(logic), runner.clone(), store.clone()).unwrap();
        chain.launch().unwrap();
        runner.run_until_idle();
        checkpointer.save(chain.checkpoint().unwrap()).await.unwrap();
        pks.push(chain.pk());
    }

    let mut listed = checkpointer.list_chains().await.unwrap();
    listed.sort_unstable();
    pks.sort_unstable();
    assert_eq!(listed, pks);
}
