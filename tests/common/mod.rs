#![allow(dead_code)]

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use chainweave::chain::{StepError, StepOutcome, ToContext, WorkChain};
use chainweave::context::{Context, ContextValue};
use chainweave::nodes::{InMemoryNodeStore, NodeStore, ProcessNode};
use chainweave::outline::{step, Outline};
use chainweave::runner::LocalRunner;
use chainweave::types::Pk;

pub type Trace = Arc<Mutex<Vec<String>>>;

pub fn new_trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn trace_of(trace: &Trace) -> Vec<String> {
    trace.lock().unwrap().clone()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn test_env() -> (Arc<LocalRunner>, Arc<InMemoryNodeStore>) {
    init_tracing();
    (Arc::new(LocalRunner::new()), Arc::new(InMemoryNodeStore::new()))
}

/// Store a child process node carrying the given attributes.
pub fn seed_child(store: &InMemoryNodeStore, attrs: &[(&str, Value)]) -> Pk {
    let mut attributes = FxHashMap::default();
    for (key, value) in attrs {
        attributes.insert((*key).to_string(), value.clone());
    }
    let node = ProcessNode::with_attributes(attributes);
    store.store(&node).unwrap()
}

/// Two-step chain: `launch` binds one assign-mode awaitable under
/// `result`, `collect` reads the bound node's `x` attribute.
pub struct AssignChain {
    pub child: Pk,
    pub observed: Arc<Mutex<Option<i64>>>,
}

impl AssignChain {
    pub fn new(child: Pk) -> (Self, Arc<Mutex<Option<i64>>>) {
        let observed = Arc::new(Mutex::new(None));
        (
            Self {
                child,
                observed: observed.clone(),
            },
            observed,
        )
    }
}

impl WorkChain for AssignChain {
    fn outline(&self) -> Outline {
        Outline::sequence(vec![step("launch"), step("collect")])
    }

    fn execute_step(&mut self, name: &str, ctx: &mut Context) -> Result<StepOutcome, StepError> {
        match name {
            "launch" => Ok(StepOutcome::ToContext(
                ToContext::new().with("result", self.child),
            )),
            "collect" => {
                let node = ctx
                    .get("result")
                    .and_then(ContextValue::as_node)
                    .cloned()
                    .ok_or_else(|| StepError::MissingContext {
                        key: "result".to_string(),
                    })?;
                *self.observed.lock().unwrap() = node.attribute("x").and_then(Value::as_i64);
                Ok(StepOutcome::Done)
            }
            other => Err(StepError::UnknownStep {
                name: other.to_string(),
            }),
        }
    }

    fn evaluate_predicate(&mut self, name: &str, _ctx: &Context) -> Result<bool, StepError> {
        Err(StepError::UnknownPredicate {
            name: name.to_string(),
        })
    }
}
