//! The work-chain engine: lifecycle, step driver, and awaitable resolution.
//!
//! [`ChainHandle`] wraps the mutable chain state behind a mutex and drives it
//! cooperatively: every increment of work (a step, a completion callback, a
//! resume) runs as one task on the chain's [`Runner`], so no two mutations
//! of a chain ever interleave.
//!
//! The suspension protocol is coroutine-free. One `do_step` invocation
//! executes at most one atomic step and yields a [`Continuation`]:
//!
//! - `Continue`: schedule the next step eagerly,
//! - `Wait`: awaitables were registered; suspend until they drain,
//! - `Terminal`: the outline finished or a return directive fired.
//!
//! The runtime re-enters by scheduling the next step on the runner; nothing
//! in the core captures a stack or bakes in an async mechanism.
//!
//! # Lifecycle
//!
//! ```text
//! Created --launch--> Running --do_step--> Running (Continue)
//!                        |                    |
//!                        |                Wait: register callbacks
//!                        |                    v
//!                        |                 Waiting --last resolve--> Running
//!                        v
//!                     Finished / Excepted / Killed
//! ```
//!
//! Errors raised by user steps propagate out of the step driver and end the
//! chain as `Excepted`; completion callbacks never raise into the runtime,
//! they convert failures into the same transition.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::awaitable::{Awaitable, AwaitableAction, AwaitableTarget};
use crate::chain::{StepOutcome, ToContext, WorkChain};
use crate::context::{Context, ContextError, ContextValue};
use crate::nodes::{NodeStore, NodeStoreError, ProcessNode};
use crate::outline::Outline;
use crate::persistence::PersistenceError;
use crate::runner::Runner;
use crate::stepper::{Stepped, Stepper, StepperError};
use crate::types::{ExitCode, Pk, ProcessState};

/// Errors that terminate a chain or reject an operation on it.
#[derive(Debug, Error, Diagnostic)]
pub enum ChainError {
    /// The requested operation is not valid for the chain's current state.
    #[error("invalid operation: {message}")]
    #[diagnostic(
        code(chainweave::process::invalid_operation),
        help("Check the chain's lifecycle state before driving it.")
    )]
    InvalidOperation { message: String },

    /// A completion callback fired but its target could not be loaded.
    #[error("pk<{pk}> could not be resolved to a valid node")]
    #[diagnostic(
        code(chainweave::process::unresolvable_target),
        help("The node store no longer holds a unique record for pk<{pk}>.")
    )]
    UnresolvableTarget {
        pk: Pk,
        #[source]
        source: NodeStoreError,
    },

    /// An internal bookkeeping invariant was broken; not recoverable.
    #[error("invariant violated: {message}")]
    #[diagnostic(code(chainweave::process::invariant))]
    InvariantViolation { message: String },

    /// The stepper failed (user step error, cursor misuse, restore mismatch).
    #[error(transparent)]
    #[diagnostic(code(chainweave::process::stepper))]
    Stepper(#[from] StepperError),

    /// A context binding could not be placed.
    #[error(transparent)]
    #[diagnostic(code(chainweave::process::context))]
    Context(#[from] ContextError),

    /// The node store rejected an operation.
    #[error(transparent)]
    #[diagnostic(code(chainweave::process::store))]
    Store(#[from] NodeStoreError),

    /// A checkpoint could not be produced or reloaded.
    #[error(transparent)]
    #[diagnostic(code(chainweave::process::persistence))]
    Persistence(#[from] PersistenceError),
}

/// What the chain should do after one `do_step` invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum Continuation {
    /// More steps remain and nothing is pending; step again eagerly.
    Continue,
    /// Awaitables were registered; suspend until they drain.
    Wait {
        /// Human-readable suspension reason.
        reason: String,
    },
    /// The chain terminated, optionally with an exit code.
    Terminal(Option<ExitCode>),
}

pub(crate) struct ChainProcess {
    pub(crate) logic: Box<dyn WorkChain>,
    pub(crate) outline: Arc<Outline>,
    pub(crate) ctx: Context,
    pub(crate) stepper: Option<Stepper>,
    pub(crate) awaitables: Vec<Awaitable>,
    pub(crate) state: ProcessState,
    pub(crate) status: Option<String>,
    pub(crate) exit_code: Option<ExitCode>,
    pub(crate) fault: Option<String>,
    pub(crate) pk: Pk,
    pub(crate) step_count: u64,
}

impl ChainProcess {
    /// Execute the next step of the outline and decide how to proceed.
    ///
    /// A new step starts with no pending work of its own, so the awaitable
    /// list is cleared first. Bindings requested by the step repopulate it
    /// through [`Self::to_context`].
    fn do_step(&mut self) -> Result<Continuation, ChainError> {
        self.awaitables.clear();
        self.step_count += 1;

        let stepper = self
            .stepper
            .as_mut()
            .ok_or_else(|| ChainError::InvalidOperation {
                message: "chain has no stepper; it was never launched".to_string(),
            })?;
        let stepped = stepper.step(self.logic.as_mut(), &mut self.ctx)?;

        let mut terminal = None;
        let mut bindings = None;
        match stepped {
            Stepped::Returned(code) => terminal = Some(code),
            Stepped::Finished(outcome) => {
                terminal = Some(match outcome {
                    Some(StepOutcome::ExitCode(code)) if code.is_failure() => Some(code),
                    _ => None,
                });
            }
            Stepped::Incomplete(outcome) => match outcome {
                Some(StepOutcome::ExitCode(code)) if code.is_failure() => {
                    terminal = Some(Some(code));
                }
                Some(StepOutcome::ToContext(requested)) => bindings = Some(requested),
                Some(StepOutcome::Done) | Some(StepOutcome::ExitCode(_)) | None => {}
            },
        }

        if let Some(exit) = terminal {
            return Ok(Continuation::Terminal(exit));
        }
        if let Some(requested) = bindings {
            self.to_context(requested)?;
        }
        if self.awaitables.is_empty() {
            Ok(Continuation::Continue)
        } else {
            Ok(Continuation::Wait {
                reason: "waiting before next step".to_string(),
            })
        }
    }

    /// Register each binding: construct the awaitable, assign its key, and
    /// insert it.
    pub(crate) fn to_context(&mut self, bindings: ToContext) -> Result<(), ChainError> {
        for (key, mut awaitable) in bindings.into_entries() {
            awaitable.key = key;
            self.insert_awaitable(awaitable)?;
        }
        Ok(())
    }

    /// Insert an awaitable that must terminate before the next step runs.
    ///
    /// The awaitable itself is parked in the context as a placeholder at the
    /// slot its resolved value will occupy. Append-mode placeholders are what
    /// preserve insertion order: children may terminate in any order, but
    /// each result replaces its own placeholder in place.
    pub(crate) fn insert_awaitable(&mut self, awaitable: Awaitable) -> Result<(), ChainError> {
        match awaitable.action {
            AwaitableAction::Assign => self
                .ctx
                .set(&awaitable.key, ContextValue::Pending(awaitable.clone()))?,
            AwaitableAction::Append => self
                .ctx
                .push(&awaitable.key, ContextValue::Pending(awaitable.clone()))?,
        }
        debug!(chain = self.pk, awaitable = %awaitable, "awaitable inserted");
        self.awaitables.push(awaitable);
        self.update_status();
        Ok(())
    }

    /// Replace a previously inserted awaitable's placeholder with `value`.
    pub(crate) fn resolve_awaitable(
        &mut self,
        awaitable: &Awaitable,
        value: ContextValue,
    ) -> Result<(), ChainError> {
        let index = self
            .awaitables
            .iter()
            .position(|a| a.pk == awaitable.pk && a.key == awaitable.key)
            .ok_or_else(|| ChainError::InvariantViolation {
                message: format!(
                    "awaitable pk<{}> for ctx.{} is not registered",
                    awaitable.pk, awaitable.key
                ),
            })?;
        let mut resolved = self.awaitables.remove(index);

        match awaitable.action {
            AwaitableAction::Assign => self.ctx.set(&awaitable.key, value)?,
            AwaitableAction::Append => {
                let slot = self.ctx.get_mut(&awaitable.key).ok_or_else(|| {
                    ChainError::InvariantViolation {
                        message: format!(
                            "ctx.{} vanished before awaitable pk<{}> resolved",
                            awaitable.key, awaitable.pk
                        ),
                    }
                })?;
                let ContextValue::List(items) = slot else {
                    return Err(ChainError::InvariantViolation {
                        message: format!(
                            "ctx.{} is not a sequence while resolving awaitable pk<{}>",
                            awaitable.key, awaitable.pk
                        ),
                    });
                };
                // Identity match: still a placeholder, same pk. Never value
                // equality; resolved payloads for distinct children can
                // compare equal.
                let placeholder = items
                    .iter_mut()
                    .find(|item| {
                        matches!(item, ContextValue::Pending(pending) if pending.pk == awaitable.pk)
                    })
                    .ok_or_else(|| ChainError::InvariantViolation {
                        message: format!(
                            "awaitable pk<{}> was not found in ctx.{}",
                            awaitable.pk, awaitable.key
                        ),
                    })?;
                *placeholder = value;
            }
        }

        resolved.resolved = true;
        debug!(chain = self.pk, awaitable = %resolved, "awaitable resolved");
        self.update_status();
        Ok(())
    }

    /// Keep the human-readable status in sync with the pending awaitables.
    fn update_status(&mut self) {
        if self.awaitables.is_empty() {
            self.status = None;
        } else {
            let pks: Vec<String> = self.awaitables.iter().map(|a| a.pk.to_string()).collect();
            self.status = Some(format!("Waiting for child processes: {}", pks.join(", ")));
        }
    }

    /// Store any unstored nodes reachable through the context.
    ///
    /// Called on every state exit that may checkpoint: serialization cannot
    /// represent unstored entities. Failures are logged and swallowed (an
    /// error escaping here would strand the chain between states) and the
    /// checkpoint conversion will reject whatever remained unstored.
    pub(crate) fn on_exiting(&self, store: &dyn NodeStore) {
        for value in self.ctx.values() {
            if let Err(err) = store_reachable_nodes(store, value) {
                error!(
                    chain = self.pk,
                    error = %err,
                    "failed to store context nodes while exiting state"
                );
            }
        }
    }

    fn transition(&mut self, store: &dyn NodeStore, to: ProcessState) {
        self.on_exiting(store);
        debug!(chain = self.pk, from = %self.state, to = %to, "state transition");
        self.state = to;
    }

    fn fail(&mut self, store: &dyn NodeStore, fault: String) {
        error!(chain = self.pk, fault = %fault, "chain excepted");
        self.status = Some(fault.clone());
        self.fault = Some(fault);
        self.transition(store, ProcessState::Excepted);
    }
}

fn store_reachable_nodes(
    store: &dyn NodeStore,
    value: &ContextValue,
) -> Result<(), NodeStoreError> {
    match value {
        ContextValue::Node(node) => {
            if !node.is_stored() {
                store.store(node)?;
            }
            Ok(())
        }
        ContextValue::List(items) => {
            for item in items {
                store_reachable_nodes(store, item)?;
            }
            Ok(())
        }
        ContextValue::Map(entries) => {
            for entry in entries.values() {
                store_reachable_nodes(store, entry)?;
            }
            Ok(())
        }
        ContextValue::Json(_) | ContextValue::Pending(_) => Ok(()),
    }
}

/// Cloneable handle to a work chain.
///
/// The handle is the unit that circulates: it is captured by completion
/// callbacks, cloned into scheduled tasks, and exposed to the host for
/// inspection, checkpointing, and kill requests. All chain state lives
/// behind a single mutex; combined with the runner's serialized task
/// execution this gives the single-writer property every invariant relies
/// on.
#[derive(Clone)]
pub struct ChainHandle {
    inner: Arc<Mutex<ChainProcess>>,
    runner: Arc<dyn Runner>,
    store: Arc<dyn NodeStore>,
}

impl std::fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandle").finish_non_exhaustive()
    }
}

impl ChainHandle {
    /// Create a chain from its logic, storing a process node for it.
    pub fn new(
        logic: Box<dyn WorkChain>,
        runner: Arc<dyn Runner>,
        store: Arc<dyn NodeStore>,
    ) -> Result<Self, ChainError> {
        let node = ProcessNode::new();
        let pk = store.store(&node)?;
        let outline = Arc::new(logic.outline());
        let process = ChainProcess {
            logic,
            outline,
            ctx: Context::new(),
            stepper: None,
            awaitables: Vec::new(),
            state: ProcessState::Created,
            status: None,
            exit_code: None,
            fault: None,
            pk,
            step_count: 0,
        };
        info!(chain = pk, "work chain created");
        Ok(Self {
            inner: Arc::new(Mutex::new(process)),
            runner,
            store,
        })
    }

    pub(crate) fn from_process(
        process: ChainProcess,
        runner: Arc<dyn Runner>,
        store: Arc<dyn NodeStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(process)),
            runner,
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainProcess> {
        self.inner.lock().expect("chain mutex poisoned")
    }

    pub(crate) fn with_process<R>(&self, f: impl FnOnce(&mut ChainProcess) -> R) -> R {
        f(&mut self.lock())
    }

    pub(crate) fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Start execution: create the stepper and schedule the first step.
    #[instrument(skip(self), err)]
    pub fn launch(&self) -> Result<(), ChainError> {
        {
            let mut chain = self.lock();
            if chain.state != ProcessState::Created {
                return Err(ChainError::InvalidOperation {
                    message: format!("cannot launch a chain in state `{}`", chain.state),
                });
            }
            let stepper = Stepper::new(Arc::clone(&chain.outline));
            debug!(chain = chain.pk, position = %stepper, "stepper created");
            chain.stepper = Some(stepper);
            chain.transition(self.store.as_ref(), ProcessState::Running);
        }
        self.schedule_step();
        Ok(())
    }

    /// Transition the chain to `Killed`.
    ///
    /// Pending completion callbacks observe the state when they fire and
    /// refuse to resume. Terminal chains ignore the request.
    pub fn kill(&self) {
        let mut chain = self.lock();
        if chain.state.is_terminal() {
            return;
        }
        warn!(chain = chain.pk, "chain killed");
        chain.status = Some("killed".to_string());
        chain.transition(self.store.as_ref(), ProcessState::Killed);
    }

    fn schedule_step(&self) {
        let handle = self.clone();
        self.runner.call_soon(Box::new(move || handle.step_once()));
    }

    /// One cooperative increment: drive `do_step` and act on its verdict.
    fn step_once(&self) {
        let continuation = {
            let mut chain = self.lock();
            if chain.state != ProcessState::Running {
                debug!(chain = chain.pk, state = %chain.state, "skipping step: chain is not running");
                return;
            }
            match chain.do_step() {
                Ok(continuation) => continuation,
                Err(err) => {
                    let fault = err.to_string();
                    chain.fail(self.store.as_ref(), fault);
                    return;
                }
            }
        };
        match continuation {
            Continuation::Continue => self.schedule_step(),
            Continuation::Wait { reason } => self.enter_wait(&reason),
            Continuation::Terminal(exit) => self.finish(exit),
        }
    }

    fn enter_wait(&self, reason: &str) {
        let awaitables = {
            let mut chain = self.lock();
            chain.transition(self.store.as_ref(), ProcessState::Waiting);
            info!(
                chain = chain.pk,
                reason,
                pending = chain.awaitables.len(),
                "chain waiting"
            );
            chain.awaitables.clone()
        };
        if awaitables.is_empty() {
            // Everything resolved before the transition landed; resume on
            // the next scheduling tick.
            self.schedule_resume();
        } else {
            self.action_awaitables(awaitables);
        }
    }

    /// Schedule a resume on the next scheduling tick.
    pub(crate) fn schedule_resume(&self) {
        let handle = self.clone();
        self.runner.call_soon(Box::new(move || handle.resume()));
    }

    /// Ask the runner for a completion callback per registered awaitable.
    pub(crate) fn action_awaitables(&self, awaitables: Vec<Awaitable>) {
        for awaitable in awaitables {
            match awaitable.target {
                AwaitableTarget::Process => {
                    let handle = self.clone();
                    let pk = awaitable.pk;
                    self.runner.call_on_process_finish(
                        pk,
                        Box::new(move || handle.on_process_finished(awaitable)),
                    );
                }
            }
        }
    }

    /// Completion callback for one awaitable.
    ///
    /// Derives the bound value from the terminal node, resolves the
    /// placeholder, and resumes the chain when the awaitable list drains.
    /// Failures transition the chain instead of raising into the runtime.
    #[instrument(skip(self, awaitable), fields(pk = awaitable.pk))]
    fn on_process_finished(&self, awaitable: Awaitable) {
        let mut chain = self.lock();
        info!(
            chain = chain.pk,
            pk = awaitable.pk,
            "received completion callback"
        );
        if chain.state != ProcessState::Waiting {
            warn!(
                chain = chain.pk,
                state = %chain.state,
                pk = awaitable.pk,
                "ignoring completion callback: chain is not waiting"
            );
            return;
        }

        let node = match self.store.load(awaitable.pk) {
            Ok(node) => node,
            Err(source) => {
                let fault = ChainError::UnresolvableTarget {
                    pk: awaitable.pk,
                    source,
                }
                .to_string();
                chain.fail(self.store.as_ref(), fault);
                return;
            }
        };

        let value = if awaitable.outputs {
            match self.store.outgoing(awaitable.pk) {
                Ok(links) => {
                    let mut outputs = FxHashMap::default();
                    for (label, target) in links {
                        outputs.insert(label, ContextValue::Node(target));
                    }
                    ContextValue::Map(outputs)
                }
                Err(source) => {
                    let fault = ChainError::UnresolvableTarget {
                        pk: awaitable.pk,
                        source,
                    }
                    .to_string();
                    chain.fail(self.store.as_ref(), fault);
                    return;
                }
            }
        } else {
            ContextValue::Node(node)
        };

        if let Err(err) = chain.resolve_awaitable(&awaitable, value) {
            let fault = err.to_string();
            chain.fail(self.store.as_ref(), fault);
            return;
        }

        if chain.state == ProcessState::Waiting && chain.awaitables.is_empty() {
            info!(chain = chain.pk, "all awaitables resolved; resuming");
            chain.transition(self.store.as_ref(), ProcessState::Running);
            drop(chain);
            self.schedule_step();
        }
    }

    /// Leave `Waiting` and schedule the next step.
    fn resume(&self) {
        let mut chain = self.lock();
        if chain.state != ProcessState::Waiting {
            debug!(chain = chain.pk, state = %chain.state, "refusing resume: chain is not waiting");
            return;
        }
        if !chain.awaitables.is_empty() {
            debug!(
                chain = chain.pk,
                pending = chain.awaitables.len(),
                "refusing resume: awaitables still pending"
            );
            return;
        }
        chain.transition(self.store.as_ref(), ProcessState::Running);
        drop(chain);
        self.schedule_step();
    }

    fn finish(&self, exit: Option<ExitCode>) {
        let mut chain = self.lock();
        info!(chain = chain.pk, exit = ?exit, "chain finished");
        chain.exit_code = exit;
        chain.status = None;
        chain.transition(self.store.as_ref(), ProcessState::Finished);
    }

    /// The pk of this chain's own process node.
    #[must_use]
    pub fn pk(&self) -> Pk {
        self.lock().pk
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    /// Human-readable status (pending awaitables, fault, or nothing).
    #[must_use]
    pub fn status(&self) -> Option<String> {
        self.lock().status.clone()
    }

    /// Exit code of a finished chain, if one was produced.
    #[must_use]
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.lock().exit_code.clone()
    }

    /// Fault description of an excepted chain.
    #[must_use]
    pub fn fault(&self) -> Option<String> {
        self.lock().fault.clone()
    }

    /// Number of `do_step` invocations so far.
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.lock().step_count
    }

    /// Snapshot of the value under a dotted context key.
    #[must_use]
    pub fn ctx_value(&self, path: &str) -> Option<ContextValue> {
        self.lock().ctx.get(path).cloned()
    }

    /// Full snapshot of the context.
    #[must_use]
    pub fn ctx_snapshot(&self) -> Context {
        self.lock().ctx.clone()
    }
}
