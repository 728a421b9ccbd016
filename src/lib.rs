//! # Chainweave: Resumable Work-Chain Engine
//!
//! Chainweave executes user-defined workflows ("work chains") as stepped
//! state machines whose steps may suspend pending completion of other
//! processes. A chain advances through a declarative outline, parks
//! awaitable placeholders in its mutable context while children run, and
//! resumes with the results bound exactly where their placeholders sat.
//! Execution state (outline position, context, pending awaitables) is
//! fully serializable, so a chain can be checkpointed, the host restarted,
//! and execution resumed without re-running completed steps.
//!
//! ## Core Concepts
//!
//! - **Outline**: declarative step tree (sequence, conditional, loop, early
//!   return) built once, at chain definition
//! - **Stepper**: serializable cursor executing one outline increment per call
//! - **Awaitable**: handle to a pending child result with bind-site metadata
//! - **Context**: per-chain attribute map holding step outputs and
//!   placeholders
//! - **ChainHandle**: the cooperatively scheduled engine around all of it
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chainweave::chain::{StepError, StepOutcome, WorkChain};
//! use chainweave::context::Context;
//! use chainweave::nodes::InMemoryNodeStore;
//! use chainweave::outline::{step, Outline};
//! use chainweave::process::ChainHandle;
//! use chainweave::runner::LocalRunner;
//! use chainweave::types::ProcessState;
//!
//! struct Greet;
//!
//! impl WorkChain for Greet {
//!     fn outline(&self) -> Outline {
//!         Outline::sequence(vec![step("hello")])
//!     }
//!
//!     fn execute_step(
//!         &mut self,
//!         _name: &str,
//!         ctx: &mut Context,
//!     ) -> Result<StepOutcome, StepError> {
//!         ctx.set("greeting", serde_json::json!("hi").into())
//!             .map_err(|e| StepError::failed(e.to_string()))?;
//!         Ok(StepOutcome::Done)
//!     }
//!
//!     fn evaluate_predicate(&mut self, name: &str, _ctx: &Context) -> Result<bool, StepError> {
//!         Err(StepError::UnknownPredicate {
//!             name: name.to_string(),
//!         })
//!     }
//! }
//!
//! let runner = Arc::new(LocalRunner::new());
//! let store = Arc::new(InMemoryNodeStore::new());
//! let chain = ChainHandle::new(Box::new(Greet), runner.clone(), store).unwrap();
//! chain.launch().unwrap();
//! runner.run_until_idle();
//! assert_eq!(chain.state(), ProcessState::Finished);
//! ```
//!
//! ## Suspension Protocol
//!
//! The engine is deliberately coroutine-free. One step-driver invocation
//! returns a tagged continuation (continue eagerly, wait for awaitables, or
//! terminate) and the runtime re-enters by scheduling the next increment on
//! the chain's [`runner::Runner`]. A step that needs child results returns a
//! [`chain::ToContext`] payload; each binding becomes an awaitable in the
//! chain's list *and* a placeholder in the context, which is how append-mode
//! bindings keep insertion order even when children terminate out of order.
//!
//! ## Module Guide
//!
//! - [`outline`] - Declarative step trees and the outline DSL
//! - [`stepper`] - Serializable cursor with save/restore
//! - [`awaitable`] - Pending-result handles and bind actions
//! - [`context`] - Dotted-path attribute map with placeholders
//! - [`chain`] - The `WorkChain` trait and step outcomes
//! - [`process`] - Chain lifecycle, step driver, wait/resume coordination
//! - [`runner`] - The cooperative scheduler seam and `LocalRunner`
//! - [`nodes`] - Process entities and the node store seam
//! - [`persistence`] - Checkpoint shapes and the `Checkpointer` seam
//! - [`types`] - Pks, exit codes, and lifecycle states

pub mod awaitable;
pub mod chain;
pub mod context;
pub mod nodes;
pub mod outline;
pub mod persistence;
pub mod process;
pub mod runner;
pub mod stepper;
pub mod types;
