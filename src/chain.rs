//! The user-facing work chain trait and step outcomes.
//!
//! A work chain is a long-lived logical process defined by an [`Outline`]
//! plus the named steps and predicates the outline references. Implement
//! [`WorkChain`] on the type holding your chain's inputs; the engine drives
//! it through a [`ChainHandle`](crate::process::ChainHandle).
//!
//! # Design principles
//!
//! - **Steps are synchronous.** A step runs to completion on the chain's
//!   executor and must not block on external work; to wait on a child
//!   process it returns a [`ToContext`] payload and the engine suspends the
//!   chain until the bindings resolve.
//! - **Outlines are data.** Steps and predicates are dispatched by name so
//!   the execution cursor stays serializable.
//! - **Errors end the chain.** An `Err` from a step propagates out of the
//!   step driver and terminates the chain as excepted; recoverable
//!   conditions should instead produce an [`ExitCode`] outcome.
//!
//! # Examples
//!
//! ```rust
//! use chainweave::chain::{StepError, StepOutcome, ToContext, WorkChain};
//! use chainweave::context::Context;
//! use chainweave::outline::{Outline, step};
//!
//! struct Tally {
//!     child_pk: u64,
//! }
//!
//! impl WorkChain for Tally {
//!     fn outline(&self) -> Outline {
//!         Outline::sequence(vec![step("launch"), step("collect")])
//!     }
//!
//!     fn execute_step(&mut self, name: &str, _ctx: &mut Context) -> Result<StepOutcome, StepError> {
//!         match name {
//!             "launch" => Ok(StepOutcome::ToContext(
//!                 ToContext::new().with("result", self.child_pk),
//!             )),
//!             "collect" => Ok(StepOutcome::Done),
//!             other => Err(StepError::UnknownStep { name: other.to_string() }),
//!         }
//!     }
//!
//!     fn evaluate_predicate(&mut self, name: &str, _ctx: &Context) -> Result<bool, StepError> {
//!         Err(StepError::UnknownPredicate { name: name.to_string() })
//!     }
//! }
//! ```

use miette::Diagnostic;
use thiserror::Error;

use crate::awaitable::Awaitable;
use crate::context::Context;
use crate::outline::Outline;
use crate::types::ExitCode;

/// User-defined workflow logic: the outline plus its named callables.
pub trait WorkChain: Send {
    /// The declarative step tree for this chain.
    ///
    /// Called once at chain construction; the result must be stable for the
    /// lifetime of the chain (a restored cursor is replayed against it).
    fn outline(&self) -> Outline;

    /// Execute the atomic step `name`.
    fn execute_step(&mut self, name: &str, ctx: &mut Context) -> Result<StepOutcome, StepError>;

    /// Evaluate the predicate `name`.
    ///
    /// Predicates run inside the same step increment as the step they gate
    /// and must not suspend; they may read the live context.
    fn evaluate_predicate(&mut self, name: &str, ctx: &Context) -> Result<bool, StepError>;
}

/// Result of one atomic step.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum StepOutcome {
    /// Nothing to report; the chain continues.
    #[default]
    Done,
    /// Bindings to park in the context as awaitables; the chain suspends
    /// until all of them resolve.
    ToContext(ToContext),
    /// A terminal status. Non-zero status ends the chain cleanly with this
    /// code; zero is ignored and the chain continues.
    ExitCode(ExitCode),
}

/// Ordered `key -> awaitable` bindings requested by a step.
///
/// A step returning this payload is equivalent to registering each binding
/// immediately after the step: every entry becomes an awaitable in the
/// chain's awaitable list and a placeholder in the context under its key.
/// Entry order is preserved; for append-mode awaitables it defines the final
/// order of the bound sequence.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ToContext {
    entries: Vec<(String, Awaitable)>,
}

impl ToContext {
    /// An empty set of bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` (a child pk or a prepared [`Awaitable`]) under `key`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Awaitable>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    /// Returns `true` when no bindings were requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the payload in insertion order.
    pub(crate) fn into_entries(self) -> Vec<(String, Awaitable)> {
        self.entries
    }
}

/// Errors raised by user steps and predicates.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    /// The outline referenced a step the chain does not implement.
    #[error("unknown step: {name}")]
    #[diagnostic(
        code(chainweave::chain::unknown_step),
        help("Every step named in the outline must be handled by `execute_step`.")
    )]
    UnknownStep { name: String },

    /// The outline referenced a predicate the chain does not implement.
    #[error("unknown predicate: {name}")]
    #[diagnostic(
        code(chainweave::chain::unknown_predicate),
        help("Every predicate named in the outline must be handled by `evaluate_predicate`.")
    )]
    UnknownPredicate { name: String },

    /// Expected context data is missing.
    #[error("missing context value: {key}")]
    #[diagnostic(
        code(chainweave::chain::missing_context),
        help("Check that an earlier step bound `{key}` before it is read.")
    )]
    MissingContext { key: String },

    /// JSON serialization/deserialization error inside a step.
    #[error(transparent)]
    #[diagnostic(code(chainweave::chain::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Any other step failure.
    #[error("step failed: {message}")]
    #[diagnostic(code(chainweave::chain::failed))]
    Failed { message: String },
}

impl StepError {
    /// Shorthand for [`StepError::Failed`].
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}
