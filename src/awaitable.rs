//! Handles to pending external results with bind-site metadata.
//!
//! An [`Awaitable`] records which process a chain is waiting on (`pk`), how
//! the eventual value should land in the context (`action` + `key`), and
//! whether the terminal node itself or its labelled outputs should be bound
//! (`outputs`). While unresolved, the awaitable also serves as the
//! *placeholder* occupying its final context slot, which is what lets APPEND
//! bindings keep insertion order even when children terminate out of order.
//!
//! Identity is the explicit `pk` field: resolution locates placeholders by
//! scanning for a still-pending entry with a matching `pk`, never by value
//! equality of the bound payload.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Pk;

/// Kind of entity an awaitable points at.
///
/// Only child processes are awaitable today; the enum leaves room for other
/// target kinds without a wire-format break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwaitableTarget {
    /// A child process tracked by the node store.
    Process,
}

/// How a resolved value lands in the context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwaitableAction {
    /// Overwrite the value under the key.
    Assign,
    /// Append to the ordered sequence under the key, creating it if missing.
    Append,
}

/// A pending external result and where it should be bound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Awaitable {
    /// Identifier of the target process; stable across checkpoints.
    pub pk: Pk,
    /// Kind of target.
    pub target: AwaitableTarget,
    /// Context binding mode.
    pub action: AwaitableAction,
    /// Dotted context key to bind to; assigned at insertion time.
    pub key: String,
    /// When `true`, bind a mapping of the child's output link labels to
    /// output nodes instead of the terminal node itself.
    pub outputs: bool,
    /// Set once the value has been bound into the context.
    #[serde(default)]
    pub resolved: bool,
}

impl Awaitable {
    /// An assign-mode awaitable for the process `pk`.
    #[must_use]
    pub fn assign(pk: Pk) -> Self {
        Self {
            pk,
            target: AwaitableTarget::Process,
            action: AwaitableAction::Assign,
            key: String::new(),
            outputs: false,
            resolved: false,
        }
    }

    /// An append-mode awaitable for the process `pk`.
    #[must_use]
    pub fn append(pk: Pk) -> Self {
        Self {
            action: AwaitableAction::Append,
            ..Self::assign(pk)
        }
    }

    /// Request the child's labelled outputs instead of its terminal node.
    #[must_use]
    pub fn with_outputs(mut self) -> Self {
        self.outputs = true;
        self
    }
}

// A bare pk is the common case: a freshly launched child handle coerces to
// the Assign/Process defaults.
impl From<Pk> for Awaitable {
    fn from(pk: Pk) -> Self {
        Awaitable::assign(pk)
    }
}

impl fmt::Display for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            AwaitableAction::Assign => "assign",
            AwaitableAction::Append => "append",
        };
        write!(f, "{action} pk<{}> -> ctx.{}", self.pk, self.key)
    }
}
