//! Declarative step trees defining a work chain's control flow.
//!
//! An [`Outline`] is an immutable tagged-variant tree, not a chain of
//! function objects: atomic steps and predicates are referenced *by name*
//! and dispatched through the [`WorkChain`](crate::chain::WorkChain) trait.
//! Keeping the outline as data is what lets the stepper serialize its cursor
//! as a path through the tree rather than a captured continuation.
//!
//! Outlines are built once, when the chain type is defined, with the DSL
//! constructors in this module:
//!
//! ```rust
//! use chainweave::outline::{Outline, step, if_, while_, return_with};
//! use chainweave::types::ExitCode;
//!
//! let outline = Outline::sequence(vec![
//!     step("setup"),
//!     if_("needs_relax", vec![step("relax")]).else_(vec![step("reuse_geometry")]),
//!     while_("not_converged", vec![
//!         step("run_batch"),
//!         step("inspect_batch"),
//!     ]),
//!     if_("exhausted_restarts", vec![return_with(ExitCode::new(410))]),
//!     step("finalize"),
//! ]);
//! assert_eq!(outline.len(), 5);
//! ```

use crate::types::ExitCode;

/// A node in the declarative step tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Outline {
    /// An atomic step: a named callable on the work chain.
    Step {
        /// Step name, dispatched through `WorkChain::execute_step`.
        name: String,
    },
    /// An ordered list of child nodes.
    Sequence {
        /// Children, walked in order.
        children: Vec<Outline>,
    },
    /// A two-way branch on a named predicate.
    ///
    /// The predicate is evaluated exactly once on entry; only the recorded
    /// branch is walked. An empty `else_branch` means the conditional is
    /// skipped entirely when the predicate is false.
    Conditional {
        /// Predicate name, dispatched through `WorkChain::evaluate_predicate`.
        predicate: String,
        /// Children walked when the predicate is true.
        then_branch: Vec<Outline>,
        /// Children walked when the predicate is false.
        else_branch: Vec<Outline>,
    },
    /// A predicate-guarded loop.
    ///
    /// The predicate is re-evaluated before every iteration; the engine
    /// enforces no iteration bound.
    Loop {
        /// Predicate name, dispatched through `WorkChain::evaluate_predicate`.
        predicate: String,
        /// Loop body.
        body: Vec<Outline>,
    },
    /// Terminate the chain early with an optional exit code.
    Return {
        /// Exit code surfaced as the chain's terminal result.
        exit_code: Option<ExitCode>,
    },
}

impl Outline {
    /// An ordered sequence of child nodes.
    #[must_use]
    pub fn sequence(children: Vec<Outline>) -> Self {
        Self::Sequence { children }
    }

    /// Number of direct children (1 for leaves).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Sequence { children } => children.len(),
            _ => 1,
        }
    }

    /// Returns `true` for an empty sequence.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Sequence { children } if children.is_empty())
    }

    /// Attach an else branch to a conditional built with [`if_`].
    ///
    /// # Panics
    ///
    /// Panics when called on anything other than a conditional, or when the
    /// conditional already has an else branch. Outlines are assembled at
    /// definition time, so builder misuse is a programming error surfaced
    /// immediately.
    #[must_use]
    pub fn else_(self, children: Vec<Outline>) -> Self {
        match self {
            Self::Conditional {
                predicate,
                then_branch,
                else_branch,
            } => {
                assert!(
                    else_branch.is_empty(),
                    "conditional on `{predicate}` already has an else branch"
                );
                Self::Conditional {
                    predicate,
                    then_branch,
                    else_branch: children,
                }
            }
            other => panic!("else_ requires a conditional, got {other:?}"),
        }
    }
}

/// An atomic step executing the named callable on the work chain.
#[must_use]
pub fn step(name: impl Into<String>) -> Outline {
    Outline::Step { name: name.into() }
}

/// A conditional walking `then` when the named predicate holds.
///
/// Chain [`Outline::else_`] to attach the alternative branch.
#[must_use]
pub fn if_(predicate: impl Into<String>, then: Vec<Outline>) -> Outline {
    Outline::Conditional {
        predicate: predicate.into(),
        then_branch: then,
        else_branch: Vec::new(),
    }
}

/// A loop running `body` while the named predicate holds.
#[must_use]
pub fn while_(predicate: impl Into<String>, body: Vec<Outline>) -> Outline {
    Outline::Loop {
        predicate: predicate.into(),
        body,
    }
}

/// Terminate the chain with a clean (no exit code) result.
#[must_use]
pub fn return_() -> Outline {
    Outline::Return { exit_code: None }
}

/// Terminate the chain with the given exit code.
#[must_use]
pub fn return_with(exit_code: ExitCode) -> Outline {
    Outline::Return {
        exit_code: Some(exit_code),
    }
}
