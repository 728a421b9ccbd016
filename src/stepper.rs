//! Serializable cursor driving a work chain through its outline.
//!
//! A [`Stepper`] walks an [`Outline`] one increment at a time. Each call to
//! [`Stepper::step`] executes *at most one* atomic step's callable: predicate
//! evaluations for conditionals and loops happen inside the same increment
//! (they never suspend), and an increment that only skips an untaken branch
//! executes nothing at all.
//!
//! The cursor records the minimal state needed to resume: per-sequence
//! positions, recorded branch choices, and loop iteration counters. The
//! outline itself is static data shared with the chain, so [`Stepper::save`]
//! captures only the cursor and [`Stepper::restore`] rebinds it to the same
//! outline; a save/restore round-trip is observationally identical to not
//! saving.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::chain::{StepError, StepOutcome, WorkChain};
use crate::context::Context;
use crate::outline::Outline;
use crate::types::ExitCode;

/// Result of one stepper increment.
#[derive(Clone, Debug, PartialEq)]
pub enum Stepped {
    /// More of the outline remains; at most one atomic step ran.
    Incomplete(Option<StepOutcome>),
    /// The outline is exhausted; carries the final step's outcome.
    Finished(Option<StepOutcome>),
    /// A return directive fired, carrying its optional exit code up.
    Returned(Option<ExitCode>),
}

/// Branch recorded by a conditional cursor after its single predicate
/// evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum BranchChoice {
    Then,
    Else,
    /// Predicate decided but the selected branch is empty.
    Skip,
}

/// Position inside one outline node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Cursor {
    Step {
        done: bool,
    },
    Block {
        pos: usize,
        child: Option<Box<Cursor>>,
    },
    Conditional {
        branch: Option<BranchChoice>,
        body: Option<Box<Cursor>>,
    },
    Loop {
        iterations: u64,
        body: Option<Box<Cursor>>,
    },
    Return,
}

fn cursor_for(outline: &Outline) -> Cursor {
    match outline {
        Outline::Step { .. } => Cursor::Step { done: false },
        Outline::Sequence { .. } => Cursor::Block {
            pos: 0,
            child: None,
        },
        Outline::Conditional { .. } => Cursor::Conditional {
            branch: None,
            body: None,
        },
        Outline::Loop { .. } => Cursor::Loop {
            iterations: 0,
            body: None,
        },
        Outline::Return { .. } => Cursor::Return,
    }
}

fn block_cursor() -> Box<Cursor> {
    Box::new(Cursor::Block {
        pos: 0,
        child: None,
    })
}

/// Advance a block of children by one increment.
fn step_block(
    children: &[Outline],
    cursor: &mut Cursor,
    chain: &mut dyn WorkChain,
    ctx: &mut Context,
) -> Result<Stepped, StepperError> {
    let Cursor::Block { pos, child } = cursor else {
        return Err(StepperError::CursorMismatch {
            detail: format!("expected a block cursor, found {cursor:?}"),
        });
    };
    if *pos >= children.len() {
        return Ok(Stepped::Finished(None));
    }
    let node = &children[*pos];
    let node_cursor = child.get_or_insert_with(|| Box::new(cursor_for(node)));
    match step_cursor(node, node_cursor, chain, ctx)? {
        Stepped::Returned(code) => Ok(Stepped::Returned(code)),
        Stepped::Incomplete(outcome) => Ok(Stepped::Incomplete(outcome)),
        Stepped::Finished(outcome) => {
            *child = None;
            *pos += 1;
            if *pos >= children.len() {
                Ok(Stepped::Finished(outcome))
            } else {
                Ok(Stepped::Incomplete(outcome))
            }
        }
    }
}

fn step_cursor(
    outline: &Outline,
    cursor: &mut Cursor,
    chain: &mut dyn WorkChain,
    ctx: &mut Context,
) -> Result<Stepped, StepperError> {
    match (outline, cursor) {
        (Outline::Step { name }, Cursor::Step { done }) => {
            if *done {
                return Ok(Stepped::Finished(None));
            }
            let outcome = chain.execute_step(name, ctx)?;
            *done = true;
            Ok(Stepped::Finished(Some(outcome)))
        }

        (Outline::Sequence { children }, cursor @ Cursor::Block { .. }) => {
            step_block(children, cursor, chain, ctx)
        }

        (
            Outline::Conditional {
                predicate,
                then_branch,
                else_branch,
            },
            Cursor::Conditional { branch, body },
        ) => {
            if branch.is_none() {
                let taken = chain.evaluate_predicate(predicate, ctx)?;
                let selected = if taken { then_branch } else { else_branch };
                if selected.is_empty() {
                    *branch = Some(BranchChoice::Skip);
                } else {
                    *branch = Some(if taken {
                        BranchChoice::Then
                    } else {
                        BranchChoice::Else
                    });
                    *body = Some(block_cursor());
                }
            }
            match (*branch).expect("branch recorded above") {
                BranchChoice::Skip => Ok(Stepped::Finished(None)),
                choice => {
                    let selected = match choice {
                        BranchChoice::Then => then_branch,
                        BranchChoice::Else => else_branch,
                        BranchChoice::Skip => unreachable!(),
                    };
                    let body_cursor = body.get_or_insert_with(block_cursor);
                    step_block(selected, body_cursor, chain, ctx)
                }
            }
        }

        (
            Outline::Loop {
                predicate,
                body: body_outline,
            },
            Cursor::Loop { iterations, body },
        ) => {
            if body.is_none() {
                // Re-evaluated on every iteration; predicates may read the
                // live context, so the result is never cached.
                if !chain.evaluate_predicate(predicate, ctx)? {
                    return Ok(Stepped::Finished(None));
                }
                *iterations += 1;
                *body = Some(block_cursor());
            }
            let body_cursor = body.as_mut().expect("loop body cursor set above");
            match step_block(body_outline, body_cursor, chain, ctx)? {
                Stepped::Returned(code) => Ok(Stepped::Returned(code)),
                Stepped::Incomplete(outcome) => Ok(Stepped::Incomplete(outcome)),
                Stepped::Finished(outcome) => {
                    *body = None;
                    Ok(Stepped::Incomplete(outcome))
                }
            }
        }

        (Outline::Return { exit_code }, Cursor::Return) => {
            Ok(Stepped::Returned(exit_code.clone()))
        }

        (outline, cursor) => Err(StepperError::CursorMismatch {
            detail: format!("cursor {cursor:?} does not fit outline node {outline:?}"),
        }),
    }
}

/// Check that a restored cursor structurally fits the outline.
fn cursor_matches(outline: &Outline, cursor: &Cursor) -> Result<(), String> {
    fn block_matches(children: &[Outline], cursor: &Cursor) -> Result<(), String> {
        let Cursor::Block { pos, child } = cursor else {
            return Err(format!("expected a block cursor, found {cursor:?}"));
        };
        if *pos > children.len() {
            return Err(format!(
                "block position {pos} exceeds {} children",
                children.len()
            ));
        }
        if let Some(child) = child {
            let node = children
                .get(*pos)
                .ok_or_else(|| format!("child cursor at exhausted position {pos}"))?;
            cursor_matches(node, child)?;
        }
        Ok(())
    }

    match (outline, cursor) {
        (Outline::Step { .. }, Cursor::Step { .. }) => Ok(()),
        (Outline::Sequence { children }, cursor @ Cursor::Block { .. }) => {
            block_matches(children, cursor)
        }
        (
            Outline::Conditional {
                then_branch,
                else_branch,
                ..
            },
            Cursor::Conditional { branch, body },
        ) => match (branch, body) {
            (None, None) | (Some(BranchChoice::Skip), None) => Ok(()),
            (Some(BranchChoice::Then), Some(body)) => block_matches(then_branch, body),
            (Some(BranchChoice::Else), Some(body)) => block_matches(else_branch, body),
            (Some(_), None) => Ok(()),
            (None, Some(_)) => Err("conditional body without a recorded branch".to_string()),
            (Some(BranchChoice::Skip), Some(_)) => {
                Err("skipped conditional carries a body cursor".to_string())
            }
        },
        (Outline::Loop { body: outline, .. }, Cursor::Loop { body, .. }) => match body {
            Some(body) => block_matches(outline, body),
            None => Ok(()),
        },
        (Outline::Return { .. }, Cursor::Return) => Ok(()),
        (outline, cursor) => Err(format!(
            "cursor {cursor:?} does not fit outline node {outline:?}"
        )),
    }
}

fn describe(outline: &Outline, cursor: &Cursor, out: &mut String) {
    fn describe_block(children: &[Outline], cursor: &Cursor, out: &mut String) {
        if let Cursor::Block { pos, child } = cursor {
            out.push_str(&format!("{}/{}", pos, children.len()));
            if let (Some(child), Some(node)) = (child, children.get(*pos)) {
                out.push(':');
                describe(node, child, out);
            }
        }
    }

    match (outline, cursor) {
        (Outline::Step { name }, Cursor::Step { done }) => {
            out.push_str(name);
            if *done {
                out.push_str("(done)");
            }
        }
        (Outline::Sequence { children }, cursor) => describe_block(children, cursor, out),
        (
            Outline::Conditional {
                predicate,
                then_branch,
                else_branch,
                ..
            },
            Cursor::Conditional { branch, body },
        ) => {
            out.push_str(&format!("if({predicate})"));
            match (branch, body) {
                (Some(BranchChoice::Then), Some(body)) => {
                    out.push(':');
                    describe_block(then_branch, body, out);
                }
                (Some(BranchChoice::Else), Some(body)) => {
                    out.push_str(":else:");
                    describe_block(else_branch, body, out);
                }
                _ => {}
            }
        }
        (Outline::Loop { predicate, body }, Cursor::Loop { iterations, body: cursor }) => {
            out.push_str(&format!("while({predicate})[{iterations}]"));
            if let Some(cursor) = cursor {
                out.push(':');
                describe_block(body, cursor, out);
            }
        }
        (Outline::Return { .. }, Cursor::Return) => out.push_str("return"),
        _ => out.push('?'),
    }
}

/// Opaque serializable capture of a stepper's full cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedStepper {
    cursor: Cursor,
    #[serde(default)]
    finished: bool,
}

/// Errors from driving or restoring a stepper.
#[derive(Debug, Error, Diagnostic)]
pub enum StepperError {
    /// `step()` was called after the outline was exhausted.
    #[error("stepper already finished")]
    #[diagnostic(
        code(chainweave::stepper::already_finished),
        help("A finished stepper cannot be driven further; the chain should have terminated.")
    )]
    AlreadyFinished,

    /// A saved cursor does not fit the outline it was restored against.
    #[error("saved cursor does not fit the outline: {detail}")]
    #[diagnostic(
        code(chainweave::stepper::cursor_mismatch),
        help("Restore a cursor only against the exact outline it was saved from.")
    )]
    CursorMismatch { detail: String },

    /// A step or predicate callable failed.
    #[error(transparent)]
    #[diagnostic(code(chainweave::stepper::step))]
    Step(#[from] StepError),
}

/// Stateful cursor walking an outline.
#[derive(Debug)]
pub struct Stepper {
    outline: Arc<Outline>,
    cursor: Cursor,
    finished: bool,
}

impl Stepper {
    /// A fresh stepper positioned at the first atomic step of `outline`.
    #[must_use]
    pub fn new(outline: Arc<Outline>) -> Self {
        let cursor = cursor_for(&outline);
        Self {
            outline,
            cursor,
            finished: false,
        }
    }

    /// Reconstruct a stepper whose next [`step`](Self::step) resumes from the
    /// saved position.
    pub fn restore(outline: Arc<Outline>, saved: SavedStepper) -> Result<Self, StepperError> {
        cursor_matches(&outline, &saved.cursor)
            .map_err(|detail| StepperError::CursorMismatch { detail })?;
        Ok(Self {
            outline,
            cursor: saved.cursor,
            finished: saved.finished,
        })
    }

    /// Execute the next increment against `chain`.
    pub fn step(
        &mut self,
        chain: &mut dyn WorkChain,
        ctx: &mut Context,
    ) -> Result<Stepped, StepperError> {
        if self.finished {
            return Err(StepperError::AlreadyFinished);
        }
        let outline = Arc::clone(&self.outline);
        let stepped = step_cursor(&outline, &mut self.cursor, chain, ctx)?;
        if matches!(stepped, Stepped::Finished(_) | Stepped::Returned(_)) {
            self.finished = true;
        }
        Ok(stepped)
    }

    /// Returns `true` once the outline is exhausted or a return fired.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Capture the full cursor for checkpointing.
    #[must_use]
    pub fn save(&self) -> SavedStepper {
        SavedStepper {
            cursor: self.cursor.clone(),
            finished: self.finished,
        }
    }
}

impl fmt::Display for Stepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        describe(&self.outline, &self.cursor, &mut out);
        write!(f, "{out}")
    }
}
