//! Core types for the chainweave work-chain engine.
//!
//! This module defines the fundamental identifiers and terminal statuses used
//! throughout the system: the process identifier [`Pk`], the tagged terminal
//! status [`ExitCode`], and the chain lifecycle enum [`ProcessState`].
//!
//! # Examples
//!
//! ```rust
//! use chainweave::types::{ExitCode, ProcessState};
//!
//! let code = ExitCode::new(410).with_message("child did not converge");
//! assert!(code.is_failure());
//!
//! let state = ProcessState::Waiting;
//! assert!(!state.is_terminal());
//! assert_eq!(state.to_string(), "waiting");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a process entity, assigned by the node store.
///
/// Stable across checkpoints: a chain persisted while waiting on `pk = 7`
/// must find the same process under `pk = 7` after a restore.
pub type Pk = u64;

/// Tagged terminal status distinct from normal completion.
///
/// A step that produces an `ExitCode` with non-zero status terminates its
/// chain with that code as a *clean* outcome, not an error. Status zero is
/// the neutral value and is ignored by the step driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCode {
    /// Numeric status; zero means success.
    pub status: u32,
    /// Optional human-readable explanation.
    #[serde(default)]
    pub message: Option<String>,
}

impl ExitCode {
    /// Create an exit code with the given status and no message.
    #[must_use]
    pub fn new(status: u32) -> Self {
        Self {
            status,
            message: None,
        }
    }

    /// Attach a message to this exit code.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns `true` if the status is non-zero.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status != 0
    }
}

impl From<u32> for ExitCode {
    fn from(status: u32) -> Self {
        Self::new(status)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} ({message})", self.status),
            None => write!(f, "{}", self.status),
        }
    }
}

/// Lifecycle state of a work chain.
///
/// Transition guards enforced by the engine:
/// - only `Running` may drive the stepper,
/// - only `Waiting` may receive completion callbacks,
/// - `Running` → `Waiting` requires a non-empty awaitable list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    /// Constructed but not yet launched.
    Created,
    /// Actively stepping through the outline.
    Running,
    /// Suspended pending completion of registered awaitables.
    Waiting,
    /// Terminated normally (possibly with a non-zero exit code).
    Finished,
    /// Terminated by an unhandled error.
    Excepted,
    /// Terminated by an external kill request.
    Killed,
}

impl ProcessState {
    /// Returns `true` for the three terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Excepted | Self::Killed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Finished => "finished",
            Self::Excepted => "excepted",
            Self::Killed => "killed",
        };
        write!(f, "{label}")
    }
}
