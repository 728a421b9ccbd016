/*!
Persistence primitives for serializing/deserializing work-chain state.

Design goals:
- Explicit serde-friendly shapes decoupled from the in-memory types: nodes
  persist as bare pks, placeholders persist as their awaitables, the stepper
  persists as its opaque saved cursor.
- Conversion logic localized here (TryFrom / hydrate) so the engine stays
  lean.
- Forward compatibility: optional checkpoint fields carry
  `#[serde(default)]`, so consumers tolerate added fields.

Unstored nodes are unrepresentable in a checkpoint by construction:
converting one is an error. The engine's exit-time store walk normally
prevents that from ever being observed; if the walk failed (it is
best-effort), the failure surfaces here instead of corrupting a snapshot.
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::awaitable::Awaitable;
use crate::chain::WorkChain;
use crate::context::{Context, ContextValue};
use crate::nodes::{NodeStore, NodeStoreError};
use crate::process::{ChainError, ChainHandle, ChainProcess};
use crate::runner::Runner;
use crate::stepper::{SavedStepper, Stepper};
use crate::types::{ExitCode, Pk, ProcessState};

/// Errors from checkpoint conversion, storage, and reload.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum PersistenceError {
    /// The context held an unstored node at conversion time.
    #[error("context value under `{key}` holds an unstored node")]
    #[diagnostic(
        code(chainweave::persistence::unstored_node),
        help("Unstored entities cannot be serialized; check the exit-time store logs for the underlying failure.")
    )]
    UnstoredNode { key: String },

    /// A node referenced by a checkpoint could not be reloaded.
    #[error("node pk<{pk}> referenced by the checkpoint could not be loaded")]
    #[diagnostic(
        code(chainweave::persistence::missing_node),
        help("The node store must contain every entity a checkpoint references.")
    )]
    MissingNode {
        pk: Pk,
        #[source]
        source: NodeStoreError,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(code(chainweave::persistence::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },

    /// Backend storage error.
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(chainweave::persistence::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Persisted shape of a [`ContextValue`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PersistedValue {
    /// Plain data, stored verbatim.
    Json(Value),
    /// A stored node, referenced by pk.
    Node { pk: Pk },
    /// An ordered sequence.
    List(Vec<PersistedValue>),
    /// A nested mapping.
    Map(FxHashMap<String, PersistedValue>),
    /// An unresolved placeholder.
    Pending(Awaitable),
}

fn persist_value(key: &str, value: &ContextValue) -> Result<PersistedValue> {
    match value {
        ContextValue::Json(json) => Ok(PersistedValue::Json(json.clone())),
        ContextValue::Node(node) => node
            .pk()
            .map(|pk| PersistedValue::Node { pk })
            .ok_or_else(|| PersistenceError::UnstoredNode {
                key: key.to_string(),
            }),
        ContextValue::List(items) => items
            .iter()
            .map(|item| persist_value(key, item))
            .collect::<Result<Vec<_>>>()
            .map(PersistedValue::List),
        ContextValue::Map(entries) => entries
            .iter()
            .map(|(name, entry)| Ok((name.clone(), persist_value(key, entry)?)))
            .collect::<Result<FxHashMap<_, _>>>()
            .map(PersistedValue::Map),
        ContextValue::Pending(awaitable) => Ok(PersistedValue::Pending(awaitable.clone())),
    }
}

fn hydrate_value(value: &PersistedValue, store: &dyn NodeStore) -> Result<ContextValue> {
    match value {
        PersistedValue::Json(json) => Ok(ContextValue::Json(json.clone())),
        PersistedValue::Node { pk } => store
            .load(*pk)
            .map(ContextValue::Node)
            .map_err(|source| PersistenceError::MissingNode { pk: *pk, source }),
        PersistedValue::List(items) => items
            .iter()
            .map(|item| hydrate_value(item, store))
            .collect::<Result<Vec<_>>>()
            .map(ContextValue::List),
        PersistedValue::Map(entries) => entries
            .iter()
            .map(|(name, entry)| Ok((name.clone(), hydrate_value(entry, store)?)))
            .collect::<Result<FxHashMap<_, _>>>()
            .map(ContextValue::Map),
        PersistedValue::Pending(awaitable) => Ok(ContextValue::Pending(awaitable.clone())),
    }
}

/// A durable snapshot of one work chain.
///
/// Captures everything needed to resume after a host restart: the context,
/// the stepper cursor (absent if the chain never launched), the pending
/// awaitable list, and the inherited process fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    /// Pk of the chain's own process node; keys the checkpoint store.
    pub chain_pk: Pk,
    /// Lifecycle state at snapshot time.
    pub state: ProcessState,
    /// Human-readable status line.
    #[serde(default)]
    pub status: Option<String>,
    /// Exit code, for terminal snapshots.
    #[serde(default)]
    pub exit_code: Option<ExitCode>,
    /// Fault description, for excepted snapshots.
    #[serde(default)]
    pub fault: Option<String>,
    /// The chain's context with nodes flattened to pk references.
    pub context: FxHashMap<String, PersistedValue>,
    /// Saved stepper cursor, once the chain has launched.
    #[serde(default)]
    pub stepper_state: Option<SavedStepper>,
    /// Awaitables pending at snapshot time.
    #[serde(default)]
    pub awaitables: Vec<Awaitable>,
    /// Number of step-driver invocations so far.
    #[serde(default)]
    pub step_count: u64,
    /// Snapshot creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ChainCheckpoint {
    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| PersistenceError::Serde { source })
    }

    /// Deserialize from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|source| PersistenceError::Serde { source })
    }
}

impl ChainHandle {
    /// Capture a checkpoint of the chain's current state.
    ///
    /// Runs the exit-time store walk first so freshly produced nodes get
    /// pks; any entity that still lacks one fails the conversion.
    pub fn checkpoint(&self) -> Result<ChainCheckpoint> {
        let store = Arc::clone(self.store());
        self.with_process(|chain| {
            chain.on_exiting(store.as_ref());
            let mut context = FxHashMap::default();
            for (key, value) in chain.ctx.entries() {
                context.insert(key.clone(), persist_value(key, value)?);
            }
            Ok(ChainCheckpoint {
                chain_pk: chain.pk,
                state: chain.state,
                status: chain.status.clone(),
                exit_code: chain.exit_code.clone(),
                fault: chain.fault.clone(),
                context,
                stepper_state: chain.stepper.as_ref().map(Stepper::save),
                awaitables: chain.awaitables.clone(),
                step_count: chain.step_count,
                created_at: Utc::now(),
            })
        })
    }

    /// Reconstruct a chain from a checkpoint.
    ///
    /// The logic must produce the same outline the checkpoint's cursor was
    /// saved from. If awaitables were pending, their completion callbacks
    /// are re-registered immediately: the prior host died before they could
    /// fire, and the runner contract makes re-registration for
    /// already-terminated targets resolve promptly. A waiting snapshot whose
    /// list already drained (captured between the last resolution and the
    /// resume tick) has no callback left to wake it, so the resume is
    /// scheduled here instead. Restoring the same checkpoint twice yields
    /// two chains with identical observable state.
    pub fn restore(
        checkpoint: &ChainCheckpoint,
        logic: Box<dyn WorkChain>,
        runner: Arc<dyn Runner>,
        store: Arc<dyn NodeStore>,
    ) -> std::result::Result<ChainHandle, ChainError> {
        // The chain's own node must still exist; it anchors identity and
        // logging after the restart.
        store
            .load(checkpoint.chain_pk)
            .map_err(|source| PersistenceError::MissingNode {
                pk: checkpoint.chain_pk,
                source,
            })?;

        let outline = Arc::new(logic.outline());
        let stepper = checkpoint
            .stepper_state
            .clone()
            .map(|saved| Stepper::restore(Arc::clone(&outline), saved))
            .transpose()?;

        let mut ctx = Context::new();
        for (key, value) in &checkpoint.context {
            let hydrated = hydrate_value(value, store.as_ref())?;
            ctx.set(key, hydrated)?;
        }

        let process = ChainProcess {
            logic,
            outline,
            ctx,
            stepper,
            awaitables: checkpoint.awaitables.clone(),
            state: checkpoint.state,
            status: checkpoint.status.clone(),
            exit_code: checkpoint.exit_code.clone(),
            fault: checkpoint.fault.clone(),
            pk: checkpoint.chain_pk,
            step_count: checkpoint.step_count,
        };
        let handle = ChainHandle::from_process(process, runner, store);

        let pending = handle.with_process(|chain| chain.awaitables.clone());
        if !pending.is_empty() {
            handle.action_awaitables(pending);
        } else if checkpoint.state == ProcessState::Waiting {
            // Nothing will call back; wake the chain on the next tick.
            handle.schedule_resume();
        }
        info!(chain = checkpoint.chain_pk, "work chain restored from checkpoint");
        Ok(handle)
    }
}

/// Trait for persistent storage and retrieval of chain checkpoints.
///
/// Implementations must be atomic per save, idempotent for repeated saves of
/// the same snapshot, and isolated between chains.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist the latest checkpoint for a chain, replacing any prior one.
    async fn save(&self, checkpoint: ChainCheckpoint) -> Result<()>;

    /// Load the most recent checkpoint for a chain, if any exists.
    async fn load_latest(&self, chain_pk: Pk) -> Result<Option<ChainCheckpoint>>;

    /// All chain pks with at least one stored checkpoint.
    async fn list_chains(&self) -> Result<Vec<Pk>>;
}

/// Simple in-memory checkpointer. Stores only the latest checkpoint per
/// chain.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: RwLock<FxHashMap<Pk, ChainCheckpoint>>,
}

impl InMemoryCheckpointer {
    /// Create an empty checkpointer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(&self, checkpoint: ChainCheckpoint) -> Result<()> {
        let mut map = self.inner.write().map_err(|e| PersistenceError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        map.insert(checkpoint.chain_pk, checkpoint);
        Ok(())
    }

    async fn load_latest(&self, chain_pk: Pk) -> Result<Option<ChainCheckpoint>> {
        let map = self.inner.read().map_err(|e| PersistenceError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        Ok(map.get(&chain_pk).cloned())
    }

    async fn list_chains(&self) -> Result<Vec<Pk>> {
        let map = self.inner.read().map_err(|e| PersistenceError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        Ok(map.keys().copied().collect())
    }
}
