//! Process entities and the durable node store seam.
//!
//! A [`ProcessNode`] is the engine's view of a process-produced entity: an
//! attribute bag plus a store-assigned primary key. Nodes circulate as cheap
//! [`NodeRef`] handles; the same node may appear in a chain's context, in a
//! sibling chain, and in the store simultaneously.
//!
//! The [`NodeStore`] trait is the seam to durable storage. The engine
//! consumes three operations: load by pk, store-if-unstored, and the ordered
//! outgoing links of a terminated process. [`InMemoryNodeStore`] is the
//! process-local implementation used by tests and embedders; it tolerates
//! concurrent stores from sibling chains.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

use crate::types::Pk;

/// Shared handle to a process entity.
pub type NodeRef = Arc<ProcessNode>;

/// A process-produced entity: attributes plus a store-assigned identity.
///
/// A node starts *unstored* (no pk). Storing it through a [`NodeStore`]
/// assigns the pk exactly once; the handle is immutable afterwards.
#[derive(Debug, Default)]
pub struct ProcessNode {
    pk: OnceLock<Pk>,
    attributes: FxHashMap<String, Value>,
}

impl ProcessNode {
    /// Create an unstored node with no attributes.
    #[must_use]
    pub fn new() -> NodeRef {
        Arc::new(Self::default())
    }

    /// Create an unstored node carrying the given attributes.
    #[must_use]
    pub fn with_attributes(attributes: FxHashMap<String, Value>) -> NodeRef {
        Arc::new(Self {
            pk: OnceLock::new(),
            attributes,
        })
    }

    /// The store-assigned identity, if this node has been stored.
    #[must_use]
    pub fn pk(&self) -> Option<Pk> {
        self.pk.get().copied()
    }

    /// Returns `true` once the node has been persisted.
    #[must_use]
    pub fn is_stored(&self) -> bool {
        self.pk.get().is_some()
    }

    /// Look up a single attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// All attributes of this node.
    #[must_use]
    pub fn attributes(&self) -> &FxHashMap<String, Value> {
        &self.attributes
    }

    pub(crate) fn bind_pk(&self, pk: Pk) -> Result<(), NodeStoreError> {
        self.pk.set(pk).map_err(|_| NodeStoreError::Backend {
            message: format!("node already stored under pk<{:?}>", self.pk.get()),
        })
    }
}

/// Errors from node store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeStoreError {
    /// No entity exists under the requested pk.
    #[error("no node exists with pk<{pk}>")]
    #[diagnostic(
        code(chainweave::nodes::not_existent),
        help("The process identified by pk<{pk}> was never stored, or its record was removed.")
    )]
    NotExistent { pk: Pk },

    /// More than one entity matched the requested pk.
    #[error("pk<{pk}> resolved to more than one node")]
    #[diagnostic(
        code(chainweave::nodes::ambiguous),
        help("The backing store holds conflicting records for pk<{pk}>; repair the store before resuming.")
    )]
    Ambiguous { pk: Pk },

    /// Backend storage error (lock poisoning, connectivity, ...).
    #[error("node store backend error: {message}")]
    #[diagnostic(code(chainweave::nodes::backend))]
    Backend { message: String },
}

/// Seam to durable storage of process entities.
///
/// Implementations must be shareable process-wide: reads are concurrent and
/// stores may arrive from sibling chains at the same time.
pub trait NodeStore: Send + Sync {
    /// Load the node stored under `pk`.
    fn load(&self, pk: Pk) -> Result<NodeRef, NodeStoreError>;

    /// Persist the node if it is unstored; idempotent otherwise.
    ///
    /// Returns the node's pk in both cases.
    fn store(&self, node: &NodeRef) -> Result<Pk, NodeStoreError>;

    /// The ordered outgoing links of the process under `pk`, as
    /// `(link_label, target_node)` pairs.
    fn outgoing(&self, pk: Pk) -> Result<Vec<(String, NodeRef)>, NodeStoreError>;
}

#[derive(Default)]
struct StoreInner {
    next_pk: Pk,
    nodes: FxHashMap<Pk, NodeRef>,
    outgoing: FxHashMap<Pk, Vec<(String, Pk)>>,
}

/// Process-local node store backed by a `RwLock`ed map.
#[derive(Default)]
pub struct InMemoryNodeStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryNodeStore {
    /// Create an empty store. Pks are assigned sequentially starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outgoing link from the stored process `from` to `to`,
    /// storing `to` first if needed.
    pub fn add_outgoing(
        &self,
        from: Pk,
        label: impl Into<String>,
        to: &NodeRef,
    ) -> Result<(), NodeStoreError> {
        let to_pk = self.store(to)?;
        let mut inner = self.write()?;
        if !inner.nodes.contains_key(&from) {
            return Err(NodeStoreError::NotExistent { pk: from });
        }
        inner
            .outgoing
            .entry(from)
            .or_default()
            .push((label.into(), to_pk));
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreInner>, NodeStoreError> {
        self.inner.read().map_err(|e| NodeStoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreInner>, NodeStoreError> {
        self.inner.write().map_err(|e| NodeStoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })
    }
}

impl NodeStore for InMemoryNodeStore {
    fn load(&self, pk: Pk) -> Result<NodeRef, NodeStoreError> {
        let inner = self.read()?;
        inner
            .nodes
            .get(&pk)
            .cloned()
            .ok_or(NodeStoreError::NotExistent { pk })
    }

    fn store(&self, node: &NodeRef) -> Result<Pk, NodeStoreError> {
        let mut inner = self.write()?;
        // Re-checked under the lock so concurrent stores of the same handle
        // stay idempotent.
        if let Some(pk) = node.pk() {
            return Ok(pk);
        }
        inner.next_pk += 1;
        let pk = inner.next_pk;
        node.bind_pk(pk)?;
        inner.nodes.insert(pk, Arc::clone(node));
        Ok(pk)
    }

    fn outgoing(&self, pk: Pk) -> Result<Vec<(String, NodeRef)>, NodeStoreError> {
        let inner = self.read()?;
        if !inner.nodes.contains_key(&pk) {
            return Err(NodeStoreError::NotExistent { pk });
        }
        let links = inner.outgoing.get(&pk).cloned().unwrap_or_default();
        links
            .into_iter()
            .map(|(label, target_pk)| {
                let target = inner
                    .nodes
                    .get(&target_pk)
                    .cloned()
                    .ok_or(NodeStoreError::NotExistent { pk: target_pk })?;
                Ok((label, target))
            })
            .collect()
    }
}
