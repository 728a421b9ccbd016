//! Per-chain mutable context: step outputs, nested data, and placeholders.
//!
//! The [`Context`] is an attribute-style mapping from dotted keys to
//! [`ContextValue`]s. Steps read and write it directly; the awaitable
//! protocol additionally parks [`ContextValue::Pending`] placeholders in the
//! slots that resolved child results will later occupy.
//!
//! Dotted keys navigate nested maps: `set("relax.result", v)` creates the
//! intermediate `relax` map if needed. Ordered sequences (used by append-mode
//! bindings) are [`ContextValue::List`]s.
//!
//! # Examples
//!
//! ```rust
//! use chainweave::context::{Context, ContextValue};
//! use serde_json::json;
//!
//! let mut ctx = Context::new();
//! ctx.set("scf.cutoff", json!(520).into()).unwrap();
//! ctx.push("jobs", json!("first").into()).unwrap();
//!
//! assert_eq!(ctx.get("scf.cutoff").and_then(ContextValue::as_json), Some(&json!(520)));
//! assert_eq!(ctx.get("jobs").and_then(ContextValue::as_list).map(Vec::len), Some(1));
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::awaitable::Awaitable;
use crate::nodes::NodeRef;

/// A value held in the context.
#[derive(Clone, Debug)]
pub enum ContextValue {
    /// Plain serializable data.
    Json(Value),
    /// A process entity.
    Node(NodeRef),
    /// An ordered sequence.
    List(Vec<ContextValue>),
    /// A nested mapping.
    Map(FxHashMap<String, ContextValue>),
    /// An unresolved awaitable occupying its final slot.
    Pending(Awaitable),
}

impl ContextValue {
    /// Returns `true` if this value is an unresolved placeholder.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// View as plain JSON data.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// View as a process entity.
    #[must_use]
    pub fn as_node(&self) -> Option<&NodeRef> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }

    /// View as an ordered sequence.
    #[must_use]
    pub fn as_list(&self) -> Option<&Vec<ContextValue>> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// View as a nested mapping.
    #[must_use]
    pub fn as_map(&self) -> Option<&FxHashMap<String, ContextValue>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// View as the placeholder awaitable.
    #[must_use]
    pub fn as_pending(&self) -> Option<&Awaitable> {
        match self {
            Self::Pending(awaitable) => Some(awaitable),
            _ => None,
        }
    }
}

impl PartialEq for ContextValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Json(a), Self::Json(b)) => a == b,
            // Nodes compare by identity: same handle, or same stored pk.
            (Self::Node(a), Self::Node(b)) => {
                Arc::ptr_eq(a, b) || (a.is_stored() && a.pk() == b.pk())
            }
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Pending(a), Self::Pending(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Value> for ContextValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<NodeRef> for ContextValue {
    fn from(node: NodeRef) -> Self {
        Self::Node(node)
    }
}

impl From<Awaitable> for ContextValue {
    fn from(awaitable: Awaitable) -> Self {
        Self::Pending(awaitable)
    }
}

/// Errors from context path operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    /// A path segment was empty (`""`, `"a..b"`, trailing dot).
    #[error("invalid context key: {key:?}")]
    #[diagnostic(
        code(chainweave::context::invalid_key),
        help("Keys are non-empty dotted paths such as `result` or `relax.energy`.")
    )]
    InvalidKey { key: String },

    /// Navigation hit a value that is not a map.
    #[error("context path `{path}` is blocked by a non-map value at `{segment}`")]
    #[diagnostic(
        code(chainweave::context::path_conflict),
        help("Remove or rename the conflicting value before writing through it.")
    )]
    PathConflict { path: String, segment: String },

    /// An append targeted a key that holds a non-list value.
    #[error("cannot append to `{path}`: existing value is not a sequence")]
    #[diagnostic(code(chainweave::context::not_a_sequence))]
    NotASequence { path: String },
}

/// Attribute-style mapping from dotted keys to values.
///
/// Created empty at chain construction, mutated by steps and by awaitable
/// resolution, fully serialized at checkpoint (see the persistence module)
/// and reloaded on resume.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Context {
    root: FxHashMap<String, ContextValue>,
}

fn split_path(path: &str) -> Result<Vec<&str>, ContextError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ContextError::InvalidKey {
            key: path.to_string(),
        });
    }
    Ok(segments)
}

impl Context {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of top-level entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// Returns `true` if the context holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// The top-level values, for recursive walks.
    pub fn values(&self) -> impl Iterator<Item = &ContextValue> {
        self.root.values()
    }

    /// The top-level entries.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &ContextValue)> {
        self.root.iter()
    }

    /// Read the value under a dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ContextValue> {
        let segments = split_path(path).ok()?;
        let (last, init) = segments.split_last()?;
        let mut current = &self.root;
        for segment in init {
            current = match current.get(*segment) {
                Some(ContextValue::Map(entries)) => entries,
                _ => return None,
            };
        }
        current.get(*last)
    }

    /// Mutable access to the value under a dotted path.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut ContextValue> {
        let segments = split_path(path).ok()?;
        let (last, init) = segments.split_last()?;
        let mut current = &mut self.root;
        for segment in init {
            current = match current.get_mut(*segment) {
                Some(ContextValue::Map(entries)) => entries,
                _ => return None,
            };
        }
        current.get_mut(*last)
    }

    /// Write `value` under a dotted path, creating intermediate maps and
    /// overwriting any existing value at the final segment.
    pub fn set(&mut self, path: &str, value: ContextValue) -> Result<(), ContextError> {
        let target = self.navigate(path)?;
        let segments = split_path(path)?;
        let last = *segments.last().expect("split_path rejects empty keys");
        target.insert(last.to_string(), value);
        Ok(())
    }

    /// Append `value` to the sequence under a dotted path, creating an empty
    /// sequence first if the key is absent.
    pub fn push(&mut self, path: &str, value: ContextValue) -> Result<(), ContextError> {
        let target = self.navigate(path)?;
        let segments = split_path(path)?;
        let last = *segments.last().expect("split_path rejects empty keys");
        match target
            .entry(last.to_string())
            .or_insert_with(|| ContextValue::List(Vec::new()))
        {
            ContextValue::List(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(ContextError::NotASequence {
                path: path.to_string(),
            }),
        }
    }

    /// Remove and return the value under a dotted path.
    pub fn remove(&mut self, path: &str) -> Option<ContextValue> {
        let segments = split_path(path).ok()?;
        let (last, init) = segments.split_last()?;
        let mut current = &mut self.root;
        for segment in init {
            current = match current.get_mut(*segment) {
                Some(ContextValue::Map(entries)) => entries,
                _ => return None,
            };
        }
        current.remove(*last)
    }

    /// Navigate to the map holding the final segment of `path`, creating
    /// intermediate maps along the way.
    fn navigate(
        &mut self,
        path: &str,
    ) -> Result<&mut FxHashMap<String, ContextValue>, ContextError> {
        let segments = split_path(path)?;
        let (_, init) = segments
            .split_last()
            .ok_or_else(|| ContextError::InvalidKey {
                key: path.to_string(),
            })?;
        let mut current = &mut self.root;
        for segment in init {
            let entry = current
                .entry((*segment).to_string())
                .or_insert_with(|| ContextValue::Map(FxHashMap::default()));
            current = match entry {
                ContextValue::Map(entries) => entries,
                _ => {
                    return Err(ContextError::PathConflict {
                        path: path.to_string(),
                        segment: (*segment).to_string(),
                    });
                }
            };
        }
        Ok(current)
    }
}
