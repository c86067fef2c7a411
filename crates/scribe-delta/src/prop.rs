// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Property deltas: document metadata as a key/value OT payload.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Payload;

/// One property operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyOp {
    /// Bind `key` to `value`.
    Set {
        /// Property name.
        key: String,
        /// Property value.
        value: Value,
    },
    /// Remove `key`.
    Delete {
        /// Property name.
        key: String,
    },
}

impl PropertyOp {
    fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A sequence of property operations; per key, the last one wins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyDelta {
    ops: Vec<PropertyOp>,
}

impl PropertyDelta {
    /// The empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// The operations, in order.
    pub fn ops(&self) -> &[PropertyOp] {
        &self.ops
    }

    /// Appends a set op.
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.ops.push(PropertyOp::Set {
            key: key.into(),
            value,
        });
        self
    }

    /// Appends a delete op.
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(PropertyOp::Delete { key: key.into() });
        self
    }

    /// The value bound to `key` by this delta, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.ops.iter().rev().find_map(|op| match op {
            PropertyOp::Set { key: k, value } if k == key => Some(value),
            _ => None,
        })
    }

    /// Folds the op list into per-key net effects, in key order.
    fn net_effects(&self) -> BTreeMap<&str, &PropertyOp> {
        let mut nets = BTreeMap::new();
        for op in &self.ops {
            nets.insert(op.key(), op);
        }
        nets
    }
}

impl Payload for PropertyDelta {
    fn empty() -> Self {
        Self::new()
    }

    fn compose(&self, other: &Self, want_document: bool) -> Self {
        let mut combined = self.clone();
        combined.ops.extend(other.ops.iter().cloned());
        let mut out = Self::new();
        for op in combined.net_effects().into_values() {
            match op {
                PropertyOp::Set { .. } => out.ops.push(op.clone()),
                PropertyOp::Delete { .. } => {
                    // A net delete only matters mid-stream; a document has no
                    // key to remove.
                    if !want_document {
                        out.ops.push(op.clone());
                    }
                }
            }
        }
        out
    }

    fn transform(&self, other: &Self, other_first: bool) -> Self {
        if other_first {
            return other.clone();
        }
        let touched: BTreeSet<&str> = self.ops.iter().map(PropertyOp::key).collect();
        let mut out = Self::new();
        for op in &other.ops {
            if !touched.contains(op.key()) {
                out.ops.push(op.clone());
            }
        }
        out
    }

    fn is_document(&self) -> bool {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        self.ops.iter().all(|op| match op {
            PropertyOp::Set { key, .. } => seen.insert(key),
            PropertyOp::Delete { .. } => false,
        })
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
