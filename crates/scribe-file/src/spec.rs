// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Transaction specs: the operation vocabulary of [`transact`].
//!
//! A spec is an unordered bag of typed operations. Backends evaluate the
//! categories in a fixed order — environment → prerequisite → list → read →
//! delete → write → wait — regardless of the order operations were added.
//! Three category groups are mutually exclusive within one spec: a spec
//! either waits, or reads/lists, or mutates. Environment and prerequisite
//! operations combine with any of the three.
//!
//! [`transact`]: crate::TransactionalFile::transact

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::{ContentHash, FileError, FrozenBuffer, StoragePath};

/// One transaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // Variant meaning is given by the builder methods below.
pub enum FileOp {
    Timeout { duration: Duration },
    CheckBlobAbsent { hash: ContentHash },
    CheckBlobPresent { hash: ContentHash },
    CheckPathAbsent { path: StoragePath },
    CheckPathPresent { path: StoragePath },
    CheckPathIs { path: StoragePath, hash: ContentHash },
    CheckPathNot { path: StoragePath, hash: ContentHash },
    ListPathPrefix { prefix: StoragePath },
    ListPathRange { prefix: StoragePath, start: u64, end: u64 },
    ReadBlob { hash: ContentHash },
    ReadPath { path: StoragePath },
    ReadPathRange { prefix: StoragePath, start: u64, end: u64 },
    DeletePath { path: StoragePath },
    DeletePathPrefix { prefix: StoragePath },
    DeletePathRange { prefix: StoragePath, start: u64, end: u64 },
    DeleteBlob { hash: ContentHash },
    DeleteAll,
    WritePath { path: StoragePath, value: FrozenBuffer },
    WriteBlob { value: FrozenBuffer },
    WhenPathNot { path: StoragePath, hash: ContentHash },
}

/// Exclusive category groups; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpGroup {
    Environment,
    Prerequisite,
    Fetch,
    Mutate,
    Wait,
}

impl FileOp {
    fn group(&self) -> OpGroup {
        match self {
            Self::Timeout { .. } => OpGroup::Environment,
            Self::CheckBlobAbsent { .. }
            | Self::CheckBlobPresent { .. }
            | Self::CheckPathAbsent { .. }
            | Self::CheckPathPresent { .. }
            | Self::CheckPathIs { .. }
            | Self::CheckPathNot { .. } => OpGroup::Prerequisite,
            Self::ListPathPrefix { .. }
            | Self::ListPathRange { .. }
            | Self::ReadBlob { .. }
            | Self::ReadPath { .. }
            | Self::ReadPathRange { .. } => OpGroup::Fetch,
            Self::DeletePath { .. }
            | Self::DeletePathPrefix { .. }
            | Self::DeletePathRange { .. }
            | Self::DeleteBlob { .. }
            | Self::DeleteAll
            | Self::WritePath { .. }
            | Self::WriteBlob { .. } => OpGroup::Mutate,
            Self::WhenPathNot { .. } => OpGroup::Wait,
        }
    }

    fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::DeletePath { .. }
                | Self::DeletePathPrefix { .. }
                | Self::DeletePathRange { .. }
                | Self::DeleteBlob { .. }
                | Self::DeleteAll
        )
    }
}

/// An unordered bag of operations forming one atomic transaction.
///
/// Built with the chainable methods; validated (category exclusivity,
/// single timeout) when the backend partitions it.
#[derive(Debug, Clone, Default)]
pub struct TransactionSpec {
    ops: Vec<FileOp>,
}

impl TransactionSpec {
    /// An empty spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// All operations, in insertion order.
    pub fn ops(&self) -> &[FileOp] {
        &self.ops
    }

    /// Sets the best-effort abort ceiling. At most one per spec.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.ops.push(FileOp::Timeout { duration });
        self
    }

    /// Fails the transaction unless no blob hashes to `hash`.
    pub fn check_blob_absent(mut self, hash: ContentHash) -> Self {
        self.ops.push(FileOp::CheckBlobAbsent { hash });
        self
    }

    /// Fails the transaction unless a blob hashes to `hash`.
    pub fn check_blob_present(mut self, hash: ContentHash) -> Self {
        self.ops.push(FileOp::CheckBlobPresent { hash });
        self
    }

    /// Fails the transaction unless `path` is unbound.
    pub fn check_path_absent(mut self, path: StoragePath) -> Self {
        self.ops.push(FileOp::CheckPathAbsent { path });
        self
    }

    /// Fails the transaction unless `path` is bound.
    pub fn check_path_present(mut self, path: StoragePath) -> Self {
        self.ops.push(FileOp::CheckPathPresent { path });
        self
    }

    /// Fails the transaction unless `path` is bound to bytes hashing to `hash`.
    pub fn check_path_is(mut self, path: StoragePath, hash: ContentHash) -> Self {
        self.ops.push(FileOp::CheckPathIs { path, hash });
        self
    }

    /// Fails the transaction if `path` is bound to bytes hashing to `hash`.
    pub fn check_path_not(mut self, path: StoragePath, hash: ContentHash) -> Self {
        self.ops.push(FileOp::CheckPathNot { path, hash });
        self
    }

    /// Returns the paths directly under `prefix`.
    pub fn list_path_prefix(mut self, prefix: StoragePath) -> Self {
        self.ops.push(FileOp::ListPathPrefix { prefix });
        self
    }

    /// Returns the numeric children of `prefix` in `start..end`.
    pub fn list_path_range(mut self, prefix: StoragePath, start: u64, end: u64) -> Self {
        self.ops.push(FileOp::ListPathRange { prefix, start, end });
        self
    }

    /// Reads the blob hashing to `hash`.
    pub fn read_blob(mut self, hash: ContentHash) -> Self {
        self.ops.push(FileOp::ReadBlob { hash });
        self
    }

    /// Reads the value bound at `path`. Missing paths are simply absent from
    /// the result map, never bound to a null value.
    pub fn read_path(mut self, path: StoragePath) -> Self {
        self.ops.push(FileOp::ReadPath { path });
        self
    }

    /// Reads the numeric children of `prefix` in `start..end`.
    pub fn read_path_range(mut self, prefix: StoragePath, start: u64, end: u64) -> Self {
        self.ops.push(FileOp::ReadPathRange { prefix, start, end });
        self
    }

    /// Unbinds `path`. Idempotent.
    pub fn delete_path(mut self, path: StoragePath) -> Self {
        self.ops.push(FileOp::DeletePath { path });
        self
    }

    /// Unbinds every path at or below `prefix`. Idempotent.
    pub fn delete_path_prefix(mut self, prefix: StoragePath) -> Self {
        self.ops.push(FileOp::DeletePathPrefix { prefix });
        self
    }

    /// Unbinds the numeric-child subtrees of `prefix` in `start..end`.
    pub fn delete_path_range(mut self, prefix: StoragePath, start: u64, end: u64) -> Self {
        self.ops.push(FileOp::DeletePathRange { prefix, start, end });
        self
    }

    /// Drops the blob hashing to `hash`. Idempotent.
    pub fn delete_blob(mut self, hash: ContentHash) -> Self {
        self.ops.push(FileOp::DeleteBlob { hash });
        self
    }

    /// Unbinds every path and drops every blob.
    pub fn delete_all(mut self) -> Self {
        self.ops.push(FileOp::DeleteAll);
        self
    }

    /// Binds `path` to `value`. Idempotent when the value is equal.
    pub fn write_path(mut self, path: StoragePath, value: FrozenBuffer) -> Self {
        self.ops.push(FileOp::WritePath { path, value });
        self
    }

    /// Stores `value` in the blob namespace under its content hash.
    pub fn write_blob(mut self, value: FrozenBuffer) -> Self {
        self.ops.push(FileOp::WriteBlob { value });
        self
    }

    /// Blocks until `path` is absent or bound to bytes *not* hashing to
    /// `hash`, or until the timeout elapses.
    pub fn when_path_not(mut self, path: StoragePath, hash: ContentHash) -> Self {
        self.ops.push(FileOp::WhenPathNot { path, hash });
        self
    }

    /// Validates the bag and splits it into evaluation phases.
    ///
    /// # Errors
    ///
    /// `BadSpec` on category mixing, duplicate timeouts, or an empty spec.
    pub fn partition(self) -> Result<PartitionedSpec, FileError> {
        if self.ops.is_empty() {
            return Err(FileError::BadSpec("transaction spec is empty".into()));
        }
        let mut parts = PartitionedSpec::default();
        let mut exclusive: Option<OpGroup> = None;
        for op in self.ops {
            let group = op.group();
            match group {
                OpGroup::Environment => {
                    let FileOp::Timeout { duration } = &op else {
                        return Err(FileError::BadSpec("unknown environment op".into()));
                    };
                    if parts.timeout.replace(*duration).is_some() {
                        return Err(FileError::BadSpec(
                            "at most one timeout op is allowed".into(),
                        ));
                    }
                    continue;
                }
                OpGroup::Prerequisite => {
                    parts.prerequisites.push(op);
                    continue;
                }
                OpGroup::Fetch | OpGroup::Mutate | OpGroup::Wait => {
                    if let Some(prior) = exclusive {
                        if prior != group {
                            return Err(FileError::BadSpec(format!(
                                "spec mixes exclusive categories ({prior:?} and {group:?})"
                            )));
                        }
                    }
                    exclusive = Some(group);
                }
            }
            match group {
                OpGroup::Fetch => parts.fetches.push(op),
                OpGroup::Wait => parts.waits.push(op),
                OpGroup::Mutate => {
                    if op.is_delete() {
                        parts.deletes.push(op);
                    } else {
                        parts.writes.push(op);
                    }
                }
                OpGroup::Environment | OpGroup::Prerequisite => {}
            }
        }
        Ok(parts)
    }
}

/// A validated spec split into evaluation phases.
#[derive(Debug, Clone, Default)]
pub struct PartitionedSpec {
    /// Abort ceiling, when present.
    pub timeout: Option<Duration>,
    /// Prerequisite predicates, checked first.
    pub prerequisites: Vec<FileOp>,
    /// List and read operations.
    pub fetches: Vec<FileOp>,
    /// Delete operations, applied before writes.
    pub deletes: Vec<FileOp>,
    /// Write operations.
    pub writes: Vec<FileOp>,
    /// Wait operations.
    pub waits: Vec<FileOp>,
}

/// What a transaction returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionResult {
    /// Values read by path; missing paths are absent, never null-bound.
    pub data: BTreeMap<StoragePath, FrozenBuffer>,
    /// Blobs read by hash.
    pub blobs: BTreeMap<ContentHash, FrozenBuffer>,
    /// Paths returned by list operations.
    pub paths: BTreeSet<StoragePath>,
    /// For wait specs: the paths whose change satisfied the wait.
    pub changed: Vec<StoragePath>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn p(s: &str) -> StoragePath {
        StoragePath::new(s).unwrap()
    }

    // ── 1. category exclusivity ─────────────────────────────────────────

    #[test]
    fn read_and_write_cannot_mix() {
        let spec = TransactionSpec::new()
            .read_path(p("/a"))
            .write_path(p("/b"), FrozenBuffer::from_string("x"));
        assert!(matches!(spec.partition(), Err(FileError::BadSpec(_))));
    }

    #[test]
    fn wait_is_exclusive() {
        let hash = FrozenBuffer::from_string("v").hash();
        let spec = TransactionSpec::new()
            .when_path_not(p("/a"), hash)
            .read_path(p("/a"));
        assert!(matches!(spec.partition(), Err(FileError::BadSpec(_))));
    }

    #[test]
    fn prereq_combines_with_writes() {
        let hash = FrozenBuffer::from_string("v").hash();
        let spec = TransactionSpec::new()
            .check_path_is(p("/rev"), hash)
            .delete_path(p("/old"))
            .write_path(p("/rev"), FrozenBuffer::from_string("w"));
        let parts = spec.partition().unwrap();
        assert_eq!(parts.prerequisites.len(), 1);
        assert_eq!(parts.deletes.len(), 1);
        assert_eq!(parts.writes.len(), 1);
    }

    // ── 2. timeout multiplicity ─────────────────────────────────────────

    #[test]
    fn at_most_one_timeout() {
        let spec = TransactionSpec::new()
            .timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(2))
            .read_path(p("/a"));
        assert!(matches!(spec.partition(), Err(FileError::BadSpec(_))));
    }

    // ── 3. empty specs are caller bugs ──────────────────────────────────

    #[test]
    fn empty_spec_rejected() {
        assert!(matches!(
            TransactionSpec::new().partition(),
            Err(FileError::BadSpec(_))
        ));
    }
}
