// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! In-memory transactional file.
//!
//! [`MemoryFile`] is the reference backend: a path map plus a blob map
//! behind one async mutex, with a [`Notify`] broadcast waking wait-spec
//! transactions whenever a mutation commits. Every guarantee durable
//! backends must provide is observable here, which is what the storage
//! conformance tests run against.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::spec::PartitionedSpec;
use crate::{
    ContentHash, FileError, FileOp, FrozenBuffer, StoragePath, TransactionResult,
    TransactionalFile, TransactionSpec,
};

/// Ceiling applied to wait specs that do not carry a timeout op.
const DEFAULT_WAIT_CEILING: Duration = Duration::from_secs(600);

#[derive(Default)]
struct Store {
    created: bool,
    paths: BTreeMap<StoragePath, FrozenBuffer>,
    blobs: BTreeMap<ContentHash, FrozenBuffer>,
}

impl Store {
    fn check_prereqs(&self, prereqs: &[FileOp]) -> Result<(), FileError> {
        for op in prereqs {
            let holds = match op {
                FileOp::CheckBlobAbsent { hash } => !self.blobs.contains_key(hash),
                FileOp::CheckBlobPresent { hash } => self.blobs.contains_key(hash),
                FileOp::CheckPathAbsent { path } => !self.paths.contains_key(path),
                FileOp::CheckPathPresent { path } => self.paths.contains_key(path),
                FileOp::CheckPathIs { path, hash } => {
                    self.paths.get(path).map(FrozenBuffer::hash) == Some(*hash)
                }
                FileOp::CheckPathNot { path, hash } => {
                    self.paths.get(path).map(FrozenBuffer::hash) != Some(*hash)
                }
                _ => true,
            };
            if !holds {
                return Err(FileError::PrerequisiteFailed(format!("{op:?}")));
            }
        }
        Ok(())
    }

    fn run_fetches(&self, fetches: &[FileOp], result: &mut TransactionResult) {
        for op in fetches {
            match op {
                FileOp::ListPathPrefix { prefix } => {
                    for path in self.paths.keys() {
                        if let Some(component) = prefix.child_component_of(path) {
                            result.paths.insert(prefix.join_known(component));
                        }
                    }
                }
                FileOp::ListPathRange { prefix, start, end } => {
                    for path in self.paths.keys() {
                        if let Some(n) = numeric_child(prefix, path) {
                            if (*start..*end).contains(&n) {
                                result.paths.insert(prefix.join_index(n));
                            }
                        }
                    }
                }
                FileOp::ReadBlob { hash } => {
                    if let Some(value) = self.blobs.get(hash) {
                        result.blobs.insert(*hash, value.clone());
                    }
                }
                FileOp::ReadPath { path } => {
                    if let Some(value) = self.paths.get(path) {
                        result.data.insert(path.clone(), value.clone());
                    }
                }
                FileOp::ReadPathRange { prefix, start, end } => {
                    for n in *start..*end {
                        let child = prefix.join_index(n);
                        if let Some(value) = self.paths.get(&child) {
                            result.data.insert(child, value.clone());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn run_deletes(&mut self, deletes: &[FileOp]) -> bool {
        let mut mutated = false;
        for op in deletes {
            match op {
                FileOp::DeletePath { path } => {
                    mutated |= self.paths.remove(path).is_some();
                }
                FileOp::DeletePathPrefix { prefix } => {
                    let before = self.paths.len();
                    self.paths
                        .retain(|path, _| path != prefix && !prefix.is_strict_prefix_of(path));
                    mutated |= self.paths.len() != before;
                }
                FileOp::DeletePathRange { prefix, start, end } => {
                    let before = self.paths.len();
                    self.paths.retain(|path, _| {
                        numeric_child(prefix, path).is_none_or(|n| !(*start..*end).contains(&n))
                    });
                    mutated |= self.paths.len() != before;
                }
                FileOp::DeleteBlob { hash } => {
                    mutated |= self.blobs.remove(hash).is_some();
                }
                FileOp::DeleteAll => {
                    mutated |= !self.paths.is_empty() || !self.blobs.is_empty();
                    self.paths.clear();
                    self.blobs.clear();
                }
                _ => {}
            }
        }
        mutated
    }

    fn run_writes(&mut self, writes: &[FileOp]) -> bool {
        let mut mutated = false;
        for op in writes {
            match op {
                FileOp::WritePath { path, value } => {
                    let prior = self.paths.insert(path.clone(), value.clone());
                    mutated |= prior.as_ref().map(FrozenBuffer::hash) != Some(value.hash());
                }
                FileOp::WriteBlob { value } => {
                    mutated |= self.blobs.insert(value.hash(), value.clone()).is_none();
                }
                _ => {}
            }
        }
        mutated
    }

    fn satisfied_waits(&self, waits: &[FileOp]) -> Vec<StoragePath> {
        let mut satisfied = Vec::new();
        for op in waits {
            if let FileOp::WhenPathNot { path, hash } = op {
                if self.paths.get(path).map(FrozenBuffer::hash) != Some(*hash) {
                    satisfied.push(path.clone());
                }
            }
        }
        satisfied
    }
}

/// The in-memory reference backend.
pub struct MemoryFile {
    doc_path: String,
    state: Mutex<Store>,
    changed: Notify,
}

impl MemoryFile {
    /// A fresh, not-yet-created file identified by `doc_path` in logs.
    pub fn new(doc_path: impl Into<String>) -> Self {
        Self {
            doc_path: doc_path.into(),
            state: Mutex::new(Store::default()),
            changed: Notify::new(),
        }
    }

    async fn run_wait(&self, parts: &PartitionedSpec) -> Result<TransactionResult, FileError> {
        let ceiling = parts.timeout.unwrap_or(DEFAULT_WAIT_CEILING);
        let deadline = tokio::time::Instant::now() + ceiling;
        loop {
            let store = self.state.lock().await;
            if !store.created {
                return Err(FileError::FileNotFound);
            }
            store.check_prereqs(&parts.prerequisites)?;
            let changed = store.satisfied_waits(&parts.waits);
            if !changed.is_empty() {
                return Ok(TransactionResult {
                    changed,
                    ..TransactionResult::default()
                });
            }
            // Arm the wakeup before releasing the lock so a commit cannot
            // slip between this check and the await.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            drop(store);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(FileError::TimedOut);
            }
        }
    }
}

#[async_trait]
impl TransactionalFile for MemoryFile {
    fn doc_path(&self) -> &str {
        &self.doc_path
    }

    async fn exists(&self) -> Result<bool, FileError> {
        Ok(self.state.lock().await.created)
    }

    async fn create(&self) -> Result<(), FileError> {
        self.state.lock().await.created = true;
        Ok(())
    }

    async fn transact(&self, spec: TransactionSpec) -> Result<TransactionResult, FileError> {
        let parts = spec.partition()?;
        if !parts.waits.is_empty() {
            return self.run_wait(&parts).await;
        }
        let mut store = self.state.lock().await;
        if !store.created {
            return Err(FileError::FileNotFound);
        }
        store.check_prereqs(&parts.prerequisites)?;
        let mut result = TransactionResult::default();
        store.run_fetches(&parts.fetches, &mut result);
        let mutated = store.run_deletes(&parts.deletes) | store.run_writes(&parts.writes);
        drop(store);
        if mutated {
            self.changed.notify_waiters();
        }
        Ok(result)
    }
}

/// Parses `path` as a direct-or-deeper numeric child of `prefix`.
fn numeric_child(prefix: &StoragePath, path: &StoragePath) -> Option<u64> {
    prefix.child_component_of(path)?.parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn p(s: &str) -> StoragePath {
        StoragePath::new(s).unwrap()
    }

    async fn fresh() -> MemoryFile {
        let file = MemoryFile::new("doc-1");
        file.create().await.unwrap();
        file
    }

    async fn write(file: &MemoryFile, path: &str, value: &str) {
        file.transact(TransactionSpec::new().write_path(p(path), FrozenBuffer::from_string(value)))
            .await
            .unwrap();
    }

    async fn read(file: &MemoryFile, path: &str) -> Option<String> {
        let result = file
            .transact(TransactionSpec::new().read_path(p(path)))
            .await
            .unwrap();
        result
            .data
            .get(&p(path))
            .map(|b| b.as_utf8().unwrap().to_owned())
    }

    // ── 1. write + read round-trip ──────────────────────────────────────

    #[tokio::test]
    async fn write_read_round_trip() {
        let file = fresh().await;
        write(&file, "/revision_number", "0").await;
        assert_eq!(read(&file, "/revision_number").await.as_deref(), Some("0"));
        assert_eq!(read(&file, "/missing").await, None);
    }

    // ── 2. atomicity: failed prereq applies nothing ─────────────────────

    #[tokio::test]
    async fn failed_prereq_applies_nothing() {
        let file = fresh().await;
        write(&file, "/revision_number", "3").await;
        let stale = FrozenBuffer::from_string("2").hash();
        let err = file
            .transact(
                TransactionSpec::new()
                    .check_path_is(p("/revision_number"), stale)
                    .write_path(p("/revision_number"), FrozenBuffer::from_string("4"))
                    .write_path(p("/revision/4/change"), FrozenBuffer::from_string("c4")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::PrerequisiteFailed(_)));
        assert_eq!(read(&file, "/revision_number").await.as_deref(), Some("3"));
        assert_eq!(read(&file, "/revision/4/change").await, None);
    }

    // ── 3. compare-and-swap succeeds against the observed value ─────────

    #[tokio::test]
    async fn cas_succeeds_on_match() {
        let file = fresh().await;
        write(&file, "/revision_number", "3").await;
        let current = FrozenBuffer::from_string("3").hash();
        file.transact(
            TransactionSpec::new()
                .check_path_is(p("/revision_number"), current)
                .write_path(p("/revision_number"), FrozenBuffer::from_string("4")),
        )
        .await
        .unwrap();
        assert_eq!(read(&file, "/revision_number").await.as_deref(), Some("4"));
    }

    // ── 4. idempotent writes ────────────────────────────────────────────

    #[tokio::test]
    async fn identical_write_is_idempotent() {
        let file = fresh().await;
        write(&file, "/a", "v").await;
        write(&file, "/a", "v").await;
        assert_eq!(read(&file, "/a").await.as_deref(), Some("v"));
    }

    // ── 5. list prefix returns direct children ──────────────────────────

    #[tokio::test]
    async fn list_prefix_direct_children() {
        let file = fresh().await;
        write(&file, "/caret/s1", "a").await;
        write(&file, "/caret/s2", "b").await;
        write(&file, "/revision/0/change", "c").await;
        let result = file
            .transact(TransactionSpec::new().list_path_prefix(p("/caret")))
            .await
            .unwrap();
        let listed: Vec<_> = result.paths.iter().map(StoragePath::as_str).collect();
        assert_eq!(listed, ["/caret/s1", "/caret/s2"]);
    }

    #[tokio::test]
    async fn list_range_numeric_children() {
        let file = fresh().await;
        for n in 0..5u64 {
            write(&file, &format!("/revision/{n}/change"), "c").await;
        }
        let result = file
            .transact(TransactionSpec::new().list_path_range(p("/revision"), 1, 4))
            .await
            .unwrap();
        let listed: Vec<_> = result.paths.iter().map(StoragePath::as_str).collect();
        assert_eq!(listed, ["/revision/1", "/revision/2", "/revision/3"]);
    }

    // ── 6. range deletes take subtrees ──────────────────────────────────

    #[tokio::test]
    async fn delete_range_removes_subtrees() {
        let file = fresh().await;
        for n in 0..4u64 {
            write(&file, &format!("/revision/{n}/change"), "c").await;
        }
        file.transact(TransactionSpec::new().delete_path_range(p("/revision"), 0, 2))
            .await
            .unwrap();
        assert_eq!(read(&file, "/revision/0/change").await, None);
        assert_eq!(read(&file, "/revision/1/change").await, None);
        assert!(read(&file, "/revision/2/change").await.is_some());
    }

    // ── 7. blob namespace is content-addressed ──────────────────────────

    #[tokio::test]
    async fn blob_store_and_fetch() {
        let file = fresh().await;
        let blob = FrozenBuffer::from_string("payload");
        let hash = blob.hash();
        file.transact(TransactionSpec::new().write_blob(blob))
            .await
            .unwrap();
        let result = file
            .transact(TransactionSpec::new().read_blob(hash))
            .await
            .unwrap();
        assert_eq!(result.blobs.get(&hash).unwrap().as_bytes(), b"payload");
        // Prereqs see it too.
        file.transact(
            TransactionSpec::new()
                .check_blob_present(hash)
                .delete_blob(hash),
        )
        .await
        .unwrap();
        let gone = file
            .transact(TransactionSpec::new().read_blob(hash))
            .await
            .unwrap();
        assert!(gone.blobs.is_empty());
    }

    // ── 8. wait wakes on mutation ───────────────────────────────────────

    #[tokio::test]
    async fn wait_wakes_on_write() {
        let file = Arc::new(fresh().await);
        write(&file, "/revision_number", "5").await;
        let held = FrozenBuffer::from_string("5").hash();
        let waiter = {
            let file = Arc::clone(&file);
            tokio::spawn(async move {
                file.transact(
                    TransactionSpec::new()
                        .timeout(Duration::from_secs(5))
                        .when_path_not(p("/revision_number"), held),
                )
                .await
            })
        };
        // Give the waiter a chance to block, then commit a new revision.
        tokio::task::yield_now().await;
        write(&file, "/revision_number", "6").await;
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.changed, vec![p("/revision_number")]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let file = fresh().await;
        write(&file, "/revision_number", "5").await;
        let held = FrozenBuffer::from_string("5").hash();
        let err = file
            .transact(
                TransactionSpec::new()
                    .timeout(Duration::from_millis(250))
                    .when_path_not(p("/revision_number"), held),
            )
            .await
            .unwrap_err();
        assert_eq!(err, FileError::TimedOut);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_satisfied() {
        let file = fresh().await;
        write(&file, "/revision_number", "6").await;
        let stale = FrozenBuffer::from_string("5").hash();
        let result = file
            .transact(TransactionSpec::new().when_path_not(p("/revision_number"), stale))
            .await
            .unwrap();
        assert_eq!(result.changed, vec![p("/revision_number")]);
    }

    // ── 9. transactions on an uncreated file ────────────────────────────

    #[tokio::test]
    async fn uncreated_file_not_found() {
        let file = MemoryFile::new("doc-x");
        let err = file
            .transact(TransactionSpec::new().read_path(p("/a")))
            .await
            .unwrap_err();
        assert_eq!(err, FileError::FileNotFound);
    }
}
