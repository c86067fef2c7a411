// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! scribe-file: single-document transactional storage.
//!
//! A *file* owns all persistent bytes for one document: a hierarchy of
//! [`StoragePath`] bindings to immutable [`FrozenBuffer`]s, plus a
//! content-addressed blob namespace keyed by BLAKE3 hash. The one primitive
//! is [`TransactionalFile::transact`], which evaluates a [`TransactionSpec`]
//! atomically: either every prerequisite passes and every mutation applies
//! together, or nothing does.
//!
//! Higher layers express durable mutation as a compare-and-swap prerequisite
//! plus a write set, which gives them optimistic concurrency without a
//! separate lock manager. Wait operations turn the file into a change
//! signal: `when_path_not` blocks until a path stops hashing to a known
//! value, which is what long-polling readers ride on.
//!
//! [`MemoryFile`] is the in-process reference backend. Durable backends
//! (local filesystem, remote KV) implement the same trait behind the same
//! spec semantics.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod buffer;
mod memory;
mod path;
mod spec;

pub use buffer::{ContentHash, FrozenBuffer};
pub use memory::MemoryFile;
pub use path::StoragePath;
pub use spec::{FileOp, PartitionedSpec, TransactionResult, TransactionSpec};

use async_trait::async_trait;

/// Errors surfaced by file transactions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    /// A prerequisite predicate evaluated false; nothing was applied.
    #[error("[FILE_PREREQ_FAILED] {0}")]
    PrerequisiteFailed(String),
    /// The transaction exceeded its time ceiling.
    #[error("[FILE_TIMED_OUT] transaction exceeded its time ceiling")]
    TimedOut,
    /// The document file does not exist.
    #[error("[FILE_NOT_FOUND] no such document file")]
    FileNotFound,
    /// The storage backend failed in a way the caller cannot act on.
    #[error("[FILE_BACKEND] {0}")]
    BackendError(String),
    /// A storage path failed validation.
    #[error("[FILE_BAD_PATH] {0}")]
    BadPath(String),
    /// The transaction spec violated the category-mixing rules.
    #[error("[FILE_BAD_SPEC] {0}")]
    BadSpec(String),
    /// Stored bytes failed to decode as the expected shape.
    #[error("[FILE_BAD_DATA] {0}")]
    BadData(String),
}

/// A single-document transactional store.
///
/// One instance owns the bytes of one document for its lifetime. All
/// mutation goes through [`transact`](Self::transact); callers never take
/// additional locks on top of it.
#[async_trait]
pub trait TransactionalFile: Send + Sync + 'static {
    /// Identification string for logs (never parsed).
    fn doc_path(&self) -> &str;

    /// Whether the file has been created.
    async fn exists(&self) -> Result<bool, FileError>;

    /// Creates the file. Idempotent.
    async fn create(&self) -> Result<(), FileError>;

    /// Atomically evaluates `spec`.
    ///
    /// Evaluation order within a transaction is fixed: environment →
    /// prerequisite → list → read → delete → write → wait. The write set is
    /// applied against the state observed after the prerequisite phase, under
    /// the same critical section.
    ///
    /// # Errors
    ///
    /// - [`FileError::BadSpec`] when `spec` mixes exclusive categories.
    /// - [`FileError::PrerequisiteFailed`] when a predicate fails.
    /// - [`FileError::TimedOut`] when a wait outlives its ceiling.
    /// - [`FileError::FileNotFound`] when the file was never created.
    async fn transact(&self, spec: TransactionSpec) -> Result<TransactionResult, FileError>;
}
