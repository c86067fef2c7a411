// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! scribe-doc: the per-document control layer.
//!
//! One document is three revision logs sharing one transactional file:
//!
//! - the **body** log ([`BodyControl`]) — durable, unbounded, the document
//!   text itself;
//! - the **property** log ([`PropertyControl`]) — durable, unbounded,
//!   document metadata;
//! - the **caret** log ([`CaretControl`]) — ephemeral, bounded history,
//!   best-effort persisted.
//!
//! The durable logs run on [`DocControl`], whose `update` implements the OT
//! append protocol: compose the server-side changes the client has not seen,
//! transform the client's delta over them, append under a compare-and-swap
//! on `/revision_number`, and hand back the correction that moves the
//! client's expected state onto the server's actual state. The
//! compare-and-swap makes the file the single serializer for the document —
//! at most one writer wins each revision, and losers rebase and retry.
//!
//! [`DocHost`] aggregates the three controls behind one handle and owns the
//! background caret tasks. [`Session`] is the per-(author, connection) view
//! exposed as an RPC target.
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
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod caret;
mod colors;
mod control;
mod host;
mod session;

pub use caret::CaretControl;
pub use colors::{ColorPicker, PALETTE};
pub use control::{BodyControl, DocControl, LogKind, PropertyControl};
pub use host::{random_session_id, DocHost, ValidationStatus};
pub use session::Session;

use scribe_delta::RevNum;
use scribe_file::FileError;
use scribe_proto::{names, ProtoError};

/// Errors surfaced by the document control layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocError {
    /// A value failed validation at this boundary (caller misuse).
    #[error("[DOC_BAD_VALUE] {0}")]
    BadValue(String),
    /// Stored or received data had a divergent shape.
    #[error("[DOC_BAD_DATA] {0}")]
    BadData(String),
    /// The requested revision fell below the retention floor.
    #[error("[DOC_REVISION_NOT_AVAILABLE] {requested} is below the retention floor {floor}")]
    RevisionNotAvailable {
        /// The revision asked for.
        requested: RevNum,
        /// The oldest revision still retained.
        floor: RevNum,
    },
    /// The requested revision has not been produced yet.
    #[error("[DOC_REVISION_TOO_HIGH] {requested} exceeds current revision {current}")]
    RevisionTooHigh {
        /// The revision asked for.
        requested: RevNum,
        /// The newest revision that exists.
        current: RevNum,
    },
    /// An update lost the append race on every attempt.
    #[error("[DOC_TOO_MUCH_CONTENTION] update lost the append race {retries} times")]
    TooMuchContention {
        /// Number of attempts made.
        retries: u32,
    },
    /// A long-poll elapsed without a new change.
    #[error("[DOC_TIMED_OUT] no new change within the poll window")]
    TimedOut,
    /// Invariant violation: an implementation defect, not a caller error.
    #[error("[DOC_WTF] {0}")]
    Wtf(String),
    /// A storage error passed through unchanged.
    #[error(transparent)]
    File(#[from] FileError),
}

impl From<ProtoError> for DocError {
    fn from(err: ProtoError) -> Self {
        Self::BadData(err.to_string())
    }
}

impl From<scribe_delta::DeltaError> for DocError {
    fn from(err: scribe_delta::DeltaError) -> Self {
        match err {
            scribe_delta::DeltaError::BadValue(msg) => Self::BadValue(msg),
            scribe_delta::DeltaError::BadData(msg) => Self::BadData(msg),
        }
    }
}

impl DocError {
    /// The stable wire name for this error.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::BadValue(_) => names::BAD_VALUE,
            Self::BadData(_) | Self::File(FileError::BadData(_)) => names::BAD_DATA,
            Self::RevisionNotAvailable { .. } => names::REVISION_NOT_AVAILABLE,
            Self::RevisionTooHigh { .. } => names::REVISION_TOO_HIGH,
            Self::TooMuchContention { .. } => names::TOO_MUCH_CONTENTION,
            Self::TimedOut | Self::File(FileError::TimedOut) => names::TIMED_OUT,
            Self::Wtf(_) => names::WTF,
            Self::File(FileError::PrerequisiteFailed(_)) => names::PREREQUISITE_FAILED,
            Self::File(_) => names::WTF,
        }
    }
}
