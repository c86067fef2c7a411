// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! scribe-proto: wire schema for the Scribe document API.
//!
//! The transport carries JSON text frames. A client sends [`Message`]s —
//! `{ id, target, payload: { method, args } }` — and receives [`Response`]s
//! — `{ id, ok, result | error }`. Ids are allocated monotonically per
//! connection and correlate responses to requests; the server may answer out
//! of order (long-polls resolve late).
//!
//! Model types cross the boundary through the [`Codec`]: each registered
//! type encodes as a single-key object `{"<Name>": [...ctorArgs]}` and
//! decodes by dispatching on that tag. Decoding re-validates shape — the
//! peer may run a different library version, and divergent encodings are
//! rejected as [`ProtoError::BadData`] instead of being half-understood.
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

pub mod auth;
mod codec;
mod message;

pub use codec::Codec;
pub use message::{ErrorInfo, Message, MethodCall, Response};

/// Stable wire names for the error taxonomy.
///
/// Clients branch on these strings; they are part of the protocol and never
/// change spelling.
pub mod names {
    /// A value failed validation at a boundary (caller misuse).
    pub const BAD_VALUE: &str = "badValue";
    /// Data crossed a boundary with a divergent shape.
    pub const BAD_DATA: &str = "badData";
    /// The requested revision is below the retention floor.
    pub const REVISION_NOT_AVAILABLE: &str = "revisionNotAvailable";
    /// The requested revision has not been produced yet.
    pub const REVISION_TOO_HIGH: &str = "revisionTooHigh";
    /// A storage prerequisite failed.
    pub const PREREQUISITE_FAILED: &str = "prerequisiteFailed";
    /// An update lost the append race too many times in a row.
    pub const TOO_MUCH_CONTENTION: &str = "tooMuchContention";
    /// The connection is closed.
    pub const CONNECTION_CLOSED: &str = "connectionClosed";
    /// The connection is in the middle of closing.
    pub const CONNECTION_CLOSING: &str = "connectionClosing";
    /// The transport reported an error.
    pub const CONNECTION_ERROR: &str = "connectionError";
    /// The peer violated the protocol; the connection is terminated.
    pub const CONNECTION_NONSENSE: &str = "connectionNonsense";
    /// A long-poll or wait elapsed without its condition firing.
    pub const TIMED_OUT: &str = "timedOut";
    /// The operation was cancelled.
    pub const ABORTED: &str = "aborted";
    /// Invariant violation: an implementation defect, not a caller error.
    pub const WTF: &str = "wtf";
    /// The named RPC target is not installed on this connection.
    pub const UNKNOWN_TARGET: &str = "unknownTarget";
    /// Wrapper around an error surfaced from the other side of the RPC.
    pub const REMOTE_ERROR: &str = "remoteError";
    /// Challenge-response authorization failed.
    pub const AUTH_FAILED: &str = "authFailed";
}

/// Errors raised while encoding or decoding wire values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// The value's shape diverged from the registered encoding.
    #[error("[PROTO_BAD_DATA] {0}")]
    BadData(String),
    /// The single-key tag named a type this codec does not register.
    #[error("[PROTO_UNKNOWN_TAG] unregistered encoding tag {0:?}")]
    UnknownTag(String),
}
