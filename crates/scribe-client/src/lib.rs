// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! scribe-client: the editor-facing half of the protocol.
//!
//! [`ApiClient`] correlates requests to responses over an abstract framed
//! transport (a channel pair; [`ws`] bridges a real WebSocket onto it), with
//! the required queueing discipline: requests issued before the transport
//! opens are queued in order, requests after close fail `connectionClosed`,
//! and a response for an unknown id is `connectionNonsense` — the peer has
//! diverged and the connection is torn down.
//!
//! [`ClientSync`] is the synchronization state machine that marries one
//! local editor to one server session: pull remote changes by long-poll,
//! collect local edits for a push window, submit, and reconcile the
//! returned correction with whatever the user typed during the round trip.
//! Everything runs on one cooperative event loop; I/O completions post
//! events back to it.
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

mod api;
mod budget;
mod editor;
mod state;
pub mod ws;

pub use api::{ApiClient, SessionClient};
pub use budget::ErrorBudget;
pub use editor::{EditorEvent, EditorPort, SYNC_SOURCE};
pub use state::{ClientSync, SyncEvent, SyncHandle, SyncState};
