// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! scribe-server: the WebSocket connection plane.
//!
//! Browsers and native clients speak JSON text frames over a WebSocket
//! (`/ws`). Each connection owns a map of named RPC targets, seeded with
//! the built-in `meta` target. `meta` exposes connection identity, ping,
//! and challenge-response authorization: proving possession of a document's
//! shared secret installs that document's [`Session`] as a callable target
//! on the connection.
//!
//! Requests are dispatched in wire arrival order (FIFO per connection) but
//! each runs as its own task, so a long-poll never head-blocks the
//! connection. A disconnect aborts every in-flight call the connection
//! started and ends its sessions' carets.
//!
//! [`Session`]: scribe_doc::Session
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

mod connection;
mod directory;
mod target;

pub use connection::{router, ServerState};
pub use directory::TargetDirectory;
pub use target::{SessionTarget, Target};
