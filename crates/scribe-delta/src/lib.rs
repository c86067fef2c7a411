// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! scribe-delta: the operational-transform algebra behind Scribe documents.
//!
//! A *delta* is an immutable sequence of typed operations. Three payload
//! families share one algebra:
//!
//! - [`BodyDelta`] — rich-text operations (retain / insert / delete with
//!   attribute maps) over the document body.
//! - [`CaretDelta`] — per-session caret operations (begin / end / set-field).
//! - [`PropertyDelta`] — document property operations (set / delete).
//!
//! All three implement [`Payload`], whose two core operations are `compose`
//! (sequential combination, associative, identity = empty) and `transform`
//! (concurrent-edit rebasing). Transform satisfies TP1:
//!
//! ```text
//! a.compose(&a.transform(&b, true), true)
//!     == b.compose(&b.transform(&a, false), true)
//! ```
//!
//! where equality is over the resulting document contents.
//!
//! # Document form
//!
//! A delta is in *document form* when it fully describes a state from empty:
//! insert-only for bodies, begin-only with unique session ids for carets,
//! unique sets with no deletes for properties. Snapshots always hold
//! document-form contents; the change at revision 0 must be document-form.
//!
//! # Determinism
//!
//! Map-shaped state uses `BTreeMap` throughout so iteration order (and
//! therefore composed output order) is deterministic.
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

mod attrs;
mod body;
mod caret;
mod change;
mod ident;
mod prop;

pub use attrs::{compose_attrs, transform_attrs, Attrs};
pub use body::{BodyDelta, BodyOp};
pub use caret::{Caret, CaretColor, CaretDelta, CaretField, CaretOp, CaretSnapshot};
pub use change::{Change, Snapshot};
pub use ident::{AuthorId, RevNum, SessionId, Timestamp};
pub use prop::{PropertyDelta, PropertyOp};

/// Errors produced when values cross a validation boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    /// A value failed structural validation (caller misuse).
    #[error("[DELTA_BAD_VALUE] {0}")]
    BadValue(String),
    /// Data decoded from an external boundary had a divergent shape.
    #[error("[DELTA_BAD_DATA] {0}")]
    BadData(String),
}

/// The delta algebra shared by all payload families.
///
/// Implementations are immutable values: every operation returns a new delta.
///
/// # Transform contract
///
/// `transform(&self, other, other_first)` rebases `other` so it can be
/// applied *after* `self`, where both were produced against the same base
/// state. The flag breaks ties when both sides insert at the same position:
/// when `other_first` is `true` the transformed delta's insertions land ahead
/// of this delta's; when `false` they are shifted past them. Used
/// consistently on both sides of a concurrent pair, either flag value
/// converges (TP1); callers pick the side whose content should come first.
pub trait Payload: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// The identity delta.
    fn empty() -> Self;

    /// Sequential combination: the effect of `self` followed by `other`.
    ///
    /// `want_document` declares that the caller expects a document-form
    /// result (e.g. snapshot ∘ change); implementations then drop carrier
    /// state that only makes sense mid-stream (attribute-removal markers,
    /// net deletes of absent entries, trailing retains).
    fn compose(&self, other: &Self, want_document: bool) -> Self;

    /// OT transform: rebases `other` to apply after `self`.
    ///
    /// See the trait-level transform contract for tie-break semantics.
    fn transform(&self, other: &Self, other_first: bool) -> Self;

    /// Structural predicate: does this delta describe a state from empty?
    fn is_document(&self) -> bool;

    /// `true` when this delta has no effect.
    fn is_empty(&self) -> bool;
}
