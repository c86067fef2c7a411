// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The editor seam.
//!
//! The real editor widget lives outside this crate; the sync machine talks
//! to it through [`EditorPort`] and receives its activity as
//! [`EditorEvent`]s on the machine's event queue. Every change the machine
//! applies on the server's behalf carries [`SYNC_SOURCE`], and changes
//! arriving *from* the editor with that tag are never echoed back — that
//! discrimination is what keeps the loop from feeding on itself.

use scribe_delta::{BodyDelta, CaretSnapshot};

/// Source tag for edits this subsystem applies to the editor.
pub const SYNC_SOURCE: &str = "doc-client";

/// Something the editor did.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    /// The document content changed.
    TextChange {
        /// The delta, against the editor's previous content.
        delta: BodyDelta,
        /// Who caused it: `"user"`, [`SYNC_SOURCE`], or another plugin.
        source: String,
    },
    /// The selection moved.
    SelectionChange {
        /// Selection start, in characters.
        index: usize,
        /// Selection extent; zero for a bare caret.
        length: usize,
    },
}

/// What the sync machine needs from an editor.
pub trait EditorPort: Send + 'static {
    /// Replaces the whole document (initial load and re-initialization).
    fn load_document(&mut self, contents: &BodyDelta);

    /// Applies a change to the current content, tagged with `source`.
    fn apply_change(&mut self, delta: &BodyDelta, source: &str);

    /// Enables or disables user input.
    fn set_enabled(&mut self, enabled: bool);

    /// Renders the other participants' carets.
    fn show_carets(&mut self, carets: &CaretSnapshot);
}
