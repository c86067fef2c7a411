// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Changes and snapshots: deltas tagged with revision metadata.

use serde::{Deserialize, Serialize};

use crate::ident::{AuthorId, RevNum, Timestamp};
use crate::{DeltaError, Payload};

/// A delta tagged with the revision it produces and its authorship.
///
/// The change at revision `n` transforms the snapshot at `n - 1` into the
/// snapshot at `n`. The change at revision 0 must be document-form; later
/// changes must be non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<P> {
    /// Revision this change produces.
    pub rev_num: RevNum,
    /// The delta itself.
    pub delta: P,
    /// Wall-clock time the server accepted the change, when known.
    pub timestamp: Option<Timestamp>,
    /// Author the change is attributed to, when known.
    pub author_id: Option<AuthorId>,
}

impl<P: Payload> Change<P> {
    /// A change with no authorship metadata.
    pub fn bare(rev_num: RevNum, delta: P) -> Self {
        Self {
            rev_num,
            delta,
            timestamp: None,
            author_id: None,
        }
    }

    /// The empty correction at `rev_num`: "your expected state is correct".
    pub fn identity(rev_num: RevNum) -> Self {
        Self::bare(rev_num, P::empty())
    }

    /// Validates a change entering the log.
    ///
    /// # Errors
    ///
    /// `BadValue` when the revision-0 change is not document-form, or a
    /// later change is empty or document-form (a full-document replacement
    /// is not an incremental change).
    pub fn validate_for_append(&self) -> Result<(), DeltaError> {
        if self.rev_num == RevNum::ZERO {
            if !self.delta.is_document() {
                return Err(DeltaError::BadValue(
                    "the change at revision 0 must be document-form".into(),
                ));
            }
        } else if self.delta.is_empty() {
            return Err(DeltaError::BadValue(format!(
                "change at {} must be non-empty",
                self.rev_num
            )));
        } else if self.delta.is_document() {
            return Err(DeltaError::BadValue(format!(
                "change at {} must be incremental, not document-form",
                self.rev_num
            )));
        }
        Ok(())
    }
}

/// A document-form delta at a specific revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<P> {
    /// Revision this snapshot describes.
    pub rev_num: RevNum,
    /// Document-form contents.
    pub contents: P,
}

impl<P: Payload> Snapshot<P> {
    /// The empty document at revision zero.
    pub fn genesis() -> Self {
        Self {
            rev_num: RevNum::ZERO,
            contents: P::empty(),
        }
    }

    /// Applies the next change in sequence.
    ///
    /// # Errors
    ///
    /// `BadValue` when `change.rev_num` is not exactly the next revision.
    pub fn compose(&self, change: &Change<P>) -> Result<Self, DeltaError> {
        if change.rev_num != self.rev_num.next() {
            return Err(DeltaError::BadValue(format!(
                "change {} does not follow snapshot {}",
                change.rev_num, self.rev_num
            )));
        }
        Ok(Self {
            rev_num: change.rev_num,
            contents: self.contents.compose(&change.delta, true),
        })
    }
}
