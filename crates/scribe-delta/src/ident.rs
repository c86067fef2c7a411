// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Identifier and timestamp newtypes shared across the document model.

use serde::{Deserialize, Serialize};

use crate::DeltaError;

/// A document revision number.
///
/// Revisions form a strict total order starting at zero. A change at
/// revision `n` transforms the snapshot at `n - 1` into the snapshot at `n`.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RevNum(u64);

impl RevNum {
    /// Revision zero: the initial document-form change.
    pub const ZERO: Self = Self(0);

    /// Constructs a revision number from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The next revision in sequence.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The previous revision, or `None` at revision zero.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0 {
            0 => None,
            n => Some(Self(n - 1)),
        }
    }
}

impl core::fmt::Display for RevNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Opaque author identity attached to changes and carets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuthorId(String);

impl AuthorId {
    /// Constructs an author id. The value is opaque; emptiness is rejected.
    pub fn new(value: impl Into<String>) -> Result<Self, DeltaError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DeltaError::BadValue("author id must be non-empty".into()));
        }
        Ok(Self(value))
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AuthorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque session identity: one `(user, document, connection)` triple.
///
/// Session ids key caret ownership; they must be non-empty and are treated
/// as ASCII-safe opaque strings (they appear as storage-path components).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Constructs a session id, rejecting the empty string.
    pub fn new(value: impl Into<String>) -> Result<Self, DeltaError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DeltaError::BadValue("session id must be non-empty".into()));
        }
        Ok(Self(value))
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond Unix-epoch timestamp.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Constructs a timestamp from raw epoch milliseconds.
    #[must_use]
    pub const fn from_msec(msec: u64) -> Self {
        Self(msec)
    }

    /// Epoch milliseconds.
    #[must_use]
    pub const fn as_msec(self) -> u64 {
        self.0
    }

    /// The current wall-clock time.
    ///
    /// Saturates to zero if the system clock reports a pre-epoch time.
    #[must_use]
    pub fn now() -> Self {
        let msec = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(msec).unwrap_or(u64::MAX))
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
