// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Caret deltas: per-session selection state as an OT payload.
//!
//! A caret session begins when a client connects, moves on every selection
//! change, and ends on disconnect. Caret state is keyed by session id, so
//! concurrent operations on *different* sessions always commute; the
//! transform rules only have to arbitrate same-session races, which occur
//! when two servers shepherd the same session or a flush lags a disconnect.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ident::{AuthorId, RevNum, SessionId, Timestamp};
use crate::{DeltaError, Payload, Snapshot};

/// A 24-bit RGB caret color, rendered as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaretColor([u8; 3]);

impl CaretColor {
    /// Constructs a color from RGB components.
    #[must_use]
    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b])
    }

    /// Parses a `#rrggbb` string.
    pub fn parse(s: &str) -> Result<Self, DeltaError> {
        let hex = s
            .strip_prefix('#')
            .filter(|hex| hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| DeltaError::BadData(format!("malformed caret color: {s:?}")))?;
        let mut rgb = [0u8; 3];
        for (i, chunk) in rgb.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| DeltaError::BadData(format!("malformed caret color: {s:?}")))?;
        }
        Ok(Self(rgb))
    }
}

impl core::fmt::Display for CaretColor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

impl Serialize for CaretColor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CaretColor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One user's caret: selection anchor, extent, and presentation state.
///
/// Two carets are equal when all fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caret {
    /// Owning session.
    pub session_id: SessionId,
    /// Author behind the session.
    pub author_id: AuthorId,
    /// Document (body) revision the selection refers to.
    pub rev_num: RevNum,
    /// Selection start, in characters.
    pub index: usize,
    /// Selection extent; zero for a bare caret.
    pub length: usize,
    /// Server-assigned display color.
    pub color: CaretColor,
    /// Last time this session showed signs of life.
    pub last_active: Timestamp,
}

/// A single updatable caret field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaretField {
    /// Document revision the selection refers to.
    RevNum(RevNum),
    /// Selection start.
    Index(usize),
    /// Selection extent.
    Length(usize),
    /// Liveness timestamp.
    LastActive(Timestamp),
}

impl CaretField {
    /// Stable key used for same-field conflict detection.
    fn key(&self) -> &'static str {
        match self {
            Self::RevNum(_) => "rev_num",
            Self::Index(_) => "index",
            Self::Length(_) => "length",
            Self::LastActive(_) => "last_active",
        }
    }

    fn apply_to(&self, caret: &mut Caret) {
        match self {
            Self::RevNum(v) => caret.rev_num = *v,
            Self::Index(v) => caret.index = *v,
            Self::Length(v) => caret.length = *v,
            Self::LastActive(v) => caret.last_active = *v,
        }
    }
}

/// One caret operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaretOp {
    /// A session joins with its initial caret.
    Begin {
        /// The caret as assigned at session open.
        caret: Caret,
    },
    /// A session leaves; its caret disappears.
    End {
        /// The departing session.
        session_id: SessionId,
    },
    /// One field of an existing caret changes.
    Set {
        /// The session whose caret changes.
        session_id: SessionId,
        /// The new field value.
        field: CaretField,
    },
}

impl CaretOp {
    fn session_id(&self) -> &SessionId {
        match self {
            Self::Begin { caret } => &caret.session_id,
            Self::End { session_id } | Self::Set { session_id, .. } => session_id,
        }
    }
}

/// Net effect of a composed delta on one session.
#[derive(Debug, Clone)]
enum NetOp {
    Begun(Caret),
    Ended,
    Fields(BTreeMap<&'static str, CaretField>),
}

/// A sequence of caret operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaretDelta {
    ops: Vec<CaretOp>,
}

impl CaretDelta {
    /// The empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// The operations, in order.
    pub fn ops(&self) -> &[CaretOp] {
        &self.ops
    }

    /// Appends a session-begin op.
    pub fn begin(mut self, caret: Caret) -> Self {
        self.ops.push(CaretOp::Begin { caret });
        self
    }

    /// Appends a session-end op.
    pub fn end(mut self, session_id: SessionId) -> Self {
        self.ops.push(CaretOp::End { session_id });
        self
    }

    /// Appends a field update.
    pub fn set(mut self, session_id: SessionId, field: CaretField) -> Self {
        self.ops.push(CaretOp::Set { session_id, field });
        self
    }

    /// Folds the op list into per-session net effects.
    fn net_effects(&self) -> BTreeMap<SessionId, NetOp> {
        let mut nets: BTreeMap<SessionId, NetOp> = BTreeMap::new();
        for op in &self.ops {
            let id = op.session_id().clone();
            match op {
                CaretOp::Begin { caret } => {
                    nets.insert(id, NetOp::Begun(caret.clone()));
                }
                CaretOp::End { .. } => {
                    nets.insert(id, NetOp::Ended);
                }
                CaretOp::Set { field, .. } => {
                    let net = nets
                        .entry(id)
                        .or_insert_with(|| NetOp::Fields(BTreeMap::new()));
                    match net {
                        NetOp::Begun(caret) => field.apply_to(caret),
                        // Setting a field of a session this delta already
                        // ended is moot.
                        NetOp::Ended => {}
                        NetOp::Fields(fields) => {
                            fields.insert(field.key(), field.clone());
                        }
                    }
                }
            }
        }
        nets
    }
}

impl Payload for CaretDelta {
    fn empty() -> Self {
        Self::new()
    }

    fn compose(&self, other: &Self, want_document: bool) -> Self {
        let mut combined = self.clone();
        combined.ops.extend(other.ops.iter().cloned());
        let mut out = Self::new();
        for (session_id, net) in combined.net_effects() {
            match net {
                NetOp::Begun(caret) => out.ops.push(CaretOp::Begin { caret }),
                NetOp::Ended => {
                    if !want_document {
                        out.ops.push(CaretOp::End { session_id });
                    }
                }
                NetOp::Fields(fields) => {
                    if !want_document {
                        for field in fields.into_values() {
                            out.ops.push(CaretOp::Set {
                                session_id: session_id.clone(),
                                field,
                            });
                        }
                    }
                }
            }
        }
        out
    }

    fn transform(&self, other: &Self, other_first: bool) -> Self {
        let mut ended: BTreeSet<&SessionId> = BTreeSet::new();
        let mut begun: BTreeSet<&SessionId> = BTreeSet::new();
        let mut set_fields: BTreeSet<(&SessionId, &'static str)> = BTreeSet::new();
        for op in &self.ops {
            match op {
                CaretOp::Begin { caret } => {
                    begun.insert(&caret.session_id);
                    ended.remove(&caret.session_id);
                }
                CaretOp::End { session_id } => {
                    ended.insert(session_id);
                    begun.remove(session_id);
                }
                CaretOp::Set { session_id, field } => {
                    set_fields.insert((session_id, field.key()));
                }
            }
        }
        let mut out = Self::new();
        for op in &other.ops {
            let keep = match op {
                CaretOp::Begin { caret } => other_first || !begun.contains(&caret.session_id),
                CaretOp::End { session_id } => !ended.contains(session_id),
                CaretOp::Set { session_id, field } => {
                    !ended.contains(session_id)
                        && (other_first || !set_fields.contains(&(session_id, field.key())))
                }
            };
            if keep {
                out.ops.push(op.clone());
            }
        }
        out
    }

    fn is_document(&self) -> bool {
        let mut seen: BTreeSet<&SessionId> = BTreeSet::new();
        self.ops.iter().all(|op| match op {
            CaretOp::Begin { caret } => seen.insert(&caret.session_id),
            _ => false,
        })
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// All carets of a document at a caret revision.
///
/// The caret revision counter is independent of the body's; carets advance
/// on their own log. Session ids are unique within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaretSnapshot {
    /// Caret-log revision this set corresponds to.
    pub rev_num: RevNum,
    carets: BTreeMap<SessionId, Caret>,
}

impl CaretSnapshot {
    /// An empty caret set at the given revision.
    pub fn empty(rev_num: RevNum) -> Self {
        Self {
            rev_num,
            carets: BTreeMap::new(),
        }
    }

    /// Builds the indexed view of a document-form caret delta snapshot.
    ///
    /// # Errors
    ///
    /// `BadData` if the contents are not document-form (non-begin ops or
    /// duplicate session ids).
    pub fn from_snapshot(snap: &Snapshot<CaretDelta>) -> Result<Self, DeltaError> {
        if !snap.contents.is_document() {
            return Err(DeltaError::BadData(
                "caret snapshot contents are not document-form".into(),
            ));
        }
        let mut carets = BTreeMap::new();
        for op in snap.contents.ops() {
            if let CaretOp::Begin { caret } = op {
                carets.insert(caret.session_id.clone(), caret.clone());
            }
        }
        Ok(Self {
            rev_num: snap.rev_num,
            carets,
        })
    }

    /// The caret for `session_id`, if that session is present.
    pub fn get(&self, session_id: &SessionId) -> Option<&Caret> {
        self.carets.get(session_id)
    }

    /// All carets, ordered by session id.
    pub fn carets(&self) -> impl Iterator<Item = &Caret> {
        self.carets.values()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.carets.len()
    }

    /// `true` when no session is active.
    pub fn is_empty(&self) -> bool {
        self.carets.is_empty()
    }

    /// Converts back into a document-form snapshot.
    pub fn into_snapshot(self) -> Snapshot<CaretDelta> {
        let mut delta = CaretDelta::new();
        for caret in self.carets.into_values() {
            delta = delta.begin(caret);
        }
        Snapshot {
            rev_num: self.rev_num,
            contents: delta,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn caret(session: &str, index: usize) -> Caret {
        Caret {
            session_id: SessionId::new(session).unwrap(),
            author_id: AuthorId::new("author").unwrap(),
            rev_num: RevNum::ZERO,
            index,
            length: 0,
            color: CaretColor::from_rgb(0x20, 0x40, 0x60),
            last_active: Timestamp::from_msec(0),
        }
    }

    fn sid(session: &str) -> SessionId {
        SessionId::new(session).unwrap()
    }

    // ── 1. color parse / display round-trip ─────────────────────────────

    #[test]
    fn color_round_trip() {
        let c = CaretColor::parse("#a1b2c3").unwrap();
        assert_eq!(c.to_string(), "#a1b2c3");
        assert!(CaretColor::parse("a1b2c3").is_err());
        assert!(CaretColor::parse("#xyzxyz").is_err());
        assert!(CaretColor::parse("#fff").is_err());
    }

    // ── 2. compose folds field updates into begins ──────────────────────

    #[test]
    fn compose_folds_set_into_begin() {
        let a = CaretDelta::new().begin(caret("s1", 0));
        let b = CaretDelta::new().set(sid("s1"), CaretField::Index(7));
        let out = a.compose(&b, true);
        assert_eq!(out.ops().len(), 1);
        assert!(matches!(&out.ops()[0], CaretOp::Begin { caret } if caret.index == 7));
    }

    #[test]
    fn compose_end_removes_session() {
        let a = CaretDelta::new()
            .begin(caret("s1", 0))
            .begin(caret("s2", 3));
        let b = CaretDelta::new().end(sid("s1"));
        let out = a.compose(&b, true);
        assert!(out.is_document());
        assert_eq!(out.ops().len(), 1);
        assert_eq!(out.ops()[0].session_id(), &sid("s2"));
    }

    #[test]
    fn compose_keeps_carrier_ops_when_not_document() {
        let a = CaretDelta::new().set(sid("s1"), CaretField::Index(1));
        let b = CaretDelta::new().end(sid("s2"));
        let out = a.compose(&b, false);
        assert_eq!(out.ops().len(), 2);
        let doc = a.compose(&b, true);
        assert!(doc.is_empty());
    }

    // ── 3. transform rules ──────────────────────────────────────────────

    #[test]
    fn transform_drops_ops_on_ended_sessions() {
        let a = CaretDelta::new().end(sid("s1"));
        let b = CaretDelta::new()
            .set(sid("s1"), CaretField::Index(4))
            .set(sid("s2"), CaretField::Index(9));
        let out = a.transform(&b, false);
        assert_eq!(out.ops().len(), 1);
        assert_eq!(out.ops()[0].session_id(), &sid("s2"));
    }

    #[test]
    fn transform_same_field_race_respects_flag() {
        let a = CaretDelta::new().set(sid("s1"), CaretField::Index(1));
        let b = CaretDelta::new().set(sid("s1"), CaretField::Index(2));
        assert!(a.transform(&b, false).is_empty());
        assert_eq!(a.transform(&b, true), b);
    }

    #[test]
    fn transform_converges_on_same_field_race() {
        let base = CaretDelta::new().begin(caret("s1", 0));
        let a = CaretDelta::new().set(sid("s1"), CaretField::Index(1));
        let b = CaretDelta::new().set(sid("s1"), CaretField::Index(2));
        let left = base.compose(&a, false).compose(&a.transform(&b, true), true);
        let right = base.compose(&b, false).compose(&b.transform(&a, false), true);
        assert_eq!(left, right);
    }

    // ── 4. document form requires unique begins ─────────────────────────

    #[test]
    fn document_form_uniqueness() {
        let ok = CaretDelta::new()
            .begin(caret("s1", 0))
            .begin(caret("s2", 0));
        assert!(ok.is_document());
        let dup = CaretDelta::new()
            .begin(caret("s1", 0))
            .begin(caret("s1", 1));
        assert!(!dup.is_document());
        let with_end = CaretDelta::new().end(sid("s1"));
        assert!(!with_end.is_document());
    }

    // ── 5. snapshot indexing ────────────────────────────────────────────

    #[test]
    fn caret_snapshot_round_trip() {
        let delta = CaretDelta::new()
            .begin(caret("s1", 2))
            .begin(caret("s2", 5));
        let snap = Snapshot {
            rev_num: RevNum::from_raw(9),
            contents: delta,
        };
        let view = CaretSnapshot::from_snapshot(&snap).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(&sid("s2")).unwrap().index, 5);
        let back = view.into_snapshot();
        assert_eq!(back, snap);
    }
}
