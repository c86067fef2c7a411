// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Rich-text body deltas: retain / insert / delete with attribute maps.
//!
//! Lengths count Unicode scalar values. Canonical form is maintained by the
//! builder: zero-length operations are dropped, adjacent operations of the
//! same kind with equal attributes merge, and an insert adjacent to a delete
//! is ordered insert-first. Canonical form makes structural equality
//! meaningful for document-form deltas, which is what snapshot comparisons
//! rely on.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};

use crate::attrs::{compose_attrs, transform_attrs, Attrs};
use crate::Payload;

/// One rich-text operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyOp {
    /// Skip `len` characters of the base, optionally annotating them.
    Retain {
        /// Character count to skip.
        len: usize,
        /// Attribute updates applied to the retained span.
        attrs: Option<Attrs>,
    },
    /// Insert text at the current position.
    Insert {
        /// The inserted text.
        text: String,
        /// Attributes of the inserted text.
        attrs: Option<Attrs>,
    },
    /// Delete `len` characters of the base.
    Delete {
        /// Character count to delete.
        len: usize,
    },
}

impl BodyOp {
    /// Operation length in characters.
    pub fn len(&self) -> usize {
        match self {
            Self::Retain { len, .. } | Self::Delete { len } => *len,
            Self::Insert { text, .. } => text.chars().count(),
        }
    }

    /// `true` for zero-length operations (dropped by the builder).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for BodyOp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Retain { len, attrs } => {
                let mut m = serializer.serialize_map(Some(1 + usize::from(attrs.is_some())))?;
                m.serialize_entry("retain", len)?;
                if let Some(attrs) = attrs {
                    m.serialize_entry("attributes", attrs)?;
                }
                m.end()
            }
            Self::Insert { text, attrs } => {
                let mut m = serializer.serialize_map(Some(1 + usize::from(attrs.is_some())))?;
                m.serialize_entry("insert", text)?;
                if let Some(attrs) = attrs {
                    m.serialize_entry("attributes", attrs)?;
                }
                m.end()
            }
            Self::Delete { len } => {
                let mut m = serializer.serialize_map(Some(1))?;
                m.serialize_entry("delete", len)?;
                m.end()
            }
        }
    }
}

/// Raw wire shape of a body op; exactly one of the three keys must be set.
#[derive(Deserialize)]
struct RawBodyOp {
    retain: Option<usize>,
    insert: Option<String>,
    delete: Option<usize>,
    attributes: Option<Attrs>,
}

impl<'de> Deserialize<'de> for BodyOp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as DeError;
        let raw = RawBodyOp::deserialize(deserializer)?;
        match (raw.retain, raw.insert, raw.delete) {
            (Some(len), None, None) => Ok(Self::Retain {
                len,
                attrs: raw.attributes,
            }),
            (None, Some(text), None) => Ok(Self::Insert {
                text,
                attrs: raw.attributes,
            }),
            (None, None, Some(len)) => {
                if raw.attributes.is_some() {
                    return Err(DeError::custom("delete op cannot carry attributes"));
                }
                Ok(Self::Delete { len })
            }
            _ => Err(DeError::custom(
                "body op must set exactly one of retain/insert/delete",
            )),
        }
    }
}

/// A sequence of body operations in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyDelta {
    ops: Vec<BodyOp>,
}

impl BodyDelta {
    /// The empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// A document-form delta holding plain `text`.
    pub fn document(text: impl Into<String>) -> Self {
        Self::new().insert(text)
    }

    /// The operations, in order.
    pub fn ops(&self) -> &[BodyOp] {
        &self.ops
    }

    /// Appends a retain without attributes.
    pub fn retain(mut self, len: usize) -> Self {
        self.push(BodyOp::Retain { len, attrs: None });
        self
    }

    /// Appends a retain annotating the span with `attrs`.
    pub fn retain_attrs(mut self, len: usize, attrs: Attrs) -> Self {
        self.push(BodyOp::Retain {
            len,
            attrs: Some(attrs).filter(|a| !a.is_empty()),
        });
        self
    }

    /// Appends a plain text insert.
    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(BodyOp::Insert {
            text: text.into(),
            attrs: None,
        });
        self
    }

    /// Appends an attributed text insert.
    pub fn insert_attrs(mut self, text: impl Into<String>, attrs: Attrs) -> Self {
        self.push(BodyOp::Insert {
            text: text.into(),
            attrs: Some(attrs).filter(|a| !a.is_empty()),
        });
        self
    }

    /// Appends a delete.
    pub fn delete(mut self, len: usize) -> Self {
        self.push(BodyOp::Delete { len });
        self
    }

    /// Characters of base document this delta consumes.
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BodyOp::Retain { len, .. } | BodyOp::Delete { len } => *len,
                BodyOp::Insert { .. } => 0,
            })
            .sum()
    }

    /// Characters of output document this delta produces.
    pub fn result_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BodyOp::Retain { len, .. } => *len,
                BodyOp::Insert { text, .. } => text.chars().count(),
                BodyOp::Delete { .. } => 0,
            })
            .sum()
    }

    /// Concatenated text of a document-form delta, `None` otherwise.
    pub fn document_text(&self) -> Option<String> {
        if !self.is_document() {
            return None;
        }
        let mut out = String::new();
        for op in &self.ops {
            if let BodyOp::Insert { text, .. } = op {
                out.push_str(text);
            }
        }
        Some(out)
    }

    /// Pushes an op, preserving canonical form.
    fn push(&mut self, op: BodyOp) {
        if op.is_empty() {
            return;
        }
        // Canonical ordering: an insert at the same position as a delete goes
        // before the delete.
        let mut at = self.ops.len();
        if matches!(op, BodyOp::Insert { .. }) {
            while at > 0 && matches!(self.ops[at - 1], BodyOp::Delete { .. }) {
                at -= 1;
            }
        }
        if at > 0 && try_merge(&mut self.ops[at - 1], &op) {
            return;
        }
        self.ops.insert(at, op);
    }

    /// Drops meaningless trailing retains.
    ///
    /// `to_document` additionally drops attributed trailing retains, which
    /// cannot appear in document form.
    fn chop(&mut self, to_document: bool) {
        while let Some(last) = self.ops.last() {
            match last {
                BodyOp::Retain { attrs: None, .. } => {
                    self.ops.pop();
                }
                BodyOp::Retain { attrs: Some(_), .. } if to_document => {
                    self.ops.pop();
                }
                _ => break,
            }
        }
    }
}

impl Payload for BodyDelta {
    fn empty() -> Self {
        Self::new()
    }

    fn compose(&self, other: &Self, want_document: bool) -> Self {
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = Self::new();
        while a.has_next() || b.has_next() {
            if b.peek_is_insert() {
                out.push(b.take(usize::MAX));
                continue;
            }
            if a.peek_is_delete() {
                out.push(a.take(usize::MAX));
                continue;
            }
            if !b.has_next() {
                // Remaining retains/inserts of `self` pass through.
                out.push(a.take(usize::MAX));
                continue;
            }
            if !a.has_next() {
                // `other` reaches past the output of `self`; pass through.
                out.push(b.take(usize::MAX));
                continue;
            }
            let n = a.peek_len().min(b.peek_len());
            let a_op = a.take(n);
            let b_op = b.take(n);
            match (a_op, b_op) {
                (BodyOp::Retain { attrs: aa, .. }, BodyOp::Retain { attrs: ba, .. }) => {
                    out.push(BodyOp::Retain {
                        len: n,
                        attrs: compose_attrs(aa.as_ref(), ba.as_ref(), true),
                    });
                }
                (BodyOp::Insert { text, attrs: aa }, BodyOp::Retain { attrs: ba, .. }) => {
                    out.push(BodyOp::Insert {
                        text,
                        attrs: compose_attrs(aa.as_ref(), ba.as_ref(), false),
                    });
                }
                (BodyOp::Retain { .. }, BodyOp::Delete { .. }) => {
                    out.push(BodyOp::Delete { len: n });
                }
                (BodyOp::Insert { .. }, BodyOp::Delete { .. }) => {
                    // Insert cancelled by the following delete.
                }
                // Cursor discipline rules these out: `a` never yields deletes
                // here and `b` never yields inserts.
                (a_op, b_op) => {
                    debug_assert!(false, "compose cursor invariant: {a_op:?} / {b_op:?}");
                }
            }
        }
        out.chop(want_document);
        out
    }

    fn transform(&self, other: &Self, other_first: bool) -> Self {
        let self_priority = !other_first;
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = Self::new();
        while a.has_next() || b.has_next() {
            if a.peek_is_insert() && (self_priority || !b.peek_is_insert()) {
                // Step over this delta's insertion.
                out.push(BodyOp::Retain {
                    len: a.take(usize::MAX).len(),
                    attrs: None,
                });
                continue;
            }
            if b.peek_is_insert() {
                out.push(b.take(usize::MAX));
                continue;
            }
            if !b.has_next() {
                break;
            }
            if !a.has_next() {
                out.push(b.take(usize::MAX));
                continue;
            }
            let n = a.peek_len().min(b.peek_len());
            let a_op = a.take(n);
            let b_op = b.take(n);
            match (a_op, b_op) {
                (BodyOp::Delete { .. }, _) => {
                    // The span `other` acted on no longer exists.
                }
                (BodyOp::Retain { .. }, BodyOp::Delete { .. }) => {
                    out.push(BodyOp::Delete { len: n });
                }
                (BodyOp::Retain { attrs: aa, .. }, BodyOp::Retain { attrs: ba, .. }) => {
                    out.push(BodyOp::Retain {
                        len: n,
                        attrs: transform_attrs(aa.as_ref(), ba.as_ref(), other_first),
                    });
                }
                (a_op, b_op) => {
                    debug_assert!(false, "transform cursor invariant: {a_op:?} / {b_op:?}");
                }
            }
        }
        out.chop(false);
        out
    }

    fn is_document(&self) -> bool {
        self.ops
            .iter()
            .all(|op| matches!(op, BodyOp::Insert { .. }))
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Merges `op` into `prev` when kinds and attributes line up.
fn try_merge(prev: &mut BodyOp, op: &BodyOp) -> bool {
    match (prev, op) {
        (
            BodyOp::Retain { len, attrs },
            BodyOp::Retain {
                len: add,
                attrs: new_attrs,
            },
        ) if attrs == new_attrs => {
            *len += *add;
            true
        }
        (
            BodyOp::Insert { text, attrs },
            BodyOp::Insert {
                text: more,
                attrs: new_attrs,
            },
        ) if attrs == new_attrs => {
            text.push_str(more);
            true
        }
        (BodyOp::Delete { len }, BodyOp::Delete { len: add }) => {
            *len += *add;
            true
        }
        _ => false,
    }
}

/// Splitting cursor over an op sequence.
///
/// `take(n)` yields up to `n` characters of the current op, splitting it when
/// necessary; `usize::MAX` takes the rest of the current op.
struct OpCursor<'a> {
    ops: &'a [BodyOp],
    idx: usize,
    offset: usize,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [BodyOp]) -> Self {
        Self {
            ops,
            idx: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.idx < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        self.ops
            .get(self.idx)
            .map_or(usize::MAX, |op| op.len() - self.offset)
    }

    fn peek_is_insert(&self) -> bool {
        matches!(self.ops.get(self.idx), Some(BodyOp::Insert { .. }))
    }

    fn peek_is_delete(&self) -> bool {
        matches!(self.ops.get(self.idx), Some(BodyOp::Delete { .. }))
    }

    fn take(&mut self, n: usize) -> BodyOp {
        let Some(op) = self.ops.get(self.idx) else {
            // Past the end: an infinite implicit retain, as if the sequence
            // were padded to any length the counterpart needs.
            return BodyOp::Retain {
                len: if n == usize::MAX { 0 } else { n },
                attrs: None,
            };
        };
        let avail = op.len() - self.offset;
        let taken = n.min(avail);
        let piece = match op {
            BodyOp::Retain { attrs, .. } => BodyOp::Retain {
                len: taken,
                attrs: attrs.clone(),
            },
            BodyOp::Delete { .. } => BodyOp::Delete { len: taken },
            BodyOp::Insert { text, attrs } => BodyOp::Insert {
                text: text.chars().skip(self.offset).take(taken).collect(),
                attrs: attrs.clone(),
            },
        };
        self.offset += taken;
        if self.offset >= op.len() {
            self.idx += 1;
            self.offset = 0;
        }
        piece
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bold() -> Attrs {
        [("bold".to_owned(), json!(true))].into_iter().collect()
    }

    fn doc(text: &str) -> BodyDelta {
        BodyDelta::document(text)
    }

    // ── 1. builder canonical form ───────────────────────────────────────

    #[test]
    fn builder_merges_adjacent_ops() {
        let d = BodyDelta::new().insert("ab").insert("cd").retain(0).delete(2).delete(1);
        assert_eq!(
            d.ops(),
            &[
                BodyOp::Insert {
                    text: "abcd".into(),
                    attrs: None
                },
                BodyOp::Delete { len: 3 },
            ]
        );
    }

    #[test]
    fn builder_orders_insert_before_delete() {
        let d = BodyDelta::new().retain(1).delete(2).insert("x");
        assert_eq!(
            d.ops(),
            &[
                BodyOp::Retain {
                    len: 1,
                    attrs: None
                },
                BodyOp::Insert {
                    text: "x".into(),
                    attrs: None
                },
                BodyOp::Delete { len: 2 },
            ]
        );
    }

    // ── 2. compose basics ───────────────────────────────────────────────

    #[test]
    fn compose_document_and_insert() {
        let base = doc("hello");
        let change = BodyDelta::new().retain(5).insert(" world");
        let next = base.compose(&change, true);
        assert_eq!(next.document_text().unwrap(), "hello world");
    }

    #[test]
    fn compose_delete_cancels_insert() {
        let a = BodyDelta::new().insert("abc");
        let b = BodyDelta::new().delete(1).retain(2);
        let out = a.compose(&b, true);
        assert_eq!(out.document_text().unwrap(), "bc");
    }

    #[test]
    fn compose_attribute_layering() {
        let base = doc("hi");
        let annotate = BodyDelta::new().retain_attrs(2, bold());
        let out = base.compose(&annotate, true);
        assert_eq!(
            out.ops(),
            &[BodyOp::Insert {
                text: "hi".into(),
                attrs: Some(bold())
            }]
        );
    }

    #[test]
    fn compose_is_associative() {
        let a = doc("abcd");
        let b = BodyDelta::new().retain(2).insert("XY").delete(1);
        let c = BodyDelta::new().retain(1).delete(2).insert("z");
        let left = a.compose(&b, false).compose(&c, true);
        let right = a.compose(&b.compose(&c, false), true);
        assert_eq!(left.document_text(), right.document_text());
    }

    #[test]
    fn compose_with_empty_is_identity() {
        let a = BodyDelta::new().retain(2).insert("x").delete(1);
        assert_eq!(a.compose(&BodyDelta::new(), false), a);
        assert_eq!(BodyDelta::new().compose(&a, false), a);
    }

    // ── 3. transform basics ─────────────────────────────────────────────

    #[test]
    fn transform_shifts_past_concurrent_insert() {
        // Base "hello"; a inserts " world" at 5, b inserts "!" at 5.
        let a = BodyDelta::new().retain(5).insert(" world");
        let b = BodyDelta::new().retain(5).insert("!");
        // a committed first, b must shift past a's insert.
        let b_shifted = a.transform(&b, false);
        assert_eq!(b_shifted, BodyDelta::new().retain(11).insert("!"));
        // With the other tie-break, b lands at the original index.
        let b_kept = a.transform(&b, true);
        assert_eq!(b_kept, BodyDelta::new().retain(5).insert("!"));
    }

    #[test]
    fn transform_over_delete_drops_moot_ops() {
        // a deletes chars 0..3; b retains 1 and annotates char 1..2.
        let a = BodyDelta::new().delete(3);
        let b = BodyDelta::new().retain(1).retain_attrs(1, bold());
        let out = a.transform(&b, false);
        assert!(out.is_empty());
    }

    #[test]
    fn transform_delete_against_insert() {
        // Base "abc"; a inserts "X" at 0; b deletes "abc".
        let a = BodyDelta::new().insert("X");
        let b = BodyDelta::new().delete(3);
        let out = a.transform(&b, false);
        assert_eq!(out, BodyDelta::new().retain(1).delete(3));
    }

    // ── 4. TP1 convergence ──────────────────────────────────────────────

    fn assert_tp1(base: &BodyDelta, a: &BodyDelta, b: &BodyDelta) {
        let left = base
            .compose(a, false)
            .compose(&a.transform(b, true), true);
        let right = base
            .compose(b, false)
            .compose(&b.transform(a, false), true);
        assert_eq!(left, right, "TP1 divergence: a={a:?} b={b:?}");
    }

    #[test]
    fn tp1_concurrent_inserts_same_position() {
        let base = doc("hello");
        let a = BodyDelta::new().retain(5).insert(" world");
        let b = BodyDelta::new().retain(5).insert("!");
        assert_tp1(&base, &a, &b);
    }

    #[test]
    fn tp1_insert_vs_delete_overlap() {
        let base = doc("abcdef");
        let a = BodyDelta::new().retain(2).delete(3);
        let b = BodyDelta::new().retain(4).insert("XY");
        assert_tp1(&base, &a, &b);
    }

    #[test]
    fn tp1_overlapping_deletes() {
        let base = doc("abcdef");
        let a = BodyDelta::new().retain(1).delete(3);
        let b = BodyDelta::new().retain(2).delete(3);
        assert_tp1(&base, &a, &b);
    }

    #[test]
    fn tp1_attribute_conflicts() {
        let base = doc("abcd");
        let a = BodyDelta::new().retain_attrs(3, bold());
        let mut italics = Attrs::new();
        italics.insert("bold".into(), json!(false));
        italics.insert("italic".into(), json!(true));
        let b = BodyDelta::new().retain(1).retain_attrs(3, italics);
        assert_tp1(&base, &a, &b);
    }

    #[test]
    fn tp1_grid_of_small_edits() {
        let base = doc("abcde");
        let edits = [
            BodyDelta::new().insert("Q"),
            BodyDelta::new().retain(2).insert("mm"),
            BodyDelta::new().retain(1).delete(2),
            BodyDelta::new().delete(4).insert("z"),
            BodyDelta::new().retain(3).delete(2).insert("!!"),
        ];
        for a in &edits {
            for b in &edits {
                assert_tp1(&base, a, b);
            }
        }
    }

    // ── 5. document predicate and text ──────────────────────────────────

    #[test]
    fn document_predicate() {
        assert!(doc("x").is_document());
        assert!(BodyDelta::new().is_document());
        assert!(!BodyDelta::new().retain(1).insert("x").is_document());
        assert_eq!(doc("héllo").result_len(), 5);
    }

    // ── 6. wire shape ───────────────────────────────────────────────────

    #[test]
    fn ops_serialize_like_editor_deltas() {
        let d = BodyDelta::new()
            .retain(2)
            .insert_attrs("hi", bold())
            .delete(1);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(
            json,
            json!([
                {"retain": 2},
                {"insert": "hi", "attributes": {"bold": true}},
                {"delete": 1},
            ])
        );
        let back: BodyDelta = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn malformed_ops_rejected() {
        assert!(serde_json::from_value::<BodyOp>(json!({"retain": 1, "delete": 1})).is_err());
        assert!(serde_json::from_value::<BodyOp>(json!({"delete": 1, "attributes": {}})).is_err());
        assert!(serde_json::from_value::<BodyOp>(json!({})).is_err());
    }
}
