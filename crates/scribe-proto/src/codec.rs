// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Constructor-dispatch codec for model types.
//!
//! Every registered type encodes as a single-key object whose key is the
//! type name and whose value is the constructor-argument array:
//!
//! ```text
//! {"Timestamp": [1712345678901]}
//! {"BodyChange": [4, {"BodyDelta": [[{"retain":2},{"insert":"hi"}]]}, null, "alice"]}
//! ```
//!
//! Decoding dispatches on the tag and re-validates every field — the peer's
//! delta library may not be this one, and a divergent shape must surface as
//! `badData`, not as a half-decoded value.
//!
//! The codec is a plain value handed to each connection at construction;
//! there is no process-wide registry.

use serde_json::{json, Value};

use scribe_delta::{
    AuthorId, BodyDelta, BodyOp, Caret, CaretColor, CaretDelta, CaretField, CaretOp,
    CaretSnapshot, Change, PropertyDelta, PropertyOp, RevNum, SessionId, Snapshot, Timestamp,
};

use crate::ProtoError;

/// The codec. Stateless; cheap to copy into every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec {
    /// Constructs a codec.
    pub fn new() -> Self {
        Self
    }

    // ── tagging ─────────────────────────────────────────────────────────

    fn tag(name: &str, args: Vec<Value>) -> Value {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(name.to_owned(), Value::Array(args));
        Value::Object(map)
    }

    fn untag<'a>(value: &'a Value, expect: &str) -> Result<&'a [Value], ProtoError> {
        let map = value
            .as_object()
            .ok_or_else(|| ProtoError::BadData(format!("expected tagged object, got {value}")))?;
        if map.len() != 1 {
            return Err(ProtoError::BadData(
                "tagged object must have exactly one key".into(),
            ));
        }
        let (tag, args) = map
            .iter()
            .next()
            .ok_or_else(|| ProtoError::BadData("tagged object must have one key".into()))?;
        if tag != expect {
            return Err(ProtoError::UnknownTag(tag.clone()));
        }
        args.as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| ProtoError::BadData(format!("{tag} args must be an array")))
    }

    fn args_exactly<'a>(
        args: &'a [Value],
        n: usize,
        what: &str,
    ) -> Result<&'a [Value], ProtoError> {
        if args.len() == n {
            Ok(args)
        } else {
            Err(ProtoError::BadData(format!(
                "{what} takes {n} args, got {}",
                args.len()
            )))
        }
    }

    // ── scalars ─────────────────────────────────────────────────────────

    /// Encodes a timestamp.
    pub fn encode_timestamp(self, ts: Timestamp) -> Value {
        Self::tag("Timestamp", vec![json!(ts.as_msec())])
    }

    /// Decodes a timestamp.
    pub fn decode_timestamp(self, value: &Value) -> Result<Timestamp, ProtoError> {
        let args = Self::untag(value, "Timestamp")?;
        let args = Self::args_exactly(args, 1, "Timestamp")?;
        Ok(Timestamp::from_msec(as_u64(&args[0], "timestamp msec")?))
    }

    // ── body payloads ───────────────────────────────────────────────────

    /// Encodes a body delta.
    pub fn encode_body_delta(self, delta: &BodyDelta) -> Value {
        let ops = serde_json::to_value(delta.ops()).unwrap_or(Value::Null);
        Self::tag("BodyDelta", vec![ops])
    }

    /// Decodes a body delta, re-validating op shape.
    pub fn decode_body_delta(self, value: &Value) -> Result<BodyDelta, ProtoError> {
        let args = Self::untag(value, "BodyDelta")?;
        let args = Self::args_exactly(args, 1, "BodyDelta")?;
        let ops: Vec<BodyOp> = serde_json::from_value(args[0].clone())
            .map_err(|err| ProtoError::BadData(format!("body ops: {err}")))?;
        let mut delta = BodyDelta::new();
        for op in ops {
            delta = match op {
                BodyOp::Retain { len, attrs: None } => delta.retain(len),
                BodyOp::Retain {
                    len,
                    attrs: Some(attrs),
                } => delta.retain_attrs(len, attrs),
                BodyOp::Insert { text, attrs: None } => delta.insert(text),
                BodyOp::Insert {
                    text,
                    attrs: Some(attrs),
                } => delta.insert_attrs(text, attrs),
                BodyOp::Delete { len } => delta.delete(len),
            };
        }
        Ok(delta)
    }

    /// Encodes a body change.
    pub fn encode_body_change(self, change: &Change<BodyDelta>) -> Value {
        self.encode_change("BodyChange", change, |delta| self.encode_body_delta(delta))
    }

    /// Decodes a body change.
    pub fn decode_body_change(self, value: &Value) -> Result<Change<BodyDelta>, ProtoError> {
        self.decode_change(value, "BodyChange", |v| self.decode_body_delta(v))
    }

    /// Encodes a body snapshot.
    pub fn encode_body_snapshot(self, snap: &Snapshot<BodyDelta>) -> Value {
        Self::tag(
            "BodySnapshot",
            vec![
                json!(snap.rev_num.value()),
                self.encode_body_delta(&snap.contents),
            ],
        )
    }

    /// Decodes a body snapshot.
    pub fn decode_body_snapshot(self, value: &Value) -> Result<Snapshot<BodyDelta>, ProtoError> {
        let args = Self::untag(value, "BodySnapshot")?;
        let args = Self::args_exactly(args, 2, "BodySnapshot")?;
        Ok(Snapshot {
            rev_num: RevNum::from_raw(as_u64(&args[0], "snapshot revision")?),
            contents: self.decode_body_delta(&args[1])?,
        })
    }

    // ── caret payloads ──────────────────────────────────────────────────

    /// Encodes a caret.
    pub fn encode_caret(self, caret: &Caret) -> Value {
        Self::tag(
            "Caret",
            vec![
                json!(caret.session_id.as_str()),
                json!(caret.author_id.as_str()),
                json!(caret.rev_num.value()),
                json!(caret.index),
                json!(caret.length),
                json!(caret.color.to_string()),
                json!(caret.last_active.as_msec()),
            ],
        )
    }

    /// Decodes a caret, re-validating every field.
    pub fn decode_caret(self, value: &Value) -> Result<Caret, ProtoError> {
        let args = Self::untag(value, "Caret")?;
        let args = Self::args_exactly(args, 7, "Caret")?;
        Ok(Caret {
            session_id: decode_session_id(&args[0])?,
            author_id: AuthorId::new(as_str(&args[1], "author id")?)
                .map_err(|err| ProtoError::BadData(err.to_string()))?,
            rev_num: RevNum::from_raw(as_u64(&args[2], "caret revision")?),
            index: as_usize(&args[3], "caret index")?,
            length: as_usize(&args[4], "caret length")?,
            color: CaretColor::parse(as_str(&args[5], "caret color")?)
                .map_err(|err| ProtoError::BadData(err.to_string()))?,
            last_active: Timestamp::from_msec(as_u64(&args[6], "caret lastActive")?),
        })
    }

    /// Encodes a caret delta.
    pub fn encode_caret_delta(self, delta: &CaretDelta) -> Value {
        let ops: Vec<Value> = delta
            .ops()
            .iter()
            .map(|op| match op {
                CaretOp::Begin { caret } => json!({ "begin": self.encode_caret(caret) }),
                CaretOp::End { session_id } => json!({ "end": session_id.as_str() }),
                CaretOp::Set { session_id, field } => {
                    let (key, value) = encode_caret_field(field);
                    json!({ "set": [session_id.as_str(), key, value] })
                }
            })
            .collect();
        Self::tag("CaretDelta", vec![Value::Array(ops)])
    }

    /// Decodes a caret delta.
    pub fn decode_caret_delta(self, value: &Value) -> Result<CaretDelta, ProtoError> {
        let args = Self::untag(value, "CaretDelta")?;
        let args = Self::args_exactly(args, 1, "CaretDelta")?;
        let ops = args[0]
            .as_array()
            .ok_or_else(|| ProtoError::BadData("caret ops must be an array".into()))?;
        let mut delta = CaretDelta::new();
        for op in ops {
            let map = op
                .as_object()
                .filter(|m| m.len() == 1)
                .ok_or_else(|| ProtoError::BadData(format!("malformed caret op {op}")))?;
            let (kind, body) = map
                .iter()
                .next()
                .ok_or_else(|| ProtoError::BadData("empty caret op".into()))?;
            delta = match kind.as_str() {
                "begin" => delta.begin(self.decode_caret(body)?),
                "end" => delta.end(decode_session_id(body)?),
                "set" => {
                    let parts = body
                        .as_array()
                        .filter(|a| a.len() == 3)
                        .ok_or_else(|| ProtoError::BadData("caret set takes 3 args".into()))?;
                    delta.set(
                        decode_session_id(&parts[0])?,
                        decode_caret_field(&parts[1], &parts[2])?,
                    )
                }
                other => return Err(ProtoError::BadData(format!("unknown caret op {other:?}"))),
            };
        }
        Ok(delta)
    }

    /// Encodes a caret change.
    pub fn encode_caret_change(self, change: &Change<CaretDelta>) -> Value {
        self.encode_change("CaretChange", change, |delta| {
            self.encode_caret_delta(delta)
        })
    }

    /// Decodes a caret change.
    pub fn decode_caret_change(self, value: &Value) -> Result<Change<CaretDelta>, ProtoError> {
        self.decode_change(value, "CaretChange", |v| self.decode_caret_delta(v))
    }

    /// Encodes an indexed caret snapshot.
    pub fn encode_caret_snapshot(self, snap: &CaretSnapshot) -> Value {
        let carets: Vec<Value> = snap.carets().map(|c| self.encode_caret(c)).collect();
        Self::tag(
            "CaretSnapshot",
            vec![json!(snap.rev_num.value()), Value::Array(carets)],
        )
    }

    /// Decodes an indexed caret snapshot, enforcing session-id uniqueness.
    pub fn decode_caret_snapshot(self, value: &Value) -> Result<CaretSnapshot, ProtoError> {
        let args = Self::untag(value, "CaretSnapshot")?;
        let args = Self::args_exactly(args, 2, "CaretSnapshot")?;
        let rev_num = RevNum::from_raw(as_u64(&args[0], "caret snapshot revision")?);
        let carets = args[1]
            .as_array()
            .ok_or_else(|| ProtoError::BadData("caret snapshot carets must be an array".into()))?;
        let mut delta = CaretDelta::new();
        for caret in carets {
            delta = delta.begin(self.decode_caret(caret)?);
        }
        let snap = Snapshot {
            rev_num,
            contents: delta,
        };
        CaretSnapshot::from_snapshot(&snap).map_err(|err| ProtoError::BadData(err.to_string()))
    }

    // ── property payloads ───────────────────────────────────────────────

    /// Encodes a property delta.
    pub fn encode_property_delta(self, delta: &PropertyDelta) -> Value {
        let ops: Vec<Value> = delta
            .ops()
            .iter()
            .map(|op| match op {
                PropertyOp::Set { key, value } => json!({ "set": [key, value] }),
                PropertyOp::Delete { key } => json!({ "delete": key }),
            })
            .collect();
        Self::tag("PropertyDelta", vec![Value::Array(ops)])
    }

    /// Decodes a property delta.
    pub fn decode_property_delta(self, value: &Value) -> Result<PropertyDelta, ProtoError> {
        let args = Self::untag(value, "PropertyDelta")?;
        let args = Self::args_exactly(args, 1, "PropertyDelta")?;
        let ops = args[0]
            .as_array()
            .ok_or_else(|| ProtoError::BadData("property ops must be an array".into()))?;
        let mut delta = PropertyDelta::new();
        for op in ops {
            let map = op
                .as_object()
                .filter(|m| m.len() == 1)
                .ok_or_else(|| ProtoError::BadData(format!("malformed property op {op}")))?;
            let (kind, body) = map
                .iter()
                .next()
                .ok_or_else(|| ProtoError::BadData("empty property op".into()))?;
            delta = match kind.as_str() {
                "set" => {
                    let parts = body
                        .as_array()
                        .filter(|a| a.len() == 2)
                        .ok_or_else(|| ProtoError::BadData("property set takes 2 args".into()))?;
                    let key = as_str(&parts[0], "property key")?;
                    delta.set(key, parts[1].clone())
                }
                "delete" => delta.delete(as_str(body, "property key")?),
                other => {
                    return Err(ProtoError::BadData(format!("unknown property op {other:?}")))
                }
            };
        }
        Ok(delta)
    }

    /// Encodes a property change.
    pub fn encode_property_change(self, change: &Change<PropertyDelta>) -> Value {
        self.encode_change("PropertyChange", change, |delta| {
            self.encode_property_delta(delta)
        })
    }

    /// Decodes a property change.
    pub fn decode_property_change(
        self,
        value: &Value,
    ) -> Result<Change<PropertyDelta>, ProtoError> {
        self.decode_change(value, "PropertyChange", |v| self.decode_property_delta(v))
    }

    /// Encodes a property snapshot.
    pub fn encode_property_snapshot(self, snap: &Snapshot<PropertyDelta>) -> Value {
        Self::tag(
            "PropertySnapshot",
            vec![
                json!(snap.rev_num.value()),
                self.encode_property_delta(&snap.contents),
            ],
        )
    }

    /// Decodes a property snapshot.
    pub fn decode_property_snapshot(
        self,
        value: &Value,
    ) -> Result<Snapshot<PropertyDelta>, ProtoError> {
        let args = Self::untag(value, "PropertySnapshot")?;
        let args = Self::args_exactly(args, 2, "PropertySnapshot")?;
        Ok(Snapshot {
            rev_num: RevNum::from_raw(as_u64(&args[0], "snapshot revision")?),
            contents: self.decode_property_delta(&args[1])?,
        })
    }

    // ── change plumbing ─────────────────────────────────────────────────

    fn encode_change<P>(
        self,
        tag: &str,
        change: &Change<P>,
        encode_delta: impl Fn(&P) -> Value,
    ) -> Value {
        Self::tag(
            tag,
            vec![
                json!(change.rev_num.value()),
                encode_delta(&change.delta),
                change
                    .timestamp
                    .map_or(Value::Null, |ts| self.encode_timestamp(ts)),
                change
                    .author_id
                    .as_ref()
                    .map_or(Value::Null, |author| json!(author.as_str())),
            ],
        )
    }

    fn decode_change<P>(
        self,
        value: &Value,
        tag: &str,
        decode_delta: impl Fn(&Value) -> Result<P, ProtoError>,
    ) -> Result<Change<P>, ProtoError> {
        let args = Self::untag(value, tag)?;
        let args = Self::args_exactly(args, 4, tag)?;
        let timestamp = if args[2].is_null() {
            None
        } else {
            Some(self.decode_timestamp(&args[2])?)
        };
        let author_id = if args[3].is_null() {
            None
        } else {
            Some(
                AuthorId::new(as_str(&args[3], "author id")?)
                    .map_err(|err| ProtoError::BadData(err.to_string()))?,
            )
        };
        Ok(Change {
            rev_num: RevNum::from_raw(as_u64(&args[0], "change revision")?),
            delta: decode_delta(&args[1])?,
            timestamp,
            author_id,
        })
    }
}

// ── field helpers ───────────────────────────────────────────────────────

fn as_u64(value: &Value, what: &str) -> Result<u64, ProtoError> {
    value
        .as_u64()
        .ok_or_else(|| ProtoError::BadData(format!("{what} must be a non-negative integer")))
}

fn as_usize(value: &Value, what: &str) -> Result<usize, ProtoError> {
    usize::try_from(as_u64(value, what)?)
        .map_err(|_| ProtoError::BadData(format!("{what} out of range")))
}

fn as_str<'a>(value: &'a Value, what: &str) -> Result<&'a str, ProtoError> {
    value
        .as_str()
        .ok_or_else(|| ProtoError::BadData(format!("{what} must be a string")))
}

fn decode_session_id(value: &Value) -> Result<SessionId, ProtoError> {
    SessionId::new(as_str(value, "session id")?)
        .map_err(|err| ProtoError::BadData(err.to_string()))
}

fn encode_caret_field(field: &CaretField) -> (&'static str, Value) {
    match field {
        CaretField::RevNum(rev) => ("revNum", json!(rev.value())),
        CaretField::Index(index) => ("index", json!(index)),
        CaretField::Length(length) => ("length", json!(length)),
        CaretField::LastActive(ts) => ("lastActive", json!(ts.as_msec())),
    }
}

fn decode_caret_field(key: &Value, value: &Value) -> Result<CaretField, ProtoError> {
    match as_str(key, "caret field key")? {
        "revNum" => Ok(CaretField::RevNum(RevNum::from_raw(as_u64(
            value, "revNum",
        )?))),
        "index" => Ok(CaretField::Index(as_usize(value, "index")?)),
        "length" => Ok(CaretField::Length(as_usize(value, "length")?)),
        "lastActive" => Ok(CaretField::LastActive(Timestamp::from_msec(as_u64(
            value,
            "lastActive",
        )?))),
        other => Err(ProtoError::BadData(format!("unknown caret field {other:?}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec() -> Codec {
        Codec::new()
    }

    fn caret(session: &str) -> Caret {
        Caret {
            session_id: SessionId::new(session).unwrap(),
            author_id: AuthorId::new("alice").unwrap(),
            rev_num: RevNum::from_raw(4),
            index: 10,
            length: 2,
            color: CaretColor::from_rgb(0xaa, 0xbb, 0xcc),
            last_active: Timestamp::from_msec(42),
        }
    }

    // ── 1. tagged shape on the wire ─────────────────────────────────────

    #[test]
    fn timestamp_wire_shape() {
        let value = codec().encode_timestamp(Timestamp::from_msec(99));
        assert_eq!(value, json!({"Timestamp": [99]}));
        assert_eq!(
            codec().decode_timestamp(&value).unwrap(),
            Timestamp::from_msec(99)
        );
    }

    #[test]
    fn body_change_round_trip() {
        let change = Change {
            rev_num: RevNum::from_raw(4),
            delta: BodyDelta::new().retain(2).insert("hi"),
            timestamp: Some(Timestamp::from_msec(1000)),
            author_id: Some(AuthorId::new("alice").unwrap()),
        };
        let value = codec().encode_body_change(&change);
        let back = codec().decode_body_change(&value).unwrap();
        assert_eq!(back, change);
        // Nulls stand in for absent metadata.
        let bare = Change::bare(RevNum::from_raw(1), BodyDelta::document("x"));
        let value = codec().encode_body_change(&bare);
        assert_eq!(value["BodyChange"][2], Value::Null);
        assert_eq!(codec().decode_body_change(&value).unwrap(), bare);
    }

    #[test]
    fn caret_snapshot_round_trip() {
        let delta = CaretDelta::new().begin(caret("s1")).begin(caret("s2"));
        let snap = CaretSnapshot::from_snapshot(&Snapshot {
            rev_num: RevNum::from_raw(7),
            contents: delta,
        })
        .unwrap();
        let value = codec().encode_caret_snapshot(&snap);
        let back = codec().decode_caret_snapshot(&value).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn caret_delta_round_trip() {
        let delta = CaretDelta::new()
            .begin(caret("s1"))
            .set(
                SessionId::new("s1").unwrap(),
                CaretField::Index(3),
            )
            .end(SessionId::new("s2").unwrap());
        let value = codec().encode_caret_delta(&delta);
        let back = codec().decode_caret_delta(&value).unwrap();
        assert_eq!(back, delta);
    }

    #[test]
    fn property_round_trip() {
        let change = Change {
            rev_num: RevNum::from_raw(2),
            delta: PropertyDelta::new()
                .set("title", json!("notes"))
                .delete("stale"),
            timestamp: None,
            author_id: None,
        };
        let value = codec().encode_property_change(&change);
        assert_eq!(codec().decode_property_change(&value).unwrap(), change);
    }

    // ── 2. divergent shapes are rejected ────────────────────────────────

    #[test]
    fn unknown_tag_rejected() {
        let err = codec()
            .decode_body_delta(&json!({"WeirdDelta": [[]]}))
            .unwrap_err();
        assert!(matches!(err, ProtoError::UnknownTag(_)));
    }

    #[test]
    fn divergent_shapes_rejected() {
        // Wrong arg count.
        assert!(codec().decode_timestamp(&json!({"Timestamp": []})).is_err());
        // Two keys is not a tagged value.
        assert!(codec()
            .decode_timestamp(&json!({"Timestamp": [1], "x": 2}))
            .is_err());
        // Caret with a malformed color.
        let bad = json!({"Caret": ["s1", "alice", 1, 0, 0, "red", 0]});
        assert!(codec().decode_caret(&bad).is_err());
        // Duplicate sessions in a caret snapshot.
        let c = codec().encode_caret(&caret("s1"));
        let dup = json!({"CaretSnapshot": [3, [c.clone(), c]]});
        assert!(codec().decode_caret_snapshot(&dup).is_err());
        // Body op with mixed kinds.
        let bad = json!({"BodyDelta": [[{"retain": 1, "insert": "x"}]]});
        assert!(codec().decode_body_delta(&bad).is_err());
    }
}
