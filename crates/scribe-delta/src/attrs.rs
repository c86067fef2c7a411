// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Attribute maps carried by body operations.
//!
//! Attributes are open-ended key/value annotations (bold, links, author
//! highlights, …). A `null` value is an *removal marker*: composing it over
//! an existing attribute deletes that attribute. Removal markers are carrier
//! state — they survive change-over-change composition but are dropped when
//! the composition target is a document (an insert cannot carry "remove").

use std::collections::BTreeMap;

use serde_json::Value;

/// An attribute map: ordered keys, JSON values, `null` = removal marker.
pub type Attrs = BTreeMap<String, Value>;

/// Composes attribute maps: `b` applied over `a`.
///
/// Keys from `b` override keys from `a`. When `keep_null` is `false` (the
/// result annotates an insert in a document-form delta), removal markers are
/// resolved by dropping the attribute entirely.
pub fn compose_attrs(a: Option<&Attrs>, b: Option<&Attrs>, keep_null: bool) -> Option<Attrs> {
    let mut merged: Attrs = a.cloned().unwrap_or_default();
    if let Some(b) = b {
        for (key, value) in b {
            merged.insert(key.clone(), value.clone());
        }
    }
    if !keep_null {
        merged.retain(|_, value| !value.is_null());
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Transforms attribute map `b` against concurrent map `a`.
///
/// When `b_wins` is `true` the transformed map is `b` unchanged (its writes
/// land after `a`'s and override them). Otherwise `b` loses every key `a`
/// also touched.
pub fn transform_attrs(a: Option<&Attrs>, b: Option<&Attrs>, b_wins: bool) -> Option<Attrs> {
    let Some(b) = b else { return None };
    if b.is_empty() {
        return None;
    }
    let Some(a) = a else { return Some(b.clone()) };
    if b_wins {
        return Some(b.clone());
    }
    let survived: Attrs = b
        .iter()
        .filter(|(key, _)| !a.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if survived.is_empty() {
        None
    } else {
        Some(survived)
    }
}
