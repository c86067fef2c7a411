// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Request and response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::names;

/// A method invocation on a named target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Method name. Names beginning with `_` are never dispatchable.
    pub method: String,
    /// Positional arguments, codec-encoded where they are model types.
    pub args: Vec<Value>,
}

/// One client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Per-connection id, strictly increasing.
    pub id: u64,
    /// Target the call is addressed to.
    pub target: String,
    /// The invocation itself.
    pub payload: MethodCall,
}

/// Error identity carried in a response.
///
/// `name` is one of the stable taxonomy strings in [`names`]; `info`
/// carries structured detail the client may branch on; `message` is for
/// humans and logs only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable taxonomy name.
    pub name: String,
    /// Human-readable description.
    pub message: String,
    /// Structured detail; `null` when there is none.
    #[serde(default)]
    pub info: Value,
}

impl ErrorInfo {
    /// Constructs an error with no structured detail.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            info: Value::Null,
        }
    }

    /// Attaches structured detail.
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }

    /// Wraps an error that crossed the RPC boundary, preserving its name.
    pub fn into_remote(self) -> Self {
        Self {
            name: names::REMOTE_ERROR.into(),
            message: self.message.clone(),
            info: serde_json::json!({ "cause": self.name, "info": self.info }),
        }
    }

    /// `true` when this error (possibly remote-wrapped) has taxonomy `name`.
    pub fn is(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        self.name == names::REMOTE_ERROR
            && self
                .info
                .get("cause")
                .and_then(Value::as_str)
                .is_some_and(|cause| cause == name)
    }
}

impl core::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// One server response, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: u64,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error identity on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    /// A successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    pub fn err(id: u64, error: ErrorInfo) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── 1. envelope round-trips ─────────────────────────────────────────

    #[test]
    fn message_round_trip() {
        let msg = Message {
            id: 7,
            target: "session-1".into(),
            payload: MethodCall {
                method: "body_getSnapshot".into(),
                args: vec![json!(3)],
            },
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn response_omits_absent_halves() {
        let ok = Response::ok(1, json!(true));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(!text.contains("error"));
        let err = Response::err(2, ErrorInfo::new("timedOut", "no new change"));
        let text = serde_json::to_string(&err).unwrap();
        assert!(!text.contains("result"));
    }

    // ── 2. remote wrapping preserves identity ───────────────────────────

    #[test]
    fn remote_wrap_preserves_cause() {
        let wrapped = ErrorInfo::new("revisionTooHigh", "r9 > r3").into_remote();
        assert_eq!(wrapped.name, "remoteError");
        assert!(wrapped.is("revisionTooHigh"));
        assert!(wrapped.is("remoteError"));
        assert!(!wrapped.is("timedOut"));
    }
}
