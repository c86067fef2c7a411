// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Sessions: the per-(author, connection) RPC view of a document.
//!
//! A session binds `(document host, session id, author id)` and exposes the
//! document operations as a string-dispatched method surface. The session
//! holds an owned handle to the host; the host only tracks sessions by id
//! (through the caret log), so dropping a session's connection cannot leak
//! a reference cycle.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use scribe_delta::{
    AuthorId, BodyDelta, Change, PropertyDelta, RevNum, SessionId, Snapshot, Timestamp,
};

use crate::host::DocHost;
use crate::DocError;

/// Server-side ceiling for one long-poll round trip.
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// One `(author, document, connection)` triple.
pub struct Session {
    host: Arc<DocHost>,
    session_id: SessionId,
    author_id: AuthorId,
}

impl Session {
    pub(crate) fn new(host: Arc<DocHost>, session_id: SessionId, author_id: AuthorId) -> Self {
        Self {
            host,
            session_id,
            author_id,
        }
    }

    /// The session id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The author this session acts for.
    pub fn author_id(&self) -> &AuthorId {
        &self.author_id
    }

    /// Identification string for client logs.
    pub fn log_info(&self) -> String {
        format!(
            "{} session={} author={}",
            self.host.doc_path(),
            self.session_id,
            self.author_id
        )
    }

    /// Ends the session's caret. Called when the owning connection closes.
    pub async fn close(&self) {
        self.host.close_session(&self.session_id).await;
    }

    // ── body ────────────────────────────────────────────────────────────

    /// Body snapshot at `rev`, or the latest.
    pub async fn body_get_snapshot(
        &self,
        rev: Option<RevNum>,
    ) -> Result<Snapshot<BodyDelta>, DocError> {
        self.host.body().get_snapshot(rev).await
    }

    /// One body change straight from the log.
    pub async fn body_get_change(&self, rev: RevNum) -> Result<Change<BodyDelta>, DocError> {
        self.host.body().get_change(rev).await
    }

    /// Long-poll for the body change after `base`.
    pub async fn body_get_change_after(
        &self,
        base: RevNum,
    ) -> Result<Change<BodyDelta>, DocError> {
        self.host
            .body()
            .get_change_after(base, Some(LONG_POLL_TIMEOUT))
            .await
    }

    /// Submits a body delta against `base`; returns the correction.
    pub async fn body_update(
        &self,
        base: RevNum,
        delta: BodyDelta,
    ) -> Result<Change<BodyDelta>, DocError> {
        self.host
            .body()
            .update(Change {
                rev_num: base.next(),
                delta,
                timestamp: Some(Timestamp::now()),
                author_id: Some(self.author_id.clone()),
            })
            .await
    }

    // ── caret ───────────────────────────────────────────────────────────

    /// Caret snapshot at `rev`, or the latest.
    pub async fn caret_get_snapshot(
        &self,
        rev: Option<RevNum>,
    ) -> Result<scribe_delta::CaretSnapshot, DocError> {
        self.host.carets().get_snapshot(rev).await
    }

    /// Long-poll for the caret change after `base`.
    pub async fn caret_get_change_after(
        &self,
        base: RevNum,
    ) -> Result<Change<scribe_delta::CaretDelta>, DocError> {
        self.host
            .carets()
            .get_change_after(base, Some(LONG_POLL_TIMEOUT))
            .await
    }

    /// Reports this session's selection.
    pub async fn caret_update(
        &self,
        doc_rev_num: RevNum,
        index: usize,
        length: usize,
    ) -> Result<Change<scribe_delta::CaretDelta>, DocError> {
        self.host
            .carets()
            .update_caret(&self.session_id, &self.author_id, doc_rev_num, index, length)
            .await
    }

    // ── property ────────────────────────────────────────────────────────

    /// Property snapshot at `rev`, or the latest.
    pub async fn property_get_snapshot(
        &self,
        rev: Option<RevNum>,
    ) -> Result<Snapshot<PropertyDelta>, DocError> {
        self.host.property().get_snapshot(rev).await
    }

    /// One property change straight from the log.
    pub async fn property_get_change(
        &self,
        rev: RevNum,
    ) -> Result<Change<PropertyDelta>, DocError> {
        self.host.property().get_change(rev).await
    }

    /// Long-poll for the property change after `base`.
    pub async fn property_get_change_after(
        &self,
        base: RevNum,
    ) -> Result<Change<PropertyDelta>, DocError> {
        self.host
            .property()
            .get_change_after(base, Some(LONG_POLL_TIMEOUT))
            .await
    }

    /// Submits a property delta against `base`; returns the correction.
    pub async fn property_update(
        &self,
        base: RevNum,
        delta: PropertyDelta,
    ) -> Result<Change<PropertyDelta>, DocError> {
        self.host
            .property()
            .update(Change {
                rev_num: base.next(),
                delta,
                timestamp: Some(Timestamp::now()),
                author_id: Some(self.author_id.clone()),
            })
            .await
    }

    // ── string dispatch ─────────────────────────────────────────────────

    /// Dispatches one RPC method by name.
    ///
    /// This is the session's entire remote surface; a method name absent
    /// from this table does not exist, so there is nothing to allowlist
    /// beyond it.
    pub async fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value, DocError> {
        let codec = self.host.codec();
        match method {
            "getLogInfo" => {
                expect_args(method, args, 0)?;
                Ok(Value::String(self.log_info()))
            }
            "getSessionId" => {
                expect_args(method, args, 0)?;
                Ok(Value::String(self.session_id.to_string()))
            }
            "body_getSnapshot" => {
                let rev = optional_rev(method, args)?;
                Ok(codec.encode_body_snapshot(&self.body_get_snapshot(rev).await?))
            }
            "body_getChange" => {
                expect_args(method, args, 1)?;
                let rev = rev_arg(&args[0])?;
                Ok(codec.encode_body_change(&self.body_get_change(rev).await?))
            }
            "body_getChangeAfter" => {
                expect_args(method, args, 1)?;
                let base = rev_arg(&args[0])?;
                Ok(codec.encode_body_change(&self.body_get_change_after(base).await?))
            }
            "body_update" => {
                expect_args(method, args, 2)?;
                let base = rev_arg(&args[0])?;
                let delta = codec.decode_body_delta(&args[1])?;
                Ok(codec.encode_body_change(&self.body_update(base, delta).await?))
            }
            "caret_getSnapshot" => {
                let rev = optional_rev(method, args)?;
                Ok(codec.encode_caret_snapshot(&self.caret_get_snapshot(rev).await?))
            }
            "caret_getChangeAfter" => {
                expect_args(method, args, 1)?;
                let base = rev_arg(&args[0])?;
                Ok(codec.encode_caret_change(&self.caret_get_change_after(base).await?))
            }
            "caret_update" => {
                if args.is_empty() || args.len() > 3 {
                    return Err(DocError::BadValue(format!(
                        "caret_update takes 2 or 3 args, got {}",
                        args.len()
                    )));
                }
                let doc_rev = rev_arg(&args[0])?;
                let index = usize_arg(args.get(1), "caret index")?;
                let length = match args.get(2) {
                    None => 0,
                    Some(v) => usize_arg(Some(v), "caret length")?,
                };
                Ok(codec.encode_caret_change(
                    &self.caret_update(doc_rev, index, length).await?,
                ))
            }
            "property_getSnapshot" => {
                let rev = optional_rev(method, args)?;
                Ok(codec.encode_property_snapshot(&self.property_get_snapshot(rev).await?))
            }
            "property_getChange" => {
                expect_args(method, args, 1)?;
                let rev = rev_arg(&args[0])?;
                Ok(codec.encode_property_change(&self.property_get_change(rev).await?))
            }
            "property_getChangeAfter" => {
                expect_args(method, args, 1)?;
                let base = rev_arg(&args[0])?;
                Ok(codec.encode_property_change(&self.property_get_change_after(base).await?))
            }
            "property_update" => {
                expect_args(method, args, 2)?;
                let base = rev_arg(&args[0])?;
                let delta = codec.decode_property_delta(&args[1])?;
                Ok(codec.encode_property_change(&self.property_update(base, delta).await?))
            }
            other => Err(DocError::BadValue(format!(
                "session has no method {other:?}"
            ))),
        }
    }
}

fn expect_args(method: &str, args: &[Value], n: usize) -> Result<(), DocError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(DocError::BadValue(format!(
            "{method} takes {n} args, got {}",
            args.len()
        )))
    }
}

fn rev_arg(value: &Value) -> Result<RevNum, DocError> {
    value
        .as_u64()
        .map(RevNum::from_raw)
        .ok_or_else(|| DocError::BadValue("revision must be a non-negative integer".into()))
}

fn usize_arg(value: Option<&Value>, what: &str) -> Result<usize, DocError> {
    let value =
        value.ok_or_else(|| DocError::BadValue(format!("{what} argument is required")))?;
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| DocError::BadValue(format!("{what} must be a non-negative integer")))
}

/// Zero args or one (possibly-null) revision argument.
fn optional_rev(method: &str, args: &[Value]) -> Result<Option<RevNum>, DocError> {
    match args {
        [] => Ok(None),
        [Value::Null] => Ok(None),
        [value] => Ok(Some(rev_arg(value)?)),
        _ => Err(DocError::BadValue(format!(
            "{method} takes at most 1 arg, got {}",
            args.len()
        ))),
    }
}
