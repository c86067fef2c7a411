// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Request/response correlation over an abstract framed transport.
//!
//! The client owns the outbound half of a channel carrying JSON text
//! frames; the transport driver feeds inbound frames and lifecycle events
//! back through [`ApiClient::handle_open`], [`ApiClient::handle_frame`],
//! and [`ApiClient::handle_closed`]. Tests drive the client with plain
//! channels, the same way tools talk to the session hub without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use scribe_delta::{Change, RevNum, Snapshot};
use scribe_proto::{names, Codec, ErrorInfo, Message, MethodCall, Response};

enum Link {
    /// Transport not yet open; frames queue in order.
    Connecting { queued: Vec<String> },
    Open,
    Closed,
}

struct Shared {
    link: Link,
    pending: HashMap<u64, oneshot::Sender<Result<Value, ErrorInfo>>>,
}

/// A connection-scoped RPC client.
#[derive(Clone)]
pub struct ApiClient {
    codec: Codec,
    out: mpsc::Sender<String>,
    next_id: Arc<AtomicU64>,
    shared: Arc<Mutex<Shared>>,
}

impl ApiClient {
    /// A client writing frames into `out`. Starts in the connecting state.
    pub fn new(codec: Codec, out: mpsc::Sender<String>) -> Self {
        Self {
            codec,
            out,
            next_id: Arc::new(AtomicU64::new(1)),
            shared: Arc::new(Mutex::new(Shared {
                link: Link::Connecting { queued: Vec::new() },
                pending: HashMap::new(),
            })),
        }
    }

    /// The codec used for model arguments and results.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// The transport is open: flush queued frames in issue order.
    pub async fn handle_open(&self) {
        let queued = {
            let mut shared = self.shared.lock().await;
            let queued = match &mut shared.link {
                Link::Connecting { queued } => std::mem::take(queued),
                _ => Vec::new(),
            };
            if matches!(shared.link, Link::Connecting { .. }) {
                shared.link = Link::Open;
            }
            queued
        };
        for frame in queued {
            if self.out.send(frame).await.is_err() {
                self.handle_closed("transport dropped while flushing").await;
                return;
            }
        }
    }

    /// One inbound frame.
    ///
    /// # Errors
    ///
    /// `connectionNonsense` when the frame is not a response or answers an
    /// id that was never issued; the caller must terminate the transport.
    pub async fn handle_frame(&self, frame: &str) -> Result<(), ErrorInfo> {
        let response: Response = serde_json::from_str(frame).map_err(|err| {
            ErrorInfo::new(names::CONNECTION_NONSENSE, format!("undecodable frame: {err}"))
        })?;
        let resolver = self.shared.lock().await.pending.remove(&response.id);
        let Some(resolver) = resolver else {
            return Err(ErrorInfo::new(
                names::CONNECTION_NONSENSE,
                format!("response for unknown id {}", response.id),
            ));
        };
        let outcome = if response.ok {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(response
                .error
                .unwrap_or_else(|| ErrorInfo::new(names::WTF, "failed response without error")))
        };
        // The caller may have given up on the call; that is not a protocol
        // problem.
        let _ = resolver.send(outcome);
        Ok(())
    }

    /// The transport closed; every pending and future call fails.
    pub async fn handle_closed(&self, reason: &str) {
        let resolvers: Vec<_> = {
            let mut shared = self.shared.lock().await;
            shared.link = Link::Closed;
            shared.pending.drain().map(|(_, tx)| tx).collect()
        };
        debug!(reason, dropped = resolvers.len(), "connection closed");
        for resolver in resolvers {
            let _ = resolver.send(Err(ErrorInfo::new(names::CONNECTION_CLOSED, reason)));
        }
    }

    /// Invokes `method` on `target` and awaits the correlated response.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ErrorInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = Message {
            id,
            target: target.to_owned(),
            payload: MethodCall {
                method: method.to_owned(),
                args,
            },
        };
        let frame = serde_json::to_string(&msg)
            .map_err(|err| ErrorInfo::new(names::BAD_VALUE, err.to_string()))?;
        let (tx, rx) = oneshot::channel();
        let send_now = {
            let mut guard = self.shared.lock().await;
            let shared = &mut *guard;
            match &mut shared.link {
                Link::Closed => {
                    return Err(ErrorInfo::new(
                        names::CONNECTION_CLOSED,
                        "request issued after transport close",
                    ));
                }
                Link::Connecting { queued } => {
                    shared.pending.insert(id, tx);
                    queued.push(frame);
                    None
                }
                Link::Open => {
                    shared.pending.insert(id, tx);
                    Some(frame)
                }
            }
        };
        if let Some(frame) = send_now {
            if self.out.send(frame).await.is_err() {
                self.handle_closed("transport dropped").await;
            }
        }
        rx.await.unwrap_or_else(|_| {
            Err(ErrorInfo::new(
                names::CONNECTION_CLOSED,
                "connection torn down mid-call",
            ))
        })
    }

    // ── meta convenience ────────────────────────────────────────────────

    /// Round-trip liveness check.
    pub async fn ping(&self) -> Result<bool, ErrorInfo> {
        Ok(self.call("meta", "ping", vec![]).await?.as_bool() == Some(true))
    }

    /// The server-assigned connection id.
    pub async fn connection_id(&self) -> Result<String, ErrorInfo> {
        let value = self.call("meta", "connectionId", vec![]).await?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ErrorInfo::new(names::BAD_DATA, "connectionId must be a string"))
    }

    /// Proves possession of `secret` and returns a client for the installed
    /// target.
    pub async fn authorize(
        &self,
        target_id: &str,
        secret: &[u8],
    ) -> Result<SessionClient, ErrorInfo> {
        let challenge = self
            .call("meta", "makeChallenge", vec![Value::String(target_id.into())])
            .await?;
        let challenge = challenge
            .as_str()
            .ok_or_else(|| ErrorInfo::new(names::BAD_DATA, "challenge must be a string"))?;
        let response = scribe_proto::auth::challenge_response(secret, challenge);
        let ack = self
            .call(
                "meta",
                "authWithChallengeResponse",
                vec![Value::String(challenge.into()), Value::String(response)],
            )
            .await?;
        if ack.as_bool() != Some(true) {
            warn!(target = target_id, "authorization acknowledged with a non-true value");
        }
        Ok(SessionClient {
            api: self.clone(),
            target: target_id.to_owned(),
        })
    }
}

/// Typed client for one authorized session target.
#[derive(Clone)]
pub struct SessionClient {
    api: ApiClient,
    target: String,
}

impl SessionClient {
    /// A client for a target assumed to be installed already.
    pub fn for_target(api: ApiClient, target: impl Into<String>) -> Self {
        Self {
            api,
            target: target.into(),
        }
    }

    /// The target this client addresses.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Server-side identification string for logs.
    pub async fn get_log_info(&self) -> Result<String, ErrorInfo> {
        let value = self.api.call(&self.target, "getLogInfo", vec![]).await?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ErrorInfo::new(names::BAD_DATA, "log info must be a string"))
    }

    /// Body snapshot, latest when `rev` is `None`.
    pub async fn body_get_snapshot(
        &self,
        rev: Option<RevNum>,
    ) -> Result<Snapshot<scribe_delta::BodyDelta>, ErrorInfo> {
        let args = rev.map_or_else(Vec::new, |rev| vec![Value::from(rev.value())]);
        let value = self.api.call(&self.target, "body_getSnapshot", args).await?;
        self.api
            .codec
            .decode_body_snapshot(&value)
            .map_err(|err| ErrorInfo::new(names::BAD_DATA, err.to_string()))
    }

    /// Long-poll for the body change after `base`.
    pub async fn body_get_change_after(
        &self,
        base: RevNum,
    ) -> Result<Change<scribe_delta::BodyDelta>, ErrorInfo> {
        let value = self
            .api
            .call(
                &self.target,
                "body_getChangeAfter",
                vec![Value::from(base.value())],
            )
            .await?;
        self.api
            .codec
            .decode_body_change(&value)
            .map_err(|err| ErrorInfo::new(names::BAD_DATA, err.to_string()))
    }

    /// Submits a body delta against `base`; returns the correction.
    pub async fn body_update(
        &self,
        base: RevNum,
        delta: &scribe_delta::BodyDelta,
    ) -> Result<Change<scribe_delta::BodyDelta>, ErrorInfo> {
        let value = self
            .api
            .call(
                &self.target,
                "body_update",
                vec![
                    Value::from(base.value()),
                    self.api.codec.encode_body_delta(delta),
                ],
            )
            .await?;
        self.api
            .codec
            .decode_body_change(&value)
            .map_err(|err| ErrorInfo::new(names::BAD_DATA, err.to_string()))
    }

    /// Caret snapshot, latest when `rev` is `None`.
    pub async fn caret_get_snapshot(
        &self,
        rev: Option<RevNum>,
    ) -> Result<scribe_delta::CaretSnapshot, ErrorInfo> {
        let args = rev.map_or_else(Vec::new, |rev| vec![Value::from(rev.value())]);
        let value = self
            .api
            .call(&self.target, "caret_getSnapshot", args)
            .await?;
        self.api
            .codec
            .decode_caret_snapshot(&value)
            .map_err(|err| ErrorInfo::new(names::BAD_DATA, err.to_string()))
    }

    /// Long-poll for the caret change after `base`.
    pub async fn caret_get_change_after(
        &self,
        base: RevNum,
    ) -> Result<Change<scribe_delta::CaretDelta>, ErrorInfo> {
        let value = self
            .api
            .call(
                &self.target,
                "caret_getChangeAfter",
                vec![Value::from(base.value())],
            )
            .await?;
        self.api
            .codec
            .decode_caret_change(&value)
            .map_err(|err| ErrorInfo::new(names::BAD_DATA, err.to_string()))
    }

    /// Reports the local selection.
    pub async fn caret_update(
        &self,
        doc_rev: RevNum,
        index: usize,
        length: usize,
    ) -> Result<Change<scribe_delta::CaretDelta>, ErrorInfo> {
        let value = self
            .api
            .call(
                &self.target,
                "caret_update",
                vec![
                    Value::from(doc_rev.value()),
                    Value::from(index),
                    Value::from(length),
                ],
            )
            .await?;
        self.api
            .codec
            .decode_caret_change(&value)
            .map_err(|err| ErrorInfo::new(names::BAD_DATA, err.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client() -> (ApiClient, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (ApiClient::new(Codec::new(), tx), rx)
    }

    fn response_ok(id: u64, value: Value) -> String {
        serde_json::to_string(&Response::ok(id, value)).unwrap()
    }

    // ── 1. pre-open requests queue and flush in order ───────────────────

    #[tokio::test]
    async fn queued_frames_flush_in_order() {
        let (client, mut rx) = client();
        let c1 = client.clone();
        let first = tokio::spawn(async move { c1.call("meta", "ping", vec![]).await });
        let c2 = client.clone();
        let second = tokio::spawn(async move { c2.call("meta", "connectionId", vec![]).await });
        tokio::task::yield_now().await;
        // Nothing leaves before the transport opens.
        assert!(rx.try_recv().is_err());
        client.handle_open().await;
        let f1: Message = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let f2: Message = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(f1.id < f2.id);
        client.handle_frame(&response_ok(f1.id, Value::Bool(true))).await.unwrap();
        client
            .handle_frame(&response_ok(f2.id, Value::String("conn-1".into())))
            .await
            .unwrap();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(second.await.unwrap().unwrap(), Value::String("conn-1".into()));
    }

    // ── 2. responses resolve by id, out of order ────────────────────────

    #[tokio::test]
    async fn out_of_order_responses_resolve_correctly() {
        let (client, mut rx) = client();
        client.handle_open().await;
        let c1 = client.clone();
        let slow = tokio::spawn(async move { c1.call("doc", "body_getChangeAfter", vec![]).await });
        let c2 = client.clone();
        let fast = tokio::spawn(async move { c2.call("meta", "ping", vec![]).await });
        let m1: Message = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let m2: Message = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        // Answer the second request first.
        client.handle_frame(&response_ok(m2.id, Value::Bool(true))).await.unwrap();
        client.handle_frame(&response_ok(m1.id, Value::Null)).await.unwrap();
        assert_eq!(fast.await.unwrap().unwrap(), Value::Bool(true));
        assert_eq!(slow.await.unwrap().unwrap(), Value::Null);
    }

    // ── 3. unknown ids are protocol nonsense ────────────────────────────

    #[tokio::test]
    async fn unknown_response_id_is_nonsense() {
        let (client, _rx) = client();
        client.handle_open().await;
        let err = client
            .handle_frame(&response_ok(999, Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.name, names::CONNECTION_NONSENSE);
    }

    // ── 4. close fails pending and future calls ─────────────────────────

    #[tokio::test]
    async fn close_fails_pending_and_future_calls() {
        let (client, mut rx) = client();
        client.handle_open().await;
        let c1 = client.clone();
        let inflight = tokio::spawn(async move { c1.call("doc", "body_getSnapshot", vec![]).await });
        let _ = rx.recv().await;
        client.handle_closed("server went away").await;
        let err = inflight.await.unwrap().unwrap_err();
        assert_eq!(err.name, names::CONNECTION_CLOSED);
        let err = client.call("meta", "ping", vec![]).await.unwrap_err();
        assert_eq!(err.name, names::CONNECTION_CLOSED);
    }
}
