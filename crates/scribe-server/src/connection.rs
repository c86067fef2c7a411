// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Per-connection request handling.
//!
//! One task reads frames off the socket and spawns a handler per request
//! (dispatch order is wire arrival order); a writer task drains an outbound
//! channel into the socket, so slow responses never block reads. Anything
//! that is not a well-formed request terminates the connection — a peer
//! sending nonsense has diverged beyond repair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use scribe_delta::AuthorId;
use scribe_proto::auth::MIN_CHALLENGE_LEN;
use scribe_proto::{names, Codec, ErrorInfo, Message, Response};

use crate::directory::TargetDirectory;
use crate::target::{SessionTarget, Target};

/// A challenge is valid this long, and only once.
const CHALLENGE_TTL: Duration = Duration::from_secs(60);
/// Outbound frame queue depth per connection.
const OUTBOX_DEPTH: usize = 256;

/// Shared server state handed to every connection.
pub struct ServerState {
    codec: Codec,
    directory: Arc<TargetDirectory>,
    next_conn: AtomicU64,
}

impl ServerState {
    /// Constructs the shared state.
    pub fn new(codec: Codec, directory: Arc<TargetDirectory>) -> Arc<Self> {
        Arc::new(Self {
            codec,
            directory,
            next_conn: AtomicU64::new(1),
        })
    }

    /// The codec connections hand to their sessions.
    pub fn codec(&self) -> Codec {
        self.codec
    }
}

/// The service router: `GET /ws` upgrades to the document protocol.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let conn = Arc::new(ConnState::new(&state));
    info!(conn = %conn.id, "connection opened");
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOX_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut calls = JoinSet::new();
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let Ok(msg) = serde_json::from_str::<Message>(&text) else {
                    warn!(conn = %conn.id, "undecodable request frame; terminating");
                    break;
                };
                let conn = Arc::clone(&conn);
                let out_tx = out_tx.clone();
                calls.spawn(async move {
                    let response = conn.dispatch(msg).await;
                    if let Ok(text) = serde_json::to_string(&response) {
                        let _ = out_tx.send(text).await;
                    }
                });
            }
            Ok(WsMessage::Binary(_)) => {
                warn!(conn = %conn.id, "binary frame on a text protocol; terminating");
                break;
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {} // ping/pong handled by the transport
        }
    }

    // A disconnect cancels every in-flight call, long-polls included.
    calls.abort_all();
    conn.teardown().await;
    drop(out_tx);
    writer.abort();
    info!(conn = %conn.id, "connection closed");
}

struct PendingChallenge {
    target_id: String,
    expires_at: tokio::time::Instant,
}

/// Per-connection state: target map, pending challenges, identity.
pub(crate) struct ConnState {
    id: String,
    directory: Arc<TargetDirectory>,
    targets: RwLock<HashMap<String, Arc<dyn Target>>>,
    challenges: Mutex<HashMap<String, PendingChallenge>>,
}

impl ConnState {
    fn new(state: &Arc<ServerState>) -> Self {
        let seq = state.next_conn.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("conn-{seq}-{}", random_hex(4)),
            directory: Arc::clone(&state.directory),
            targets: RwLock::new(HashMap::new()),
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Routes one request to its target.
    pub(crate) async fn dispatch(&self, msg: Message) -> Response {
        let Message {
            id,
            target,
            payload,
        } = msg;
        if payload.method.starts_with('_') {
            return Response::err(
                id,
                ErrorInfo::new(
                    names::BAD_VALUE,
                    format!("method {:?} is not dispatchable", payload.method),
                ),
            );
        }
        if target == "meta" {
            return self.meta_call(id, &payload.method, &payload.args).await;
        }
        let installed = self.targets.read().await.get(&target).cloned();
        match installed {
            Some(endpoint) => match endpoint.call(&payload.method, &payload.args).await {
                Ok(result) => Response::ok(id, result),
                // Server-side errors cross the boundary wrapped, with their
                // original identity preserved inside.
                Err(err) => Response::err(id, err.into_remote()),
            },
            None => Response::err(
                id,
                ErrorInfo::new(
                    names::UNKNOWN_TARGET,
                    format!("target {target:?} is not installed on this connection"),
                ),
            ),
        }
    }

    /// The built-in `meta` target.
    async fn meta_call(&self, id: u64, method: &str, args: &[Value]) -> Response {
        match method {
            "connectionId" => Response::ok(id, json!(self.id)),
            "ping" => Response::ok(id, json!(true)),
            "makeChallenge" => {
                let Some(target_id) = args.first().and_then(Value::as_str) else {
                    return Response::err(
                        id,
                        ErrorInfo::new(names::BAD_VALUE, "makeChallenge takes a target id"),
                    );
                };
                // Challenges are issued for unknown targets too; the
                // directory lookup happens at authorization time, so this
                // call is not an existence oracle.
                let challenge = random_hex(16);
                debug_assert!(challenge.len() >= MIN_CHALLENGE_LEN);
                self.challenges.lock().await.insert(
                    challenge.clone(),
                    PendingChallenge {
                        target_id: target_id.to_owned(),
                        expires_at: tokio::time::Instant::now() + CHALLENGE_TTL,
                    },
                );
                Response::ok(id, json!(challenge))
            }
            "authWithChallengeResponse" => {
                let (Some(challenge), Some(response)) = (
                    args.first().and_then(Value::as_str),
                    args.get(1).and_then(Value::as_str),
                ) else {
                    return Response::err(
                        id,
                        ErrorInfo::new(
                            names::BAD_VALUE,
                            "authWithChallengeResponse takes (challenge, response)",
                        ),
                    );
                };
                match self.try_authorize(challenge, response).await {
                    Ok(()) => Response::ok(id, json!(true)),
                    Err(err) => Response::err(id, err),
                }
            }
            other => Response::err(
                id,
                ErrorInfo::new(names::BAD_VALUE, format!("meta has no method {other:?}")),
            ),
        }
    }

    async fn try_authorize(&self, challenge: &str, response: &str) -> Result<(), ErrorInfo> {
        // Single use: the challenge is consumed whether or not it verifies.
        let pending = self.challenges.lock().await.remove(challenge);
        let Some(pending) = pending else {
            return Err(ErrorInfo::new(
                names::AUTH_FAILED,
                "unknown or already-used challenge",
            ));
        };
        if tokio::time::Instant::now() > pending.expires_at {
            return Err(ErrorInfo::new(names::AUTH_FAILED, "challenge expired"));
        }
        let author = AuthorId::new(format!("author-{}", self.id))
            .map_err(|err| ErrorInfo::new(names::WTF, err.to_string()))?;
        let session = self
            .directory
            .authorize(&pending.target_id, challenge, response, author)
            .await?;
        info!(
            conn = %self.id,
            target = %pending.target_id,
            session = %session.session_id(),
            "target authorized"
        );
        self.targets.write().await.insert(
            pending.target_id,
            Arc::new(SessionTarget::new(session)),
        );
        Ok(())
    }

    /// Closes every installed target (ending carets) on disconnect.
    async fn teardown(&self) {
        let targets: Vec<Arc<dyn Target>> =
            self.targets.write().await.drain().map(|(_, t)| t).collect();
        for target in targets {
            target.close().await;
        }
        debug!(conn = %self.id, "connection state torn down");
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut out = String::with_capacity(bytes * 2);
    for byte in buf {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
