// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! WebSocket transport driver.
//!
//! Bridges a real socket onto the channel-shaped transport [`ApiClient`]
//! expects: a writer task drains outbound frames, a reader task feeds
//! inbound frames back, and a protocol violation from the server tears the
//! connection down.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use scribe_proto::Codec;

use crate::api::ApiClient;

/// Outbound frame queue depth.
const OUTBOX_DEPTH: usize = 256;

/// Connects to a Scribe server and returns a ready [`ApiClient`].
///
/// The returned client is already open; requests flow immediately. The
/// reader and writer tasks live until the socket closes, at which point
/// every pending call fails `connectionClosed`.
pub async fn connect(url: &str, codec: Codec) -> Result<ApiClient> {
    let (socket, _response) = connect_async(url).await.context("websocket connect")?;
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOX_DEPTH);
    let client = ApiClient::new(codec, out_tx);
    client.handle_open().await;

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_client = client.clone();
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if let Err(err) = reader_client.handle_frame(&text).await {
                        warn!(%err, "protocol violation; closing connection");
                        reader_client.handle_closed(&err.to_string()).await;
                        return;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "websocket read error");
                    break;
                }
            }
        }
        reader_client.handle_closed("websocket closed").await;
    });

    Ok(client)
}
