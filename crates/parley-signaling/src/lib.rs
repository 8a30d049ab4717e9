//! Signaling client for the room server.
//!
//! [`SignalingClient::connect`] opens the WebSocket and splits it in two:
//! a cloneable [`SignalingClient`] for sending (backed by a writer task) and
//! a [`SignalingStream`] that yields decoded [`SignalingMessage`]s.
//!
//! Sending never fails from the caller's point of view: a closed channel is
//! logged and the message dropped. Closing is idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::error::{AgentError, Result};
use parley_core::protocol::SignalingMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound frames buffered ahead of the writer task.
const OUTBOUND_BUFFER: usize = 64;

/// Outbound half of the signaling channel, as seen by the agent.
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Encode and transmit. Failures are logged, never returned.
    async fn send(&self, message: &SignalingMessage);

    /// Close the channel. Safe to call any number of times.
    async fn close(&self);
}

/// Sending half of a connected signaling channel.
#[derive(Clone)]
pub struct SignalingClient {
    out_tx: mpsc::Sender<Message>,
    closed: CancellationToken,
    url: Arc<str>,
}

/// Receiving half of a connected signaling channel.
pub struct SignalingStream {
    read: SplitStream<WsStream>,
    closed: CancellationToken,
}

impl SignalingClient {
    /// Open the channel. Handshake failures map to [`AgentError::Signaling`].
    pub async fn connect(url: &str) -> Result<(Self, SignalingStream)> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| AgentError::Signaling(format!("connect to {url} failed: {e}")))?;
        info!(url, "Signaling channel open");

        let (write, read) = ws.split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(write, out_rx, closed.clone()));

        Ok((
            Self {
                out_tx,
                closed: closed.clone(),
                url: url.into(),
            },
            SignalingStream { read, closed },
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl SignalSender for SignalingClient {
    async fn send(&self, message: &SignalingMessage) {
        if self.closed.is_cancelled() {
            debug!(kind = message.kind(), "Signaling closed, dropping message");
            return;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Failed to encode signaling message");
                return;
            }
        };
        trace!(kind = message.kind(), bytes = text.len(), "Sending signaling message");
        if self.out_tx.send(Message::Text(text.into())).await.is_err() {
            warn!(kind = message.kind(), "Signaling channel closed, message dropped");
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!(url = %self.url, "Closing signaling channel");
        self.closed.cancel();
    }
}

impl SignalingStream {
    /// Next decoded message.
    ///
    /// `None` once the channel is closed from either side. A frame that does
    /// not decode yields `Some(Err(..))`.
    pub async fn next(&mut self) -> Option<Result<SignalingMessage>> {
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return None,
                frame = self.read.next() => frame,
            };
            match frame? {
                Ok(Message::Text(text)) => {
                    return Some(SignalingMessage::decode(text.as_str()));
                }
                Ok(Message::Binary(bytes)) => {
                    return Some(Err(AgentError::Signaling(format!(
                        "unexpected binary frame ({} bytes)",
                        bytes.len()
                    ))));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Signaling channel closed by server");
                    self.closed.cancel();
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    self.closed.cancel();
                    return Some(Err(AgentError::Signaling(format!("receive failed: {e}"))));
                }
            }
        }
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            msg = out_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "Signaling write failed");
                    closed.cancel();
                    return;
                }
            }
        }
    }
    // Best effort: the peer may already be gone.
    let _ = write.send(Message::Close(None)).await;
    let _ = write.close().await;
    debug!("Signaling writer stopped");
}
