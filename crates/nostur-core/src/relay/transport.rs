use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::message::{ClientMessage, RelayMessage};
use super::RelayError;
use crate::constants::CONNECT_TIMEOUT;

/// An open relay session as a pair of text-frame channels.
///
/// Dropping `outgoing` closes the session; `incoming` yields `None` once the
/// remote side is gone.
pub struct Session {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Session, RelayError>>;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        // Fails only when a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Session, RelayError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
                .await
                .map_err(|_| RelayError::Timeout(url.clone()))?
                .map_err(|e| RelayError::Transport {
                    url: url.clone(),
                    message: e.to_string(),
                })?;

            let (mut ws_write, mut ws_read) = ws.split();
            let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        outgoing = outgoing_rx.recv() => match outgoing {
                            Some(text) => {
                                if let Err(e) = ws_write.send(Message::text(text)).await {
                                    tracing::debug!("[WS] {} send failed: {}", url, e);
                                    break;
                                }
                            }
                            None => {
                                let _ = ws_write.close().await;
                                break;
                            }
                        },
                        incoming = ws_read.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if incoming_tx.send(text.as_str().to_owned()).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::debug!("[WS] {} read failed: {}", url, e);
                                break;
                            }
                        }
                    }
                }
            });

            Ok(Session {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            })
        })
    }
}

/// The relay side of an in-memory session
pub struct MemoryRelay {
    pub url: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl MemoryRelay {
    /// Next well-formed frame the client sent, `None` once the client hung up
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        while let Some(text) = self.from_client.recv().await {
            if let Ok(message) = ClientMessage::from_json(&text) {
                return Some(message);
            }
        }
        None
    }

    pub fn send(&self, message: &RelayMessage) -> bool {
        self.to_client.send(message.as_json()).is_ok()
    }

    pub fn send_raw(&self, text: &str) -> bool {
        self.to_client.send(text.to_string()).is_ok()
    }
}

#[derive(Default)]
struct MemoryState {
    refused: HashSet<String>,
    accepted: Option<mpsc::UnboundedSender<MemoryRelay>>,
}

/// Channel-backed transport: every successful `open` hands the relay side to
/// the receiver returned by [`MemoryTransport::new`].
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRelay>) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let transport = Self::default();
        transport.state.lock().accepted = Some(accepted_tx);
        (transport, accepted_rx)
    }

    pub fn refuse(&self, url: &str) {
        self.state.lock().refused.insert(url.to_string());
    }

    pub fn accept(&self, url: &str) {
        self.state.lock().refused.remove(url);
    }
}

impl Transport for MemoryTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Session, RelayError>> {
        let url = url.to_string();
        let result = {
            let state = self.state.lock();
            if state.refused.contains(&url) {
                Err(RelayError::Refused(url))
            } else {
                let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
                let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
                let relay = MemoryRelay {
                    url: url.clone(),
                    from_client: outgoing_rx,
                    to_client: incoming_tx,
                };
                let delivered = state
                    .accepted
                    .as_ref()
                    .map(|accepted| accepted.send(relay).is_ok())
                    .unwrap_or(false);
                if delivered {
                    Ok(Session {
                        outgoing: outgoing_tx,
                        incoming: incoming_rx,
                    })
                } else {
                    Err(RelayError::Refused(url))
                }
            }
        };
        Box::pin(async move { result })
    }
}
