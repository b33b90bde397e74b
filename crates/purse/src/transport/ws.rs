//! Websocket transport
//!
//! One socket per mint, derived from the mint url. Each socket runs in
//! its own task; requests sent while the socket is still connecting
//! are queued and flushed on open. With reconnection enabled a closed
//! socket is retried with exponential backoff; listeners never
//! re-register because events flow over a channel that outlives any
//! individual socket.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use purse_core::mint_url::MintUrl;
use purse_core::ws::{WsMessageOrResponse, WsRequest};

use super::{RealtimeTransport, TransportEvent, TransportNotice, EVENT_CHANNEL_CAPACITY};
use crate::error::Error;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Reconnect backoff: `min(30s, 2^min(6, attempt - 1) * 1s)`
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    Duration::from_secs(1u64 << exponent).min(MAX_RECONNECT_DELAY)
}

/// Websocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Whether closed sockets are reconnected with backoff
    pub reconnect: bool,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self { reconnect: true }
    }
}

#[derive(Debug)]
enum ConnCtrl {
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct MintConnection {
    outbound: mpsc::UnboundedSender<String>,
    ctrl: mpsc::UnboundedSender<ConnCtrl>,
}

#[derive(Debug, Default)]
struct WsInner {
    connections: HashMap<MintUrl, MintConnection>,
    known_mints: HashSet<MintUrl>,
    paused: bool,
}

/// Websocket transport over one socket per mint
#[derive(Debug)]
pub struct WsTransport {
    config: WsConfig,
    events: broadcast::Sender<TransportNotice>,
    inner: Mutex<WsInner>,
}

impl WsTransport {
    /// Create a transport
    pub fn new(config: WsConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            events,
            inner: Mutex::new(WsInner::default()),
        }
    }

    fn connect_mint(&self, mint_url: &MintUrl) -> MintConnection {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(
            mint_url.clone(),
            self.events.clone(),
            outbound_rx,
            ctrl_rx,
            self.config.reconnect,
        ));

        MintConnection {
            outbound: outbound_tx,
            ctrl: ctrl_tx,
        }
    }

    fn close_connection(connection: MintConnection, code: u16, reason: &str) {
        let _ = connection.ctrl.send(ConnCtrl::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    fn events(&self) -> broadcast::Receiver<TransportNotice> {
        self.events.subscribe()
    }

    async fn send(&self, mint_url: &MintUrl, request: WsRequest) -> Result<(), Error> {
        let text = serde_json::to_string(&request)?;

        let mut inner = self.inner.lock();
        inner.known_mints.insert(mint_url.clone());

        if inner.paused {
            // nothing to deliver to; the consumer re-subscribes on resume
            return Ok(());
        }

        if let Some(connection) = inner.connections.get(mint_url) {
            if connection.outbound.send(text.clone()).is_ok() {
                return Ok(());
            }
            // the connection task has exited; replace it
            inner.connections.remove(mint_url);
        }

        let connection = self.connect_mint(mint_url);
        connection
            .outbound
            .send(text)
            .map_err(|_| Error::Transport("websocket task unavailable".to_string()))?;
        inner.connections.insert(mint_url.clone(), connection);

        Ok(())
    }

    async fn close_mint(&self, mint_url: &MintUrl) {
        let mut inner = self.inner.lock();
        inner.known_mints.remove(mint_url);
        if let Some(connection) = inner.connections.remove(mint_url) {
            Self::close_connection(connection, 1000, "Closed");
        }
    }

    async fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.known_mints.clear();
        for (_, connection) in inner.connections.drain() {
            Self::close_connection(connection, 1000, "Closed");
        }
    }

    async fn pause(&self) {
        let mut inner = self.inner.lock();
        inner.paused = true;
        for (_, connection) in inner.connections.drain() {
            Self::close_connection(connection, 1000, "Paused");
        }
    }

    async fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.paused = false;
        let mints: Vec<MintUrl> = inner.known_mints.iter().cloned().collect();
        for mint_url in mints {
            let connection = self.connect_mint(&mint_url);
            inner.connections.insert(mint_url, connection);
        }
    }
}

enum SessionEnd {
    /// Deliberate local close; do not reconnect
    Shutdown,
    /// Remote close or failure; reconnect if configured
    Lost,
}

async fn run_connection(
    mint_url: MintUrl,
    events: broadcast::Sender<TransportNotice>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut ctrl: mpsc::UnboundedReceiver<ConnCtrl>,
    reconnect: bool,
) {
    let ws_url = match mint_url.ws_url() {
        Ok(url) => url,
        Err(err) => {
            let _ = events.send(TransportNotice::new(
                mint_url,
                TransportEvent::Error(err.to_string()),
            ));
            return;
        }
    };

    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let stream = tokio::select! {
            connected = tokio_tungstenite::connect_async(ws_url.as_str()) => match connected {
                Ok((stream, _)) => stream,
                Err(err) => {
                    let _ = events.send(TransportNotice::new(
                        mint_url.clone(),
                        TransportEvent::Error(err.to_string()),
                    ));
                    let _ = events.send(TransportNotice::new(
                        mint_url.clone(),
                        TransportEvent::Close {
                            code: 1006,
                            reason: "connect failed".to_string(),
                        },
                    ));
                    if !reconnect {
                        return;
                    }
                    if wait_reconnect(attempt, &mut ctrl).await.is_none() {
                        return;
                    }
                    continue;
                }
            },
            _ = ctrl.recv() => return,
        };

        // open clears the backoff
        attempt = 0;
        let _ = events.send(TransportNotice::new(mint_url.clone(), TransportEvent::Open));

        let (mut sink, mut reader) = stream.split();

        let end = loop {
            tokio::select! {
                control = ctrl.recv() => {
                    match control {
                        Some(ConnCtrl::Close { code, reason }) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: reason.clone().into(),
                                })))
                                .await;
                            let _ = events.send(TransportNotice::new(
                                mint_url.clone(),
                                TransportEvent::Close { code, reason },
                            ));
                        }
                        None => {}
                    }
                    break SessionEnd::Shutdown;
                }
                message = outbound.recv() => {
                    match message {
                        Some(text) => {
                            if let Err(err) = sink.send(Message::Text(text.into())).await {
                                let _ = events.send(TransportNotice::new(
                                    mint_url.clone(),
                                    TransportEvent::Error(err.to_string()),
                                ));
                            }
                        }
                        None => break SessionEnd::Shutdown,
                    }
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<WsMessageOrResponse>(text.as_ref()) {
                                Ok(message) => {
                                    let _ = events.send(TransportNotice::new(
                                        mint_url.clone(),
                                        TransportEvent::Message(message),
                                    ));
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        "Unparseable frame from {}: {}",
                                        mint_url,
                                        err
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1005, String::new()));
                            let _ = events.send(TransportNotice::new(
                                mint_url.clone(),
                                TransportEvent::Close { code, reason },
                            ));
                            break SessionEnd::Lost;
                        }
                        Some(Ok(_)) => {} // binary, ping, pong
                        Some(Err(err)) => {
                            let _ = events.send(TransportNotice::new(
                                mint_url.clone(),
                                TransportEvent::Error(err.to_string()),
                            ));
                            let _ = events.send(TransportNotice::new(
                                mint_url.clone(),
                                TransportEvent::Close {
                                    code: 1006,
                                    reason: "socket error".to_string(),
                                },
                            ));
                            break SessionEnd::Lost;
                        }
                        None => {
                            let _ = events.send(TransportNotice::new(
                                mint_url.clone(),
                                TransportEvent::Close {
                                    code: 1006,
                                    reason: "stream ended".to_string(),
                                },
                            ));
                            break SessionEnd::Lost;
                        }
                    }
                }
            }
        };

        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Lost => {
                if !reconnect {
                    return;
                }
                if wait_reconnect(attempt.max(1), &mut ctrl).await.is_none() {
                    return;
                }
            }
        }
    }
}

/// Sleep out the backoff for `attempt`, aborting when a control
/// message arrives (a deliberate close clears the pending timer).
/// Returns `None` when the task should exit.
async fn wait_reconnect(attempt: u32, ctrl: &mut mpsc::UnboundedReceiver<ConnCtrl>) -> Option<()> {
    tokio::select! {
        _ = tokio::time::sleep(reconnect_delay(attempt)) => Some(()),
        _ = ctrl.recv() => None,
    }
}
