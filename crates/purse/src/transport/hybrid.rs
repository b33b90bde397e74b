//! Hybrid transport
//!
//! Decorator composing the websocket transport (primary, reconnect
//! disabled) with the polling transport (backup). Responsibilities:
//!
//! - mirror every request into both sub-transports so polling always
//!   knows what to poll,
//! - deduplicate notifications on `(mint, subscription, identifier)`
//!   so a state observed over both paths is forwarded once,
//! - surface exactly one `open` per mint,
//! - on a websocket loss, stop using the socket for that mint and
//!   switch polling to the fast interval; polling compensates
//!   indefinitely,
//! - pause/resume without losing subscription knowledge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use purse_core::mint_url::MintUrl;
use purse_core::ws::{NotificationId, SubId, WsMessageOrResponse, WsRequest};

use super::{
    PollingTransport, RealtimeTransport, TransportEvent, TransportNotice, EVENT_CHANNEL_CAPACITY,
};
use crate::error::Error;

/// Hybrid transport configuration
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Polling interval used once the websocket of a mint has failed
    pub fast_interval: Duration,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(5),
        }
    }
}

type DedupKey = (MintUrl, SubId, NotificationId);

#[derive(Debug, Default)]
struct HybridInner {
    paused: bool,
    ws_failed: HashSet<MintUrl>,
    open_emitted: HashSet<MintUrl>,
    last_states: HashMap<DedupKey, String>,
}

#[derive(Debug)]
struct Pump {
    inner: Mutex<HybridInner>,
    events: broadcast::Sender<TransportNotice>,
    polling: Arc<PollingTransport>,
    fast_interval: Duration,
}

impl Pump {
    fn handle(&self, notice: TransportNotice, from_ws: bool) {
        let TransportNotice { mint_url, event } = notice;

        match event {
            TransportEvent::Open => {
                let mut inner = self.inner.lock();
                if inner.paused {
                    return;
                }
                if inner.open_emitted.insert(mint_url.clone()) {
                    drop(inner);
                    let _ = self
                        .events
                        .send(TransportNotice::new(mint_url, TransportEvent::Open));
                }
            }
            TransportEvent::Message(message) => {
                if let WsMessageOrResponse::Notification(notification) = &message {
                    let key = (
                        mint_url.clone(),
                        notification.params.sub_id.clone(),
                        notification.params.payload.id(),
                    );
                    let state = notification.params.payload.state_str();

                    let mut inner = self.inner.lock();
                    if inner.last_states.get(&key) == Some(&state) {
                        return;
                    }
                    inner.last_states.insert(key, state);
                }

                let _ = self.events.send(TransportNotice::new(
                    mint_url,
                    TransportEvent::Message(message),
                ));
            }
            TransportEvent::Close { code, reason } => {
                if from_ws {
                    let paused = {
                        let mut inner = self.inner.lock();
                        if !inner.paused {
                            inner.ws_failed.insert(mint_url.clone());
                        }
                        inner.paused
                    };
                    if !paused {
                        tracing::debug!(
                            "Websocket for {} closed ({code} {reason}); polling takes over",
                            mint_url
                        );
                        self.polling
                            .set_mint_interval(&mint_url, Some(self.fast_interval));
                    }
                }
                let _ = self.events.send(TransportNotice::new(
                    mint_url,
                    TransportEvent::Close { code, reason },
                ));
            }
            TransportEvent::Error(message) => {
                let _ = self.events.send(TransportNotice::new(
                    mint_url,
                    TransportEvent::Error(message),
                ));
            }
        }
    }
}

/// Websocket-plus-polling transport with deduplication
#[derive(Debug)]
pub struct HybridTransport {
    ws: Arc<dyn RealtimeTransport>,
    polling: Arc<PollingTransport>,
    pump: Arc<Pump>,
}

impl HybridTransport {
    /// Compose a websocket transport and a polling transport.
    ///
    /// The websocket transport should have reconnection disabled; the
    /// hybrid never retries a failed socket and lets polling carry the
    /// mint instead.
    pub fn new(
        ws: Arc<dyn RealtimeTransport>,
        polling: Arc<PollingTransport>,
        config: HybridConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let pump = Arc::new(Pump {
            inner: Mutex::new(HybridInner::default()),
            events,
            polling: Arc::clone(&polling),
            fast_interval: config.fast_interval,
        });

        Self::spawn_pump(ws.events(), Arc::clone(&pump), true);
        Self::spawn_pump(polling.events(), Arc::clone(&pump), false);

        Self { ws, polling, pump }
    }

    fn spawn_pump(
        mut receiver: broadcast::Receiver<TransportNotice>,
        pump: Arc<Pump>,
        from_ws: bool,
    ) {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notice) => pump.handle(notice, from_ws),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Transport event stream lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[async_trait]
impl RealtimeTransport for HybridTransport {
    fn events(&self) -> broadcast::Receiver<TransportNotice> {
        self.pump.events.subscribe()
    }

    async fn send(&self, mint_url: &MintUrl, request: WsRequest) -> Result<(), Error> {
        let ws_available = !self.pump.inner.lock().ws_failed.contains(mint_url);

        if ws_available {
            if let Err(err) = self.ws.send(mint_url, request.clone()).await {
                tracing::warn!("Websocket send to {} failed: {}", mint_url, err);
            }
        }

        self.polling.send(mint_url, request).await
    }

    async fn close_mint(&self, mint_url: &MintUrl) {
        self.ws.close_mint(mint_url).await;
        self.polling.close_mint(mint_url).await;

        let mut inner = self.pump.inner.lock();
        inner.ws_failed.remove(mint_url);
        inner.open_emitted.remove(mint_url);
        inner.last_states.retain(|(mint, _, _), _| mint != mint_url);
    }

    async fn close_all(&self) {
        self.ws.close_all().await;
        self.polling.close_all().await;

        let mut inner = self.pump.inner.lock();
        inner.ws_failed.clear();
        inner.open_emitted.clear();
        inner.last_states.clear();
    }

    async fn pause(&self) {
        {
            let mut inner = self.pump.inner.lock();
            inner.paused = true;
            // forget emitted opens so a fresh one surfaces on resume
            inner.open_emitted.clear();
        }
        self.ws.pause().await;
        self.polling.pause().await;
    }

    async fn resume(&self) {
        self.pump.inner.lock().paused = false;
        self.ws.resume().await;
        self.polling.resume().await;
    }
}
