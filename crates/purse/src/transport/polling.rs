//! Polling transport
//!
//! Backup delivery path: subscribe requests mirrored into this
//! transport become per-mint polling tasks that query the mint over
//! the gateway and synthesize notifications in the same frame shape
//! the websocket would have pushed. Emits a synthetic `open`
//! immediately so downstream code perceives the websocket lifecycle.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use purse_core::mint_url::MintUrl;
use purse_core::ws::{
    NotificationPayload, SubId, SubscriptionKind, WsMessageOrResponse, WsMethodRequest,
    WsNotification, WsRequest,
};
use purse_core::PublicKey;

use super::{RealtimeTransport, TransportEvent, TransportNotice, EVENT_CHANNEL_CAPACITY};
use crate::error::Error;
use crate::gateway::MintGateway;

/// Polling transport configuration
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Tick interval
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
struct PollTask {
    kind: SubscriptionKind,
    filters: Vec<String>,
}

#[derive(Debug, Default)]
struct MintPolling {
    tasks: HashMap<SubId, PollTask>,
    /// Unsubscribes that arrived while a poll for the subscription was
    /// in flight; consulted before results are dispatched or the task
    /// is re-enqueued, then cleared.
    unsubscribed_during_processing: HashSet<SubId>,
    interval_override: Option<Duration>,
    running: bool,
    open_emitted: bool,
}

#[derive(Debug, Default)]
struct PollingInner {
    mints: HashMap<MintUrl, MintPolling>,
}

/// Polling transport over the mint gateway
#[derive(Debug)]
pub struct PollingTransport {
    gateway: MintGateway,
    default_interval: Duration,
    events: broadcast::Sender<TransportNotice>,
    inner: Arc<Mutex<PollingInner>>,
    paused: watch::Sender<bool>,
}

impl PollingTransport {
    /// Create a polling transport
    pub fn new(gateway: MintGateway, config: PollingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (paused, _) = watch::channel(false);
        Self {
            gateway,
            default_interval: config.interval,
            events,
            inner: Arc::new(Mutex::new(PollingInner::default())),
            paused,
        }
    }

    /// Override the tick interval of one mint; `None` restores the
    /// default
    pub fn set_mint_interval(&self, mint_url: &MintUrl, interval: Option<Duration>) {
        let mut inner = self.inner.lock();
        if let Some(mint) = inner.mints.get_mut(mint_url) {
            mint.interval_override = interval;
        }
    }

    fn spawn_poll_loop(&self, mint_url: MintUrl) {
        let gateway = self.gateway.clone();
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let default_interval = self.default_interval;
        let mut paused = self.paused.subscribe();

        tokio::spawn(async move {
            loop {
                // hold ticking while paused
                while *paused.borrow() {
                    if paused.changed().await.is_err() {
                        return;
                    }
                }

                // wait out one interval in small steps so an interval
                // switch (websocket failover) applies without waiting
                // out the old, longer tick
                let mut elapsed = Duration::ZERO;
                loop {
                    let interval = {
                        let inner = inner.lock();
                        match inner.mints.get(&mint_url) {
                            Some(mint) => mint.interval_override.unwrap_or(default_interval),
                            None => return,
                        }
                    };
                    if elapsed >= interval {
                        break;
                    }
                    let step = (interval - elapsed).min(Duration::from_millis(250));
                    tokio::time::sleep(step).await;
                    elapsed += step;
                }

                if *paused.borrow() {
                    continue;
                }

                let tasks: Vec<(SubId, PollTask)> = {
                    let inner = inner.lock();
                    match inner.mints.get(&mint_url) {
                        Some(mint) => mint
                            .tasks
                            .iter()
                            .map(|(sub_id, task)| (sub_id.clone(), task.clone()))
                            .collect(),
                        None => return,
                    }
                };

                for (sub_id, task) in tasks {
                    if consume_unsubscribed(&inner, &mint_url, &sub_id) {
                        continue;
                    }

                    let payloads = poll_task(&gateway, &mint_url, &task).await;

                    // the unsubscribe may have raced the query
                    if consume_unsubscribed(&inner, &mint_url, &sub_id) {
                        continue;
                    }

                    for payload in payloads {
                        let notification = WsNotification::new(sub_id.clone(), payload);
                        let _ = events.send(TransportNotice::new(
                            mint_url.clone(),
                            TransportEvent::Message(WsMessageOrResponse::Notification(
                                notification,
                            )),
                        ));
                    }
                }
            }
        });
    }
}

fn consume_unsubscribed(
    inner: &Arc<Mutex<PollingInner>>,
    mint_url: &MintUrl,
    sub_id: &SubId,
) -> bool {
    let mut inner = inner.lock();
    inner
        .mints
        .get_mut(mint_url)
        .map(|mint| mint.unsubscribed_during_processing.remove(sub_id))
        .unwrap_or(true)
}

async fn poll_task(
    gateway: &MintGateway,
    mint_url: &MintUrl,
    task: &PollTask,
) -> Vec<NotificationPayload> {
    let mut payloads = Vec::new();

    match task.kind {
        SubscriptionKind::Bolt11MintQuote => {
            for quote_id in &task.filters {
                match gateway.check_mint_quote(mint_url, quote_id).await {
                    Ok(response) => payloads.push(NotificationPayload::MintQuote(response)),
                    Err(err) => {
                        tracing::debug!("Polling mint quote `{}` failed: {}", quote_id, err)
                    }
                }
            }
        }
        SubscriptionKind::Bolt11MeltQuote => {
            for quote_id in &task.filters {
                match gateway.check_melt_quote(mint_url, quote_id).await {
                    Ok(response) => payloads.push(NotificationPayload::MeltQuote(response)),
                    Err(err) => {
                        tracing::debug!("Polling melt quote `{}` failed: {}", quote_id, err)
                    }
                }
            }
        }
        SubscriptionKind::ProofState => {
            let ys: Vec<PublicKey> = task
                .filters
                .iter()
                .filter_map(|filter| match PublicKey::from_str(filter) {
                    Ok(y) => Some(y),
                    Err(_) => {
                        tracing::warn!("Proof state filter is not a point: `{}`", filter);
                        None
                    }
                })
                .collect();

            if ys.is_empty() {
                return payloads;
            }

            match gateway.check_proof_states(mint_url, ys).await {
                Ok(states) => {
                    payloads.extend(states.into_iter().map(NotificationPayload::ProofState))
                }
                Err(err) => tracing::debug!("Polling proof states failed: {}", err),
            }
        }
    }

    payloads
}

#[async_trait]
impl RealtimeTransport for PollingTransport {
    fn events(&self) -> broadcast::Receiver<TransportNotice> {
        self.events.subscribe()
    }

    async fn send(&self, mint_url: &MintUrl, request: WsRequest) -> Result<(), Error> {
        match request.method {
            WsMethodRequest::Subscribe(params) => {
                let spawn = {
                    let mut inner = self.inner.lock();
                    let mint = inner.mints.entry(mint_url.clone()).or_default();

                    mint.tasks.insert(
                        params.id.clone(),
                        PollTask {
                            kind: params.kind,
                            filters: params.filters,
                        },
                    );
                    mint.unsubscribed_during_processing.remove(&params.id);

                    if !mint.open_emitted {
                        mint.open_emitted = true;
                        let _ = self.events.send(TransportNotice::new(
                            mint_url.clone(),
                            TransportEvent::Open,
                        ));
                    }

                    if mint.running {
                        false
                    } else {
                        mint.running = true;
                        true
                    }
                };

                if spawn {
                    self.spawn_poll_loop(mint_url.clone());
                }
            }
            WsMethodRequest::Unsubscribe(request) => {
                let mut inner = self.inner.lock();
                if let Some(mint) = inner.mints.get_mut(mint_url) {
                    mint.tasks.remove(&request.sub_id);
                    mint.unsubscribed_during_processing.insert(request.sub_id);
                }
            }
        }

        Ok(())
    }

    async fn close_mint(&self, mint_url: &MintUrl) {
        self.inner.lock().mints.remove(mint_url);
    }

    async fn close_all(&self) {
        self.inner.lock().mints.clear();
    }

    async fn pause(&self) {
        let _ = self.paused.send(true);
        let mut inner = self.inner.lock();
        for mint in inner.mints.values_mut() {
            mint.open_emitted = false;
        }
    }

    async fn resume(&self) {
        {
            let mut inner = self.inner.lock();
            for (mint_url, mint) in inner.mints.iter_mut() {
                if !mint.tasks.is_empty() && !mint.open_emitted {
                    mint.open_emitted = true;
                    let _ = self
                        .events
                        .send(TransportNotice::new(mint_url.clone(), TransportEvent::Open));
                }
            }
        }
        let _ = self.paused.send(false);
    }
}
