//! Subscription manager
//!
//! Protocol-level subscribe/unsubscribe over a realtime transport:
//! allocates subscription and request ids, coalesces identical
//! subscriptions, dispatches notification payloads to callbacks, and
//! re-subscribes every active subscription when the transport reports
//! a reconnect.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use purse_core::mint_url::MintUrl;
use purse_core::ws::{
    NotificationPayload, SubId, SubscriptionKind, SubscriptionParams, WsMessageOrResponse,
    WsMethodRequest, WsRequest, WsUnsubscribeRequest,
};

use crate::error::Error;
use crate::transport::{RealtimeTransport, TransportEvent, TransportNotice};

/// Callback invoked with every notification payload of a subscription.
///
/// Callbacks are fire-and-forget: dispatched in registration order,
/// panics are confined and logged, and nothing is reported back to the
/// mint.
pub type NotificationCallback = Arc<dyn Fn(NotificationPayload) + Send + Sync>;

/// Handle identifying one caller's attachment to a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    /// Mint the subscription runs against
    pub mint_url: MintUrl,
    /// Shared subscription id
    pub sub_id: SubId,
    callback_id: u64,
}

struct ActiveSubscription {
    sub_id: SubId,
    kind: SubscriptionKind,
    filters: Vec<String>,
    callbacks: Vec<(u64, NotificationCallback)>,
}

impl std::fmt::Debug for ActiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSubscription")
            .field("sub_id", &self.sub_id)
            .field("kind", &self.kind)
            .field("filters", &self.filters)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct ManagerInner {
    active: HashMap<MintUrl, Vec<ActiveSubscription>>,
    /// Subscribe requests awaiting a response, by `(mint, request id)`
    pending_subscribes: HashMap<(MintUrl, usize), SubId>,
    next_request_id: HashMap<MintUrl, usize>,
    open_seen: HashSet<MintUrl>,
    paused: bool,
    next_callback_id: u64,
}

/// Subscription manager over a realtime transport
#[derive(Debug)]
pub struct SubscriptionManager {
    transport: Arc<dyn RealtimeTransport>,
    inner: Arc<Mutex<ManagerInner>>,
}

impl SubscriptionManager {
    /// Create a manager and start consuming transport events
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Arc<Self> {
        let manager = Arc::new(Self {
            transport: Arc::clone(&transport),
            inner: Arc::new(Mutex::new(ManagerInner::default())),
        });

        let events = transport.events();
        tokio::spawn(Self::event_loop(
            events,
            Arc::clone(&manager.inner),
            transport,
        ));

        manager
    }

    /// Subscribe to mint-side state changes.
    ///
    /// An identical active subscription (same mint, kind and filter
    /// set) is reused: the callback attaches to it and no frame is
    /// sent. While paused, the subscription is registered and the
    /// subscribe frame goes out on resume.
    pub async fn subscribe(
        &self,
        mint_url: MintUrl,
        kind: SubscriptionKind,
        filters: Vec<String>,
        callback: NotificationCallback,
    ) -> Result<SubscriptionHandle, Error> {
        let mut filters = filters;
        filters.sort();

        let (handle, request) = {
            let mut inner = self.inner.lock();
            let callback_id = inner.next_callback_id;
            inner.next_callback_id += 1;

            let subscriptions = inner.active.entry(mint_url.clone()).or_default();

            if let Some(existing) = subscriptions
                .iter_mut()
                .find(|sub| sub.kind == kind && sub.filters == filters)
            {
                existing.callbacks.push((callback_id, callback));
                let handle = SubscriptionHandle {
                    mint_url,
                    sub_id: existing.sub_id.clone(),
                    callback_id,
                };
                return Ok(handle);
            }

            let sub_id = SubId::generate();
            subscriptions.push(ActiveSubscription {
                sub_id: sub_id.clone(),
                kind,
                filters: filters.clone(),
                callbacks: vec![(callback_id, callback)],
            });

            let handle = SubscriptionHandle {
                mint_url: mint_url.clone(),
                sub_id: sub_id.clone(),
                callback_id,
            };

            if inner.paused {
                (handle, None)
            } else {
                let request_id = next_request_id(&mut inner, &mint_url);
                inner
                    .pending_subscribes
                    .insert((mint_url.clone(), request_id), sub_id.clone());
                let request: WsRequest = (
                    WsMethodRequest::Subscribe(SubscriptionParams {
                        kind,
                        filters,
                        id: sub_id,
                    }),
                    request_id,
                )
                    .into();
                (handle, Some(request))
            }
        };

        if let Some(request) = request {
            self.transport.send(&handle.mint_url, request).await?;
        }

        Ok(handle)
    }

    /// Detach a callback. The unsubscribe frame is only sent once the
    /// last callback of the subscription is gone.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), Error> {
        let request = {
            let mut inner = self.inner.lock();

            let Some(subscriptions) = inner.active.get_mut(&handle.mint_url) else {
                return Ok(());
            };
            let Some(index) = subscriptions
                .iter()
                .position(|sub| sub.sub_id == handle.sub_id)
            else {
                return Ok(());
            };

            let subscription = &mut subscriptions[index];
            subscription
                .callbacks
                .retain(|(id, _)| *id != handle.callback_id);

            if !subscription.callbacks.is_empty() {
                return Ok(());
            }

            subscriptions.remove(index);

            if inner.paused {
                None
            } else {
                let request_id = next_request_id(&mut inner, &handle.mint_url);
                let request: WsRequest = (
                    WsMethodRequest::Unsubscribe(WsUnsubscribeRequest {
                        sub_id: handle.sub_id.clone(),
                    }),
                    request_id,
                )
                    .into();
                Some(request)
            }
        };

        if let Some(request) = request {
            self.transport.send(&handle.mint_url, request).await?;
        }

        Ok(())
    }

    /// Suspend the transport; subscriptions stay registered
    pub async fn pause(&self) {
        self.inner.lock().paused = true;
        self.transport.pause().await;
    }

    /// Rebuild the transport. Actives are re-subscribed when the
    /// transport reports open again.
    pub async fn resume(&self) {
        self.inner.lock().paused = false;
        self.transport.resume().await;
    }

    /// Number of active subscriptions for a mint
    pub fn active_count(&self, mint_url: &MintUrl) -> usize {
        self.inner
            .lock()
            .active
            .get(mint_url)
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn event_loop(
        mut events: broadcast::Receiver<TransportNotice>,
        inner: Arc<Mutex<ManagerInner>>,
        transport: Arc<dyn RealtimeTransport>,
    ) {
        loop {
            match events.recv().await {
                Ok(notice) => Self::handle_notice(notice, &inner, &transport).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscription event stream lagged by {skipped}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_notice(
        notice: TransportNotice,
        inner: &Arc<Mutex<ManagerInner>>,
        transport: &Arc<dyn RealtimeTransport>,
    ) {
        let TransportNotice { mint_url, event } = notice;

        match event {
            TransportEvent::Open => {
                let requests = {
                    let mut inner = inner.lock();

                    if inner.open_seen.insert(mint_url.clone()) {
                        // initial open; the subscribe path already sent
                        // the frames
                        return;
                    }

                    let mut subs: Vec<(SubId, SubscriptionKind, Vec<String>)> = inner
                        .active
                        .get(&mint_url)
                        .map(|subscriptions| {
                            subscriptions
                                .iter()
                                .map(|sub| {
                                    (sub.sub_id.clone(), sub.kind, sub.filters.clone())
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    subs.sort_by(|a, b| a.0.cmp(&b.0));

                    subs.into_iter()
                        .map(|(sub_id, kind, filters)| {
                            let request_id = next_request_id(&mut inner, &mint_url);
                            inner
                                .pending_subscribes
                                .insert((mint_url.clone(), request_id), sub_id.clone());
                            let request: WsRequest = (
                                WsMethodRequest::Subscribe(SubscriptionParams {
                                    kind,
                                    filters,
                                    id: sub_id,
                                }),
                                request_id,
                            )
                                .into();
                            request
                        })
                        .collect::<Vec<_>>()
                };

                for request in requests {
                    if let Err(err) = transport.send(&mint_url, request).await {
                        tracing::warn!("Re-subscribe to {} failed: {}", mint_url, err);
                    }
                }
            }
            TransportEvent::Message(WsMessageOrResponse::Notification(notification)) => {
                let callbacks: Vec<NotificationCallback> = {
                    let inner = inner.lock();
                    inner
                        .active
                        .get(&mint_url)
                        .and_then(|subscriptions| {
                            subscriptions
                                .iter()
                                .find(|sub| sub.sub_id == notification.params.sub_id)
                        })
                        .map(|sub| sub.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                        .unwrap_or_default()
                };

                for callback in callbacks {
                    let payload = notification.params.payload.clone();
                    tokio::spawn(async move {
                        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(payload)))
                            .is_err()
                        {
                            tracing::warn!("Subscription callback panicked");
                        }
                    });
                }
            }
            TransportEvent::Message(WsMessageOrResponse::Response(response)) => {
                // acceptance confirmed
                inner
                    .lock()
                    .pending_subscribes
                    .remove(&(mint_url, response.id));
            }
            TransportEvent::Message(WsMessageOrResponse::ErrorResponse(response)) => {
                let mut inner = inner.lock();
                if let Some(sub_id) = inner
                    .pending_subscribes
                    .remove(&(mint_url.clone(), response.id))
                {
                    tracing::warn!(
                        "Subscription `{}` rejected by {}: {}",
                        sub_id,
                        mint_url,
                        response.error.message
                    );
                    if let Some(subscriptions) = inner.active.get_mut(&mint_url) {
                        subscriptions.retain(|sub| sub.sub_id != sub_id);
                    }
                }
            }
            TransportEvent::Close { code, reason } => {
                tracing::debug!("Transport for {} closed: {} {}", mint_url, code, reason);
            }
            TransportEvent::Error(message) => {
                tracing::debug!("Transport error for {}: {}", mint_url, message);
            }
        }
    }
}

fn next_request_id(inner: &mut ManagerInner, mint_url: &MintUrl) -> usize {
    let counter = inner.next_request_id.entry(mint_url.clone()).or_insert(0);
    *counter += 1;
    *counter
}
