//! Realtime transports
//!
//! A transport delivers mint-side state notifications. The engine runs
//! a hybrid: a websocket transport as primary and a polling transport
//! as backup, composed behind one deduplicating decorator so consumers
//! see a single stream of [`TransportEvent`]s per mint.

use async_trait::async_trait;
use tokio::sync::broadcast;

use purse_core::mint_url::MintUrl;
use purse_core::ws::{WsMessageOrResponse, WsRequest};

use crate::error::Error;

mod hybrid;
mod polling;
mod ws;

pub use hybrid::{HybridConfig, HybridTransport};
pub use polling::{PollingConfig, PollingTransport};
pub use ws::{reconnect_delay, WsConfig, WsTransport};

/// Capacity of transport event channels
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Event surfaced by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection to the mint is up
    Open,
    /// A frame arrived
    Message(WsMessageOrResponse),
    /// Connection closed
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
    /// Connection-level failure
    Error(String),
}

/// A transport event together with the mint it concerns
#[derive(Debug, Clone, PartialEq)]
pub struct TransportNotice {
    /// Mint the event concerns
    pub mint_url: MintUrl,
    /// The event
    pub event: TransportEvent,
}

impl TransportNotice {
    pub fn new(mint_url: MintUrl, event: TransportEvent) -> Self {
        Self { mint_url, event }
    }
}

/// A realtime notification transport.
///
/// Listeners attach through [`RealtimeTransport::events`]; the
/// returned receiver keeps delivering across reconnects of the
/// underlying connection, so consumers never re-register.
#[async_trait]
pub trait RealtimeTransport: std::fmt::Debug + Send + Sync {
    /// Subscribe to events of every mint this transport serves
    fn events(&self) -> broadcast::Receiver<TransportNotice>;

    /// Send a request to a mint, connecting on first use. Requests
    /// sent before the connection is up are queued and flushed on
    /// open.
    async fn send(&self, mint_url: &MintUrl, request: WsRequest) -> Result<(), Error>;

    /// Tear down all per-mint state for a mint
    async fn close_mint(&self, mint_url: &MintUrl);

    /// Tear down every mint
    async fn close_all(&self);

    /// Suspend the transport, dropping connections and timers while
    /// preserving which mints are known
    async fn pause(&self);

    /// Rebuild connections for every known mint
    async fn resume(&self);
}
