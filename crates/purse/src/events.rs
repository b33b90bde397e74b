//! Wallet events
//!
//! A closed set of event kinds with typed payloads. Events are emitted
//! after the corresponding record has been persisted, so a subscriber
//! that queries on receipt observes the new state.

use tokio::sync::broadcast;
use uuid::Uuid;

use purse_core::mint_url::MintUrl;

use crate::operation::MeltOperation;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Payload shared by every melt event
#[derive(Debug, Clone, PartialEq)]
pub struct MeltEventPayload {
    /// Mint the operation ran against
    pub mint_url: MintUrl,
    /// Operation id
    pub operation_id: Uuid,
    /// The record as persisted when the event fired
    pub operation: MeltOperation,
}

/// Wallet event
#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    /// A melt operation was prepared
    MeltPrepared(MeltEventPayload),
    /// A melt operation went pending on the lightning side
    MeltPending(MeltEventPayload),
    /// A melt operation finalized
    MeltFinalized(MeltEventPayload),
    /// A melt operation rolled back
    MeltRolledBack(MeltEventPayload),
}

impl WalletEvent {
    /// The payload carried by every event kind
    pub fn payload(&self) -> &MeltEventPayload {
        match self {
            Self::MeltPrepared(payload)
            | Self::MeltPending(payload)
            | Self::MeltFinalized(payload)
            | Self::MeltRolledBack(payload) => payload,
        }
    }

    pub(crate) fn for_operation(operation: &MeltOperation) -> Option<Self> {
        let payload = MeltEventPayload {
            mint_url: operation.mint_url.clone(),
            operation_id: operation.id,
            operation: operation.clone(),
        };
        match operation.state.as_str() {
            "prepared" => Some(Self::MeltPrepared(payload)),
            "pending" => Some(Self::MeltPending(payload)),
            "finalized" => Some(Self::MeltFinalized(payload)),
            "rolled_back" => Some(Self::MeltRolledBack(payload)),
            _ => None,
        }
    }
}

/// Fan-out of wallet events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<WalletEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher {
    /// Create a new publisher
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all wallet events
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: WalletEvent) {
        let _ = self.sender.send(event);
    }
}
