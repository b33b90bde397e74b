//! Ecash wallet engine for Cashu mints.
//!
//! The engine manages proofs held against one or more mints and
//! orchestrates the operations that move them: melting (ecash to
//! lightning) with full crash recovery, proof reservation and
//! selection, and a hybrid websocket/polling subscription layer for
//! mint-side state changes.
//!
//! The pieces compose through traits at every external seam: storage
//! behind [`database::WalletDatabase`], the mint's HTTP surface behind
//! [`gateway::MintConnector`], and the blind-signature scheme behind
//! [`signer::EcashSigner`]. [`Wallet`] wires a default stack.

pub mod database;
pub mod error;
pub mod events;
pub mod fees;
pub mod gateway;
pub mod melt;
pub mod operation;
pub mod proofs;
pub mod signer;
pub mod subscription;
pub mod transport;
pub mod types;
pub mod util;
pub mod wallet;

pub use error::Error;
pub use events::{EventPublisher, MeltEventPayload, WalletEvent};
pub use gateway::{HttpClient, MintConnector, MintGateway};
pub use melt::{
    ExecuteOutcome, FinalizeOutcome, MeltHandler, MeltOperationService, PendingOutcome,
    RecoverOutcome, RecoveryReport,
};
pub use operation::{MeltOperation, MeltState, PreparedMelt, SwapOutputs};
pub use signer::EcashSigner;
pub use subscription::{NotificationCallback, SubscriptionHandle, SubscriptionManager};
pub use transport::{
    HybridConfig, HybridTransport, PollingConfig, PollingTransport, RealtimeTransport,
    TransportEvent, TransportNotice, WsConfig, WsTransport,
};
pub use types::{Melted, ProofInfo, ProofState, Transaction, TransactionDirection};
pub use wallet::{Wallet, WalletBuilder};

// the protocol types are part of this crate's public API
pub use purse_core as core;
