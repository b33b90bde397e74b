//! Shared Cashu protocol types for the purse wallet engine.
//!
//! This crate holds everything both sides of the engine speak: amounts,
//! mint URLs, secrets, keysets, proofs and blinded messages, quote
//! bodies with their state machines, and the JSON-RPC subscription
//! frames used over WebSocket. It contains no networking and no
//! cryptography; the blind-signature scheme is a capability of the
//! engine crate.

pub mod amount;
pub mod error;
pub mod keys;
pub mod mint_url;
pub mod proof;
pub mod quote;
pub mod secret;
pub mod ws;

pub use amount::Amount;
pub use error::Error;
pub use keys::{KeySet, KeySetInfo, Keys, KeysetId, PublicKey};
pub use mint_url::MintUrl;
pub use proof::{
    BlindSignature, BlindedMessage, PreMint, PreMintSecrets, Proof, Proofs, ProofsMethods,
};
pub use secret::Secret;
pub use quote::{
    CheckStateRequest, CheckStateResponse, KeysResponse, KeysetResponse, MeltQuoteRequest,
    MeltQuoteResponse, MeltQuoteState, MeltRequest, MintInfo, MintQuoteRequest, MintQuoteResponse,
    MintQuoteState, MintRequest, MintResponse, ProofStateInfo, RestoreRequest, RestoreResponse,
    SpendState, SwapRequest, SwapResponse,
};
pub use ws::{
    NotificationPayload, SubId, SubscriptionKind, SubscriptionParams, WsErrorBody,
    WsErrorResponse, WsMessageOrResponse, WsMethodRequest, WsNotification, WsNotificationParams,
    WsRequest, WsResponse, WsResponseResult, WsSubscribeResponse, WsUnsubscribeRequest,
    WsUnsubscribeResponse,
};
