//! Subscription wire types
//!
//! JSON-RPC style frames spoken over the mint's websocket endpoint.
//! The polling transport synthesizes the same frames so downstream
//! consumers see a single shape regardless of how a notification
//! arrived.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::keys::PublicKey;
use crate::quote::{MeltQuoteResponse, MintQuoteResponse, ProofStateInfo};

/// JSON RPC version
pub const JSON_RPC_VERSION: &str = "2.0";

/// Subscription id: 16 random bytes, base64url encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubId(String);

impl SubId {
    const BYTE_LENGTH: usize = 16;

    /// Generate a random subscription id
    pub fn generate() -> Self {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine as _;
        use rand::RngCore;

        let mut bytes = [0u8; Self::BYTE_LENGTH];
        rand::rng().fill_bytes(&mut bytes);

        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Id as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a subscription watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKind {
    /// Bolt11 mint quote state
    Bolt11MintQuote,
    /// Bolt11 melt quote state
    Bolt11MeltQuote,
    /// Proof state
    ProofState,
}

impl SubscriptionKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bolt11MintQuote => "bolt11_mint_quote",
            Self::Bolt11MeltQuote => "bolt11_melt_quote",
            Self::ProofState => "proof_state",
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bolt11_mint_quote" => Ok(Self::Bolt11MintQuote),
            "bolt11_melt_quote" => Ok(Self::Bolt11MeltQuote),
            "proof_state" => Ok(Self::ProofState),
            _ => Err(Error::UnknownState(s.to_string())),
        }
    }
}

impl Serialize for SubscriptionKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubscriptionKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SubscriptionKind::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Subscription parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionParams {
    /// Kind
    pub kind: SubscriptionKind,
    /// Filters: quote ids or proof Y values, depending on kind
    pub filters: Vec<String>,
    /// Subscription Id
    #[serde(rename = "subId")]
    pub id: SubId,
}

/// The request to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsUnsubscribeRequest {
    /// Subscription Id
    #[serde(rename = "subId")]
    pub sub_id: SubId,
}

/// The inner method of a websocket request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method", content = "params")]
pub enum WsMethodRequest {
    /// Subscribe method
    Subscribe(SubscriptionParams),
    /// Unsubscribe method
    Unsubscribe(WsUnsubscribeRequest),
}

impl WsMethodRequest {
    /// Subscription id the request concerns
    pub fn sub_id(&self) -> &SubId {
        match self {
            Self::Subscribe(params) => &params.id,
            Self::Unsubscribe(request) => &request.sub_id,
        }
    }
}

/// Websocket request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsRequest {
    /// JSON RPC version
    pub jsonrpc: String,
    /// The method body
    #[serde(flatten)]
    pub method: WsMethodRequest,
    /// The request ID
    pub id: usize,
}

impl From<(WsMethodRequest, usize)> for WsRequest {
    fn from((method, id): (WsMethodRequest, usize)) -> Self {
        WsRequest {
            jsonrpc: JSON_RPC_VERSION.to_owned(),
            method,
            id,
        }
    }
}

/// The response to a subscription request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsSubscribeResponse {
    /// Status
    pub status: String,
    /// Subscription ID
    #[serde(rename = "subId")]
    pub sub_id: SubId,
}

/// The response to an unsubscription request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsUnsubscribeResponse {
    /// Status
    pub status: String,
    /// Subscription ID
    #[serde(rename = "subId")]
    pub sub_id: SubId,
}

/// Result payload of a websocket response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WsResponseResult {
    /// A response to a subscription request
    Subscribe(WsSubscribeResponse),
    /// A response to an unsubscription request
    Unsubscribe(WsUnsubscribeResponse),
}

impl WsResponseResult {
    /// Subscription id the response concerns
    pub fn sub_id(&self) -> &SubId {
        match self {
            Self::Subscribe(response) => &response.sub_id,
            Self::Unsubscribe(response) => &response.sub_id,
        }
    }
}

/// Websocket response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsResponse {
    /// JSON RPC version
    pub jsonrpc: String,
    /// The result
    pub result: WsResponseResult,
    /// The request ID
    pub id: usize,
}

/// Websocket error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsErrorBody {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
}

/// Websocket error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsErrorResponse {
    /// JSON RPC version
    pub jsonrpc: String,
    /// The error
    pub error: WsErrorBody,
    /// The request ID
    pub id: usize,
}

/// Notification payload.
///
/// Untagged: the payload shape itself identifies the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationPayload {
    /// Proof state changed
    ProofState(ProofStateInfo),
    /// Melt quote state changed
    MeltQuote(MeltQuoteResponse),
    /// Mint quote state changed
    MintQuote(MintQuoteResponse),
}

/// Identity of a notification, for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotificationId {
    /// Proof state notifications are identified by the proof Y value
    ProofState(PublicKey),
    /// Melt quote notifications are identified by the quote id
    MeltQuote(String),
    /// Mint quote notifications are identified by the quote id
    MintQuote(String),
}

impl NotificationPayload {
    /// Identity of the notification
    pub fn id(&self) -> NotificationId {
        match self {
            Self::ProofState(proof_state) => NotificationId::ProofState(proof_state.y.clone()),
            Self::MeltQuote(melt_quote) => NotificationId::MeltQuote(melt_quote.quote.clone()),
            Self::MintQuote(mint_quote) => NotificationId::MintQuote(mint_quote.quote.clone()),
        }
    }

    /// The payload's state field in its wire form, for state comparison
    pub fn state_str(&self) -> String {
        match self {
            Self::ProofState(proof_state) => proof_state.state.to_string(),
            Self::MeltQuote(melt_quote) => melt_quote.state.to_string(),
            Self::MintQuote(mint_quote) => mint_quote.state.to_string(),
        }
    }
}

/// Notification params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsNotificationParams {
    /// The subscription ID
    #[serde(rename = "subId")]
    pub sub_id: SubId,
    /// The notification payload
    pub payload: NotificationPayload,
}

/// Notification from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsNotification {
    /// JSON RPC version
    pub jsonrpc: String,
    /// The method
    pub method: String,
    /// The parameters
    pub params: WsNotificationParams,
}

impl WsNotification {
    /// Wrap a payload into a notification frame
    pub fn new(sub_id: SubId, payload: NotificationPayload) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_owned(),
            method: "subscribe".to_owned(),
            params: WsNotificationParams { sub_id, payload },
        }
    }
}

/// Message from the server to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WsMessageOrResponse {
    /// A notification
    Notification(WsNotification),
    /// A response to a request
    Response(WsResponse),
    /// An error response
    ErrorResponse(WsErrorResponse),
}
