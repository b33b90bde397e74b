//! Quote and mint-endpoint bodies

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::Error;
use crate::keys::{KeySet, KeySetInfo, PublicKey};
use crate::proof::{BlindSignature, BlindedMessage, Proofs};

/// State of a mint (issue) quote
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MintQuoteState {
    /// Quote has not been paid
    #[default]
    Unpaid,
    /// Quote has been paid and wallet can mint
    Paid,
    /// Ecash issued for quote
    Issued,
}

impl fmt::Display for MintQuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpaid => write!(f, "UNPAID"),
            Self::Paid => write!(f, "PAID"),
            Self::Issued => write!(f, "ISSUED"),
        }
    }
}

impl FromStr for MintQuoteState {
    type Err = Error;

    fn from_str(state: &str) -> Result<Self, Self::Err> {
        match state {
            "UNPAID" => Ok(Self::Unpaid),
            "PAID" => Ok(Self::Paid),
            "ISSUED" => Ok(Self::Issued),
            _ => Err(Error::UnknownState(state.to_string())),
        }
    }
}

/// State of a melt quote
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeltQuoteState {
    /// Quote has not been paid
    #[default]
    Unpaid,
    /// Lightning payment is in flight
    Pending,
    /// Lightning payment settled
    Paid,
}

impl fmt::Display for MeltQuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpaid => write!(f, "UNPAID"),
            Self::Pending => write!(f, "PENDING"),
            Self::Paid => write!(f, "PAID"),
        }
    }
}

impl FromStr for MeltQuoteState {
    type Err = Error;

    fn from_str(state: &str) -> Result<Self, Self::Err> {
        match state {
            "UNPAID" => Ok(Self::Unpaid),
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            _ => Err(Error::UnknownState(state.to_string())),
        }
    }
}

/// State of a proof as known to the mint
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpendState {
    /// Not spent
    Unspent,
    /// Currently being used in a transaction
    Pending,
    /// Spent
    Spent,
}

impl fmt::Display for SpendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspent => write!(f, "UNSPENT"),
            Self::Pending => write!(f, "PENDING"),
            Self::Spent => write!(f, "SPENT"),
        }
    }
}

impl FromStr for SpendState {
    type Err = Error;

    fn from_str(state: &str) -> Result<Self, Self::Err> {
        match state {
            "UNSPENT" => Ok(Self::Unspent),
            "PENDING" => Ok(Self::Pending),
            "SPENT" => Ok(Self::Spent),
            _ => Err(Error::UnknownState(state.to_string())),
        }
    }
}

/// Mint quote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuoteRequest {
    /// Amount to mint
    pub amount: Amount,
    /// Unit wallet would like to mint in
    pub unit: String,
    /// Memo to create the invoice with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Mint quote response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintQuoteResponse {
    /// Quote Id
    pub quote: String,
    /// Payment request to fulfill, e.g. a bolt11 invoice
    pub request: String,
    /// Quote state
    pub state: MintQuoteState,
    /// Unix timestamp until which the quote is valid
    pub expiry: u64,
}

/// Mint (issue) request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    /// Quote id
    pub quote: String,
    /// Outputs to be signed
    pub outputs: Vec<BlindedMessage>,
}

/// Mint (issue) response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintResponse {
    /// Blind signatures on the outputs
    pub signatures: Vec<BlindSignature>,
}

/// Melt quote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltQuoteRequest {
    /// Payment request to settle, e.g. a bolt11 invoice (opaque here)
    pub request: String,
    /// Unit wallet would like to pay with
    pub unit: String,
}

/// Melt quote response.
///
/// Also the body returned from the melt endpoint itself and pushed in
/// melt-quote notifications; the optional fields fill in as the
/// payment progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltQuoteResponse {
    /// Quote Id
    pub quote: String,
    /// The amount that needs to be provided
    pub amount: Amount,
    /// The fee reserve that is required
    pub fee_reserve: Amount,
    /// Quote state
    pub state: MeltQuoteState,
    /// Unix timestamp until which the quote is valid
    pub expiry: u64,
    /// Payment preimage, once paid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_preimage: Option<String>,
    /// Lightning-fee change, signatures on the blank outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Vec<BlindSignature>>,
}

/// Melt request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeltRequest {
    /// Quote id
    pub quote: String,
    /// Proofs to spend
    pub inputs: Proofs,
    /// Blank outputs for lightning-fee change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<BlindedMessage>>,
}

/// Swap request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    /// Proofs being consumed
    pub inputs: Proofs,
    /// Outputs to be signed
    pub outputs: Vec<BlindedMessage>,
}

/// Swap response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapResponse {
    /// Blind signatures on the outputs, in request order
    pub signatures: Vec<BlindSignature>,
}

/// Check-state request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStateRequest {
    /// Y values of the proofs to check
    #[serde(rename = "Ys")]
    pub ys: Vec<PublicKey>,
}

impl CheckStateRequest {
    /// Maximum Y values accepted per request
    pub const MAX_YS: usize = 100;
}

/// State of a single proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStateInfo {
    /// Y of proof
    #[serde(rename = "Y")]
    pub y: PublicKey,
    /// State of proof
    pub state: SpendState,
    /// Witness data if it was supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
}

impl From<(PublicKey, SpendState)> for ProofStateInfo {
    fn from(value: (PublicKey, SpendState)) -> Self {
        Self {
            y: value.0,
            state: value.1,
            witness: None,
        }
    }
}

/// Check-state response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStateResponse {
    /// Proof states, in request order
    pub states: Vec<ProofStateInfo>,
}

/// Restore request.
///
/// Asks the mint to re-issue the signatures it has already made on the
/// given blinded messages. Signing is deterministic on the mint side,
/// so a wallet that can rebuild its outputs can always recover the
/// proofs they became.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Outputs to restore signatures for
    pub outputs: Vec<BlindedMessage>,
}

/// Restore response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResponse {
    /// The subset of requested outputs the mint had seen
    pub outputs: Vec<BlindedMessage>,
    /// Signatures for those outputs, index-aligned
    pub signatures: Vec<BlindSignature>,
}

/// Keys endpoint response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysResponse {
    /// Keysets with their keys
    pub keysets: Vec<KeySet>,
}

/// Keysets endpoint response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetResponse {
    /// Keyset infos
    pub keysets: Vec<KeySetInfo>,
}

/// Mint info, as returned by the info endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintInfo {
    /// Mint name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Mint software version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Message of the day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
}
