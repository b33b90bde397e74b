//! Engine-local types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use purse_core::mint_url::MintUrl;
use purse_core::quote::MeltQuoteState;
use purse_core::{Amount, Proof, PublicKey};

use crate::error::Error;

/// Local lifecycle state of a proof.
///
/// Distinct from the mint-side spend state: a proof the mint still
/// reports `UNSPENT` may already be `inflight` locally because an
/// operation has committed to spending it.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofState {
    /// Spendable
    Ready,
    /// Committed to an operation that has reached the mint
    Inflight,
    /// Consumed; retained for audit only
    Spent,
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Inflight => write!(f, "inflight"),
            Self::Spent => write!(f, "spent"),
        }
    }
}

impl FromStr for ProofState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "inflight" => Ok(Self::Inflight),
            "spent" => Ok(Self::Spent),
            _ => Err(Error::IllegalStateTransition(format!(
                "unknown proof state `{s}`"
            ))),
        }
    }
}

/// A proof with everything the store tracks about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofInfo {
    /// Proof
    pub proof: Proof,
    /// Y value of the proof secret
    pub y: PublicKey,
    /// Mint Url
    pub mint_url: MintUrl,
    /// Proof state
    pub state: ProofState,
    /// Unit
    pub unit: String,
    /// Operation that has reserved or is spending this proof
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by_operation: Option<Uuid>,
    /// Operation that created this proof
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_operation: Option<Uuid>,
}

impl ProofInfo {
    /// Create new [`ProofInfo`]
    pub fn new(
        proof: Proof,
        y: PublicKey,
        mint_url: MintUrl,
        state: ProofState,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            proof,
            y,
            mint_url,
            state,
            unit: unit.into(),
            used_by_operation: None,
            created_by_operation: None,
        }
    }

    /// Attach the operation that created this proof
    pub fn created_by(mut self, operation_id: Uuid) -> Self {
        self.created_by_operation = Some(operation_id);
        self
    }

    /// Attach the operation that is using this proof
    pub fn used_by(mut self, operation_id: Uuid) -> Self {
        self.used_by_operation = Some(operation_id);
        self
    }

    /// Check if the proof matches the given filters
    pub fn matches_conditions(
        &self,
        mint_url: &Option<MintUrl>,
        unit: &Option<String>,
        states: &Option<Vec<ProofState>>,
    ) -> bool {
        if let Some(mint_url) = mint_url {
            if mint_url.ne(&self.mint_url) {
                return false;
            }
        }

        if let Some(unit) = unit {
            if unit.ne(&self.unit) {
                return false;
            }
        }

        if let Some(states) = states {
            if !states.contains(&self.state) {
                return false;
            }
        }

        true
    }

    /// An orphan is a proof that is mid-operation but not attributed to
    /// any operation; only recovery should ever observe one.
    pub fn is_orphan(&self) -> bool {
        self.state != ProofState::Ready && self.used_by_operation.is_none()
    }
}

/// Outcome of a settled melt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Melted {
    /// Final state of the quote
    pub state: MeltQuoteState,
    /// Preimage of the settled payment
    pub preimage: Option<String>,
    /// Amount melted
    pub amount: Amount,
    /// Fee paid on top of the amount
    pub fee_paid: Amount,
    /// Change returned for the unused fee reserve
    pub change: Amount,
}

/// Transaction direction
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionDirection {
    /// Incoming (receive or mint)
    Incoming,
    /// Outgoing (send or melt)
    Outgoing,
}

impl fmt::Display for TransactionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionDirection::Incoming => write!(f, "Incoming"),
            TransactionDirection::Outgoing => write!(f, "Outgoing"),
        }
    }
}

/// History record of a settled operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Mint Url
    pub mint_url: MintUrl,
    /// Direction
    pub direction: TransactionDirection,
    /// Amount
    pub amount: Amount,
    /// Fee
    pub fee: Amount,
    /// Unit
    pub unit: String,
    /// Unix timestamp
    pub timestamp: u64,
    /// Quote id for mint/melt transactions
    pub quote_id: Option<String>,
    /// Payment proof, e.g. a lightning preimage
    pub payment_proof: Option<String>,
    /// Operation this transaction settled
    pub operation_id: Option<Uuid>,
}

impl Transaction {
    /// Check if transaction matches the given filters
    pub fn matches_conditions(
        &self,
        mint_url: &Option<MintUrl>,
        direction: &Option<TransactionDirection>,
        unit: &Option<String>,
    ) -> bool {
        if let Some(mint_url) = mint_url {
            if &self.mint_url != mint_url {
                return false;
            }
        }
        if let Some(direction) = direction {
            if &self.direction != direction {
                return false;
            }
        }
        if let Some(unit) = unit {
            if &self.unit != unit {
                return false;
            }
        }
        true
    }
}

/// Locally persisted mint quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintQuote {
    /// Quote id
    pub id: String,
    /// Mint Url
    pub mint_url: MintUrl,
    /// Amount of quote
    pub amount: Amount,
    /// Unit of quote
    pub unit: String,
    /// Payment request to fulfill
    pub request: String,
    /// Quote state
    pub state: purse_core::quote::MintQuoteState,
    /// Expiration of quote
    pub expiry: u64,
}

/// Locally persisted melt quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltQuote {
    /// Quote id
    pub id: String,
    /// Mint Url
    pub mint_url: MintUrl,
    /// Unit of quote
    pub unit: String,
    /// Amount to be paid
    pub amount: Amount,
    /// Payment request being settled
    pub request: String,
    /// Fee reserve
    pub fee_reserve: Amount,
    /// Quote state
    pub state: MeltQuoteState,
    /// Expiration of quote
    pub expiry: u64,
    /// Payment preimage once paid
    pub payment_preimage: Option<String>,
}
