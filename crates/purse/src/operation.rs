//! Melt operation records
//!
//! A melt is a multi-phase saga; the record of one is a tagged union
//! over its phase, persisted on every transition so a crash in any
//! phase can be recovered. All phases from `prepared` onward carry the
//! same [`PreparedMelt`] data.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use purse_core::mint_url::MintUrl;
use purse_core::{Amount, PreMintSecrets, Secret};

use crate::util::unix_time;

/// Data fixed at prepare time and carried through every later phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedMelt {
    /// Melt quote id
    pub quote_id: String,
    /// Invoice amount, from the quote
    pub amount: Amount,
    /// Upper bound on the lightning fee, from the quote
    pub fee_reserve: Amount,
    /// Fee consumed by the pre-swap, zero when not swapping
    pub swap_fee: Amount,
    /// Whether the inputs are pre-swapped into exact denominations
    pub needs_swap: bool,
    /// Sum of the selected input proofs
    pub input_amount: Amount,
    /// Secrets of the selected input proofs
    pub input_proof_secrets: Vec<Secret>,
    /// Blank outputs for lightning-fee change
    pub change_outputs: PreMintSecrets,
    /// Swap outputs when pre-swapping
    pub swap_outputs: Option<SwapOutputs>,
}

impl PreparedMelt {
    /// Secrets of the proofs that go into the melt request: the swap
    /// `send` outputs when a swap happens, otherwise the original
    /// inputs.
    pub fn melt_input_secrets(&self) -> Vec<Secret> {
        match (&self.swap_outputs, self.needs_swap) {
            (Some(swap_outputs), true) => swap_outputs.send.secrets(),
            _ => self.input_proof_secrets.clone(),
        }
    }
}

/// Output data of the pre-swap: an exact-sum `send` partition that
/// becomes the melt input, and a `keep` partition returned to the
/// wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapOutputs {
    /// Outputs consumed by the melt
    pub send: PreMintSecrets,
    /// Outputs kept by the wallet
    pub keep: PreMintSecrets,
}

/// Phase of a melt operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum MeltState {
    /// Created; no proofs reserved
    Init,
    /// Quote obtained, proofs reserved
    Prepared(PreparedMelt),
    /// Mint call in flight
    Executing(PreparedMelt),
    /// Mint replied PENDING; lightning payment in progress
    Pending(PreparedMelt),
    /// Input proofs spent, change saved
    Finalized(PreparedMelt),
    /// Transient, only entered from `pending`
    RollingBack(PreparedMelt),
    /// Terminal failure
    RolledBack(PreparedMelt),
}

impl MeltState {
    /// String form of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Prepared(_) => "prepared",
            Self::Executing(_) => "executing",
            Self::Pending(_) => "pending",
            Self::Finalized(_) => "finalized",
            Self::RollingBack(_) => "rolling_back",
            Self::RolledBack(_) => "rolled_back",
        }
    }

    /// Prepared data, present in every phase after `init`
    pub fn prepared(&self) -> Option<&PreparedMelt> {
        match self {
            Self::Init => None,
            Self::Prepared(data)
            | Self::Executing(data)
            | Self::Pending(data)
            | Self::Finalized(data)
            | Self::RollingBack(data)
            | Self::RolledBack(data) => Some(data),
        }
    }

    /// Whether the phase is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized(_) | Self::RolledBack(_))
    }
}

impl std::fmt::Display for MeltState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record of a melt operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltOperation {
    /// Unique operation id
    pub id: Uuid,
    /// Mint the melt runs against
    pub mint_url: MintUrl,
    /// Currency unit
    pub unit: String,
    /// Payment method, `bolt11`
    pub method: String,
    /// Method payload: the invoice being settled
    pub method_data: String,
    /// Creation timestamp (unix seconds)
    pub created_at: u64,
    /// Last update timestamp (unix seconds)
    pub updated_at: u64,
    /// Failure description, set when rolled back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Current phase
    pub state: MeltState,
}

impl MeltOperation {
    /// Create a new operation in `init`
    pub fn new(mint_url: MintUrl, unit: impl Into<String>, method_data: impl Into<String>) -> Self {
        let now = unix_time();
        Self {
            id: Uuid::new_v4(),
            mint_url,
            unit: unit.into(),
            method: "bolt11".to_string(),
            method_data: method_data.into(),
            created_at: now,
            updated_at: now,
            error: None,
            state: MeltState::Init,
        }
    }

    /// Advance to a new phase, refreshing the update timestamp
    pub fn with_state(mut self, state: MeltState) -> Self {
        self.state = state;
        self.updated_at = unix_time();
        self
    }

    /// Advance to a new phase with a failure description
    pub fn with_error(mut self, state: MeltState, error: impl Into<String>) -> Self {
        self.state = state;
        self.error = Some(error.into());
        self.updated_at = unix_time();
        self
    }

    /// Quote id, once prepared
    pub fn quote_id(&self) -> Option<&str> {
        self.state.prepared().map(|data| data.quote_id.as_str())
    }

    /// Whether the operation has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
