//! Proofs, blinded messages and signatures

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::Error;
use crate::keys::{KeysetId, PublicKey};
use crate::secret::Secret;

/// Proofs
pub type Proofs = Vec<Proof>;

/// Blinded Message (also called `output`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlindedMessage {
    /// The value for the requested [`BlindSignature`]
    pub amount: Amount,
    /// ID of the keyset the signature is expected from
    #[serde(rename = "id")]
    pub keyset_id: KeysetId,
    /// The blinded secret message (B_) generated by the sender
    #[serde(rename = "B_")]
    pub blinded_secret: PublicKey,
}

impl BlindedMessage {
    /// Compose new blinded message
    #[inline]
    pub fn new(amount: Amount, keyset_id: KeysetId, blinded_secret: PublicKey) -> Self {
        Self {
            amount,
            keyset_id,
            blinded_secret,
        }
    }
}

/// Blind Signature (also called `promise`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindSignature {
    /// The value of the blinded token
    pub amount: Amount,
    /// ID of the mint keys that signed the token
    #[serde(rename = "id")]
    pub keyset_id: KeysetId,
    /// The blinded signature (C_) on the secret message `B_`
    #[serde(rename = "C_")]
    pub c: PublicKey,
}

/// DLEQ proof on an unblinded signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProofDleq {
    /// e value
    pub e: String,
    /// s value
    pub s: String,
    /// Blinding factor
    pub r: String,
}

/// A single ecash unit: unblinded signature, secret and amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Amount
    pub amount: Amount,
    /// Id of the keyset that signed this proof
    #[serde(rename = "id")]
    pub keyset_id: KeysetId,
    /// Secret message
    pub secret: Secret,
    /// Unblinded signature
    #[serde(rename = "C")]
    pub c: PublicKey,
    /// Witness for scripted spends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
    /// DLEQ Proof
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dleq: Option<ProofDleq>,
}

impl Proof {
    /// Create new [`Proof`]
    pub fn new(amount: Amount, keyset_id: KeysetId, secret: Secret, c: PublicKey) -> Self {
        Proof {
            amount,
            keyset_id,
            secret,
            c,
            witness: None,
            dleq: None,
        }
    }
}

impl Hash for Proof {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.secret.hash(state);
    }
}

impl Ord for Proof {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.amount.cmp(&other.amount)
    }
}

impl PartialOrd for Proof {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Helpers on collections of proofs
pub trait ProofsMethods {
    /// Sum of the proof amounts
    fn total_amount(&self) -> Result<Amount, Error>;

    /// Secrets of the proofs, in order
    fn secrets(&self) -> Vec<Secret>;
}

impl ProofsMethods for Proofs {
    fn total_amount(&self) -> Result<Amount, Error> {
        self.iter()
            .try_fold(Amount::ZERO, |acc, p| acc.checked_add(p.amount))
            .ok_or(Error::AmountOverflow)
    }

    fn secrets(&self) -> Vec<Secret> {
        self.iter().map(|p| p.secret.clone()).collect()
    }
}

/// A blinded message together with the secret data needed to unblind
/// the mint's signature on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreMint {
    /// Blinded message
    pub blinded_message: BlindedMessage,
    /// Secret
    pub secret: Secret,
    /// Blinding factor, hex encoded
    pub r: String,
    /// Amount
    pub amount: Amount,
}

/// A counter-backed set of blinded messages awaiting signatures.
///
/// Derivation is deterministic in `(keyset_id, counter)`, which is what
/// makes post-crash recovery possible: rebuilding the same set yields
/// the same blinded messages, and the mint will answer a restore
/// request for them with the signatures it already issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreMintSecrets {
    /// Blinded messages and their secrets
    pub secrets: Vec<PreMint>,
    /// Keyset id the messages were derived against
    pub keyset_id: KeysetId,
    /// First derivation counter consumed by this set
    pub counter_start: u32,
}

impl PreMintSecrets {
    /// Create a new, empty set
    pub fn new(keyset_id: KeysetId, counter_start: u32) -> Self {
        Self {
            secrets: Vec::new(),
            keyset_id,
            counter_start,
        }
    }

    /// Blinded messages, in derivation order
    pub fn blinded_messages(&self) -> Vec<BlindedMessage> {
        self.secrets.iter().map(|p| p.blinded_message.clone()).collect()
    }

    /// Secrets, in derivation order
    pub fn secrets(&self) -> Vec<Secret> {
        self.secrets.iter().map(|p| p.secret.clone()).collect()
    }

    /// Total amount across the set
    pub fn total_amount(&self) -> Result<Amount, Error> {
        self.secrets
            .iter()
            .try_fold(Amount::ZERO, |acc, p| acc.checked_add(p.amount))
            .ok_or(Error::AmountOverflow)
    }

    /// Number of blinded messages
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// One past the last derivation counter consumed by this set
    pub fn counter_end(&self) -> u32 {
        self.counter_start + self.secrets.len() as u32
    }
}
