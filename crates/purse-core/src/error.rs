//! Core errors

use thiserror::Error;

/// Core type error
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid compressed point encoding
    #[error("Invalid public key")]
    InvalidPublicKey,
    /// Invalid keyset id encoding
    #[error("Invalid keyset id")]
    InvalidKeysetId,
    /// Amount arithmetic overflowed
    #[error("Amount overflow")]
    AmountOverflow,
    /// A state string did not match any known state
    #[error("Unknown state: `{0}`")]
    UnknownState(String),
    /// Mint url error
    #[error(transparent)]
    MintUrl(#[from] crate::mint_url::Error),
    /// Secret error
    #[error(transparent)]
    Secret(#[from] crate::secret::Error),
    /// Serde error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
