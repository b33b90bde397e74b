//! Wallet engine errors

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use purse_core::mint_url::MintUrl;

/// Wallet engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Operation targets a mint that has not been trusted
    #[error("Unknown mint: `{0}`")]
    UnknownMint(MintUrl),
    /// Selection could not cover the required amount
    #[error("Insufficient funds")]
    InsufficientFunds,
    /// Amount or invariant violation at the API boundary
    #[error("Proof validation failed: {0}")]
    ProofValidation(String),
    /// Operation is in the wrong state for the requested action
    #[error("Illegal state transition: {0}")]
    IllegalStateTransition(String),
    /// Another task holds the lease for this operation
    #[error("Operation `{0}` already in progress")]
    OperationInProgress(Uuid),
    /// A recovery pass is already running
    #[error("Recovery already in progress")]
    RecoveryInProgress,
    /// Unexpected or invalid mint response
    #[error("Mint protocol error: {0}")]
    MintProtocol(String),
    /// Network failure at the transport boundary
    #[error("Transport error: {0}")]
    Transport(String),
    /// Operation record not found
    #[error("Unknown operation: `{0}`")]
    UnknownOperation(Uuid),
    /// Melt quote not found
    #[error("Quote unknown")]
    QuoteUnknown,
    /// Quote expired before it could be used
    #[error("Quote expired")]
    QuoteExpired,
    /// Quote not paid
    #[error("Quote not paid")]
    QuoteNotPaid,
    /// Token already spent
    #[error("Token already spent")]
    TokenAlreadySpent,
    /// No keyset of the mint is active for the unit
    #[error("No active keyset")]
    NoActiveKeyset,
    /// Keyset not known to the mint
    #[error("Keyset not found")]
    KeysetNotFound,
    /// Http error
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// Unknown error response from the mint
    #[error("Unknown error response: `{0}`")]
    UnknownErrorResponse(String),
    /// Core type error
    #[error(transparent)]
    Core(#[from] purse_core::Error),
    /// Mint url error
    #[error(transparent)]
    MintUrl(#[from] purse_core::mint_url::Error),
    /// Database error
    #[error(transparent)]
    Database(#[from] crate::database::Error),
    /// Signer error
    #[error("Signer error: {0}")]
    Signer(String),
    /// Serde error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Custom error
    #[error("`{0}`")]
    Custom(String),
}

/// Error body returned by mint endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: ErrorCode,
    /// Human readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorResponse {
    /// Decode an error response from a value that failed to parse as
    /// the expected success body
    pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        serde_json::from_value(value.clone())
            .map_err(|_| Error::UnknownErrorResponse(value.to_string()))
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.code.to_code(),
            self.error.as_deref().or(self.detail.as_deref()).unwrap_or("")
        )
    }
}

impl From<ErrorResponse> for Error {
    fn from(err: ErrorResponse) -> Error {
        match err.code {
            ErrorCode::TokenAlreadySpent => Self::TokenAlreadySpent,
            ErrorCode::QuoteNotPaid => Self::QuoteNotPaid,
            ErrorCode::KeysetNotFound => Self::KeysetNotFound,
            _ => Self::UnknownErrorResponse(err.to_string()),
        }
    }
}

/// Well-known mint error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Token already spent
    TokenAlreadySpent,
    /// Quote is not paid
    QuoteNotPaid,
    /// Keyset not found
    KeysetNotFound,
    /// Unknown error code
    Unknown(u16),
}

impl ErrorCode {
    /// From the numeric wire code
    pub fn from_code(code: u16) -> Self {
        match code {
            11001 => Self::TokenAlreadySpent,
            12001 => Self::KeysetNotFound,
            20001 => Self::QuoteNotPaid,
            other => Self::Unknown(other),
        }
    }

    /// To the numeric wire code
    pub fn to_code(self) -> u16 {
        match self {
            Self::TokenAlreadySpent => 11001,
            Self::KeysetNotFound => 12001,
            Self::QuoteNotPaid => 20001,
            Self::Unknown(code) => code,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u16(self.to_code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = u16::deserialize(deserializer)?;
        Ok(ErrorCode::from_code(code))
    }
}
