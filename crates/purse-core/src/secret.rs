//! Proof secrets

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Secret error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Empty secret
    #[error("Secret is empty")]
    Empty,
}

/// The secret data that allows spending ecash.
///
/// Unique per proof within a mint; `(mint_url, secret)` is the proof's
/// identity everywhere in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    const BIT_LENGTH: usize = 128;

    /// Create a secret from an existing value
    pub fn new<S>(secret: S) -> Self
    where
        S: Into<String>,
    {
        Self(secret.into())
    }

    /// Generate a random secret
    pub fn generate() -> Self {
        use base64::engine::general_purpose::URL_SAFE;
        use base64::Engine as _;
        use rand::RngCore;

        let mut random_bytes = [0u8; Self::BIT_LENGTH / 8];
        rand::rng().fill_bytes(&mut random_bytes);

        Self(URL_SAFE.encode(random_bytes))
    }

    /// Secret as bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Secret as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Secret {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::Empty);
        }
        Ok(Self(s.to_string()))
    }
}
