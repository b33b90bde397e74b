//! Keys and keysets

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::amount::Amount;
use crate::error::Error;

/// A point on the curve in compressed form.
///
/// Kept opaque: the engine never does point arithmetic itself, it only
/// stores, compares and transmits points (unblinded signatures `C`,
/// blinded secrets `B_`, proof Y values). Validated to be 33 bytes of
/// lowercase hex with an 02/03 parity prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(String);

impl PublicKey {
    const HEX_LEN: usize = 66;

    /// Parse a compressed point from hex
    pub fn from_hex<S>(hex: S) -> Result<Self, Error>
    where
        S: AsRef<str>,
    {
        let hex = hex.as_ref().to_lowercase();

        if hex.len() != Self::HEX_LEN {
            return Err(Error::InvalidPublicKey);
        }

        if !hex.starts_with("02") && !hex.starts_with("03") {
            return Err(Error::InvalidPublicKey);
        }

        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidPublicKey);
        }

        Ok(Self(hex))
    }

    /// Hex representation
    pub fn to_hex(&self) -> String {
        self.0.clone()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(s).map_err(serde::de::Error::custom)
    }
}

/// A keyset ID is an identifier for a specific keyset. It can be
/// derived by anyone who knows the set of public keys of a mint and is
/// stored in every proof so the signing keyset can be identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeysetId([u8; KeysetId::BYTES]);

impl KeysetId {
    const BYTES: usize = 8;
    const STRLEN: usize = 16;

    /// Id as bytes
    pub fn to_bytes(self) -> [u8; Self::BYTES] {
        self.0
    }
}

impl fmt::Display for KeysetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for KeysetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::STRLEN || !s.is_ascii() {
            return Err(Error::InvalidKeysetId);
        }

        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidKeysetId)?;
        }

        Ok(Self(bytes))
    }
}

impl Serialize for KeysetId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeysetId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        KeysetId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Mint public keys per denomination
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keys(#[serde_as(as = "BTreeMap<DisplayFromStr, _>")] BTreeMap<Amount, PublicKey>);

impl Keys {
    /// Create new [`Keys`]
    pub fn new(keys: BTreeMap<Amount, PublicKey>) -> Self {
        Self(keys)
    }

    /// Key for an amount
    pub fn amount_key(&self, amount: Amount) -> Option<&PublicKey> {
        self.0.get(&amount)
    }

    /// Iterate over (amount, key) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&Amount, &PublicKey)> {
        self.0.iter()
    }

    /// Number of denominations
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the keyset is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Keyset with its keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    /// Keyset [`KeysetId`]
    pub id: KeysetId,
    /// Currency unit, as its wire string
    pub unit: String,
    /// Keyset keys
    pub keys: Keys,
}

/// Keyset info, as returned by the keysets endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySetInfo {
    /// Keyset [`KeysetId`]
    pub id: KeysetId,
    /// Keyset unit
    pub unit: String,
    /// Whether the keyset is actively signing
    pub active: bool,
    /// Input fee, per thousand proofs spent
    #[serde(default)]
    pub input_fee_ppk: u64,
}
