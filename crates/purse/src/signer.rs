//! Blind-signature capability
//!
//! The engine treats the underlying blind-signature scheme as an
//! external collaborator: everything it needs from it is expressed on
//! the [`EcashSigner`] trait, threaded through explicitly rather than
//! reached for ambiently. Derivation must be deterministic in
//! `(keyset_id, counter)` so that output data persisted before a crash
//! re-derives to byte-identical blinded messages afterwards.

use std::fmt::Debug;

use purse_core::{Amount, BlindSignature, Keys, KeysetId, PreMintSecrets, Proofs, PublicKey, Secret};

use crate::error::Error;

/// Capability to blind, unblind and identify ecash secrets
pub trait EcashSigner: Debug + Send + Sync {
    /// Y value of a secret, the point the mint tracks spend state under
    fn y_for_secret(&self, secret: &Secret) -> Result<PublicKey, Error>;

    /// Derive a set of blinded messages with the given amounts from the
    /// derivation counter range starting at `counter_start`
    fn premint_secrets(
        &self,
        keyset_id: KeysetId,
        counter_start: u32,
        amounts: &[Amount],
    ) -> Result<PreMintSecrets, Error>;

    /// Unblind signatures against the premint set they were issued
    /// for. `signatures` may be a prefix of the set (change for blank
    /// outputs); alignment is by index.
    fn unblind_signatures(
        &self,
        signatures: &[BlindSignature],
        premint: &PreMintSecrets,
        keys: &Keys,
    ) -> Result<Proofs, Error>;
}

/// Number of blank outputs needed to return up to `overshoot` in
/// change: `max(ceil(log2(overshoot)), 1)`, or none at all when there
/// is nothing to return.
pub fn blank_output_count(overshoot: Amount) -> usize {
    let overshoot = u64::from(overshoot);
    if overshoot == 0 {
        return 0;
    }

    let bits = (64 - overshoot.leading_zeros()) as usize;
    let count = if overshoot.is_power_of_two() {
        bits - 1
    } else {
        bits
    };

    count.max(1)
}
