//! Input fee arithmetic
//!
//! Keysets charge `input_fee_ppk` per proof spent, in thousandths of
//! the unit. The fee for a set of inputs is the sum over the set,
//! rounded up to a whole unit.

use std::collections::HashMap;

use purse_core::{Amount, KeysetId};

use crate::error::Error;

/// Fee required to spend a proof set
pub fn calculate_fee(
    proofs_count: &HashMap<KeysetId, u64>,
    keyset_fee_ppk: &HashMap<KeysetId, u64>,
) -> Result<Amount, Error> {
    let mut sum_fee = 0;

    for (keyset_id, proof_count) in proofs_count {
        let fee_ppk = keyset_fee_ppk
            .get(keyset_id)
            .ok_or(Error::KeysetNotFound)?;

        sum_fee += fee_ppk * proof_count;
    }

    let fee = (sum_fee + 999) / 1000;

    Ok(fee.into())
}
