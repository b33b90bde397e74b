//! Proof selection
//!
//! Deterministic selection of spendable proofs for a target amount.
//! Reservation and state transitions live on the database trait; this
//! module only decides which proofs to use.

use std::sync::Arc;

use purse_core::mint_url::MintUrl;
use purse_core::Amount;

use crate::database::WalletDatabase;
use crate::error::Error;
use crate::types::{ProofInfo, ProofState};

/// Sum of the proofs' amounts
pub fn total_amount(proofs: &[ProofInfo]) -> Amount {
    proofs.iter().map(|p| p.proof.amount).sum()
}

/// Select spendable proofs of a mint and unit covering
/// `target_amount`, without reserving them
pub async fn select_for_send(
    db: &Arc<dyn WalletDatabase>,
    mint_url: &MintUrl,
    target_amount: Amount,
    unit: &str,
    allow_small_denoms: bool,
) -> Result<Vec<ProofInfo>, Error> {
    let candidates = db
        .get_proofs(
            Some(mint_url.clone()),
            Some(unit.to_string()),
            Some(vec![ProofState::Ready]),
        )
        .await?;

    select_proofs(candidates, target_amount, allow_small_denoms)
}

/// Select `ready`, unreserved proofs summing to at least
/// `target_amount`.
///
/// Policy: prefer a subset that sums exactly to the target; otherwise
/// overshoot minimally, consuming large denominations first, or small
/// denominations first when `allow_small_denoms` is set (useful to
/// sweep dust before it accumulates). Deterministic for a given
/// candidate set: ties are broken on the proof secret.
pub fn select_proofs(
    candidates: Vec<ProofInfo>,
    target_amount: Amount,
    allow_small_denoms: bool,
) -> Result<Vec<ProofInfo>, Error> {
    let mut candidates: Vec<ProofInfo> = candidates
        .into_iter()
        .filter(|info| info.state == ProofState::Ready && info.used_by_operation.is_none())
        .collect();

    candidates.sort_by(|a, b| {
        b.proof
            .amount
            .cmp(&a.proof.amount)
            .then_with(|| a.proof.secret.cmp(&b.proof.secret))
    });

    if total_amount(&candidates) < target_amount {
        return Err(Error::InsufficientFunds);
    }

    if target_amount == Amount::ZERO {
        return Ok(Vec::new());
    }

    if let Some(exact) = select_exact(&candidates, target_amount) {
        return Ok(exact);
    }

    if allow_small_denoms {
        candidates.reverse();
    }

    let mut selected = Vec::new();
    let mut selected_amount = Amount::ZERO;
    for candidate in candidates {
        selected_amount += candidate.proof.amount;
        selected.push(candidate);
        if selected_amount >= target_amount {
            return Ok(selected);
        }
    }

    Err(Error::InsufficientFunds)
}

/// Greedy exact-sum attempt over candidates sorted largest-first.
/// Complete for power-of-two denomination sets, which is what mints
/// issue.
fn select_exact(sorted_candidates: &[ProofInfo], target_amount: Amount) -> Option<Vec<ProofInfo>> {
    let mut selected = Vec::new();
    let mut remaining = target_amount;

    for candidate in sorted_candidates {
        if remaining == Amount::ZERO {
            break;
        }
        if candidate.proof.amount <= remaining {
            remaining = remaining - candidate.proof.amount;
            selected.push(candidate.clone());
        }
    }

    (remaining == Amount::ZERO).then_some(selected)
}
