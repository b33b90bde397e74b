//! Bolt11 melt saga
//!
//! The handler owns the algorithmic phases of a melt: prepare,
//! execute, finalize, pending checks, rollback and crash recovery. It
//! never mutates the operation record itself; interpreting outcomes
//! and persisting phase transitions is the service's job.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use purse_core::mint_url::MintUrl;
use purse_core::quote::{
    MeltQuoteRequest, MeltQuoteState, MeltRequest, RestoreRequest, SpendState, SwapRequest,
};
use purse_core::{
    Amount, BlindSignature, KeySetInfo, Keys, KeysetId, ProofsMethods, PublicKey, Secret,
};

use crate::database::{self, WalletDatabase};
use crate::error::Error;
use crate::fees::calculate_fee;
use crate::gateway::MintGateway;
use crate::operation::{MeltOperation, PreparedMelt, SwapOutputs};
use crate::proofs::{select_for_send, total_amount};
use crate::signer::{blank_output_count, EcashSigner};
use crate::types::{MeltQuote, Melted, ProofInfo, ProofState};

// Inputs overshooting the required value by this ratio are pre-swapped
// into exact denominations, so the lightning-fee change stays small
// and the melt spends no more than it has to.
const SWAP_THRESHOLD_NUM: u64 = 11;
const SWAP_THRESHOLD_DEN: u64 = 10;

/// Outcome of executing a melt
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    /// Payment settled immediately
    Finalized(Melted),
    /// Lightning payment still in flight
    Pending,
    /// The mint reported the melt unpaid; inputs were restored
    Failed(String),
}

/// What a pending check concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    /// Quote is paid; finalize
    Finalize,
    /// Still pending
    StayPending,
    /// Quote fell back to unpaid; roll back
    Rollback,
}

/// Outcome of recovering an operation that crashed mid-execute
#[derive(Debug, Clone, PartialEq)]
pub enum RecoverOutcome {
    /// The melt had gone through; settled from the mint's answer
    Paid(Melted),
    /// Lightning payment still in flight
    Pending,
    /// The melt never settled; funds were put back
    Failed(String),
}

/// Bolt11 melt handler
#[derive(Debug, Clone)]
pub struct MeltHandler {
    db: Arc<dyn WalletDatabase>,
    gateway: MintGateway,
    signer: Arc<dyn EcashSigner>,
}

impl MeltHandler {
    /// Create a handler
    pub fn new(
        db: Arc<dyn WalletDatabase>,
        gateway: MintGateway,
        signer: Arc<dyn EcashSigner>,
    ) -> Self {
        Self {
            db,
            gateway,
            signer,
        }
    }

    /// Obtain a quote, select and reserve inputs, and derive every
    /// output the later phases will need.
    ///
    /// Proofs reserved here stay reserved if this returns an error;
    /// the caller releases everything carrying the operation id.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    pub async fn prepare(&self, operation: &MeltOperation) -> Result<PreparedMelt, Error> {
        let mint_url = &operation.mint_url;

        let quote = self
            .gateway
            .create_melt_quote(
                mint_url,
                MeltQuoteRequest {
                    request: operation.method_data.clone(),
                    unit: operation.unit.clone(),
                },
            )
            .await?;

        self.db
            .add_melt_quote(MeltQuote {
                id: quote.quote.clone(),
                mint_url: mint_url.clone(),
                unit: operation.unit.clone(),
                amount: quote.amount,
                request: operation.method_data.clone(),
                fee_reserve: quote.fee_reserve,
                state: quote.state,
                expiry: quote.expiry,
                payment_preimage: None,
            })
            .await?;

        let required = quote
            .amount
            .checked_add(quote.fee_reserve)
            .ok_or(purse_core::Error::AmountOverflow)?;

        let selected =
            select_for_send(&self.db, mint_url, required, &operation.unit, false).await?;
        let selected_amount = total_amount(&selected);
        let input_proof_secrets: Vec<Secret> =
            selected.iter().map(|p| p.proof.secret.clone()).collect();

        let threshold = Amount::from(u64::from(required) * SWAP_THRESHOLD_NUM / SWAP_THRESHOLD_DEN);
        let needs_swap = selected_amount >= threshold;

        self.db
            .reserve_proofs(mint_url, &input_proof_secrets, operation.id)
            .await?;

        let keyset = self.active_keyset(mint_url, &operation.unit).await?;

        // blank outputs sized to the largest change the mint may return
        let overshoot = selected_amount
            .checked_sub(quote.amount)
            .ok_or(purse_core::Error::AmountOverflow)?;
        let blank_count = blank_output_count(overshoot);
        let counter_start = self
            .db
            .reserve_counter_range(&keyset.id, blank_count as u32)
            .await?;
        let change_outputs = self.signer.premint_secrets(
            keyset.id,
            counter_start,
            &vec![Amount::ZERO; blank_count],
        )?;

        let (swap_fee, swap_outputs) = if needs_swap {
            let swap_fee = self.swap_fee(mint_url, &selected).await?;

            let send_amount = required;
            let keep_amount = selected_amount
                .checked_sub(send_amount)
                .and_then(|rest| rest.checked_sub(swap_fee))
                .ok_or_else(|| {
                    Error::ProofValidation("selected proofs cannot cover the swap fee".to_string())
                })?;

            let send = self
                .derive_outputs(&keyset.id, &send_amount.split())
                .await?;
            let keep = self
                .derive_outputs(&keyset.id, &keep_amount.split())
                .await?;

            (swap_fee, Some(SwapOutputs { send, keep }))
        } else {
            (Amount::ZERO, None)
        };

        Ok(PreparedMelt {
            quote_id: quote.quote,
            amount: quote.amount,
            fee_reserve: quote.fee_reserve,
            swap_fee,
            needs_swap,
            input_amount: selected_amount,
            input_proof_secrets,
            change_outputs,
            swap_outputs,
        })
    }

    /// Run the mint interaction of a prepared melt: the optional
    /// pre-swap followed by the melt submission.
    #[instrument(skip(self, operation, data), fields(operation_id = %operation.id))]
    pub async fn execute(
        &self,
        operation: &MeltOperation,
        data: &PreparedMelt,
    ) -> Result<ExecuteOutcome, Error> {
        let mint_url = &operation.mint_url;

        let inputs = self
            .load_reserved_inputs(mint_url, operation.id, data)
            .await?;

        let melt_inputs = match (&data.swap_outputs, data.needs_swap) {
            (Some(swap_outputs), true) => {
                self.execute_swap(operation, data, swap_outputs, inputs)
                    .await?
            }
            _ => {
                self.db
                    .update_proofs_state(mint_url, &data.input_proof_secrets, ProofState::Inflight)
                    .await?;
                inputs.into_iter().map(|info| info.proof).collect()
            }
        };

        let outputs = (!data.change_outputs.is_empty())
            .then(|| data.change_outputs.blinded_messages());

        let response = self
            .gateway
            .melt_bolt11(
                mint_url,
                MeltRequest {
                    quote: data.quote_id.clone(),
                    inputs: melt_inputs,
                    outputs,
                },
            )
            .await?;

        match response.state {
            MeltQuoteState::Paid => {
                let melted = self
                    .settle_paid(operation, data, response.payment_preimage, response.change)
                    .await?;
                Ok(ExecuteOutcome::Finalized(melted))
            }
            MeltQuoteState::Pending => Ok(ExecuteOutcome::Pending),
            MeltQuoteState::Unpaid => {
                self.db
                    .restore_proofs_to_ready(mint_url, &data.melt_input_secrets())
                    .await?;
                Ok(ExecuteOutcome::Failed(
                    "mint reported the melt unpaid".to_string(),
                ))
            }
        }
    }

    /// Settle a pending operation whose quote has been paid
    #[instrument(skip(self, operation, data), fields(operation_id = %operation.id))]
    pub async fn finalize(
        &self,
        operation: &MeltOperation,
        data: &PreparedMelt,
    ) -> Result<Melted, Error> {
        let status = self
            .gateway
            .check_melt_quote(&operation.mint_url, &data.quote_id)
            .await?;

        if status.state != MeltQuoteState::Paid {
            return Err(Error::IllegalStateTransition(format!(
                "cannot finalize quote `{}` in state {}",
                data.quote_id, status.state
            )));
        }

        self.settle_paid(operation, data, status.payment_preimage, status.change)
            .await
    }

    /// Single quote poll deciding what to do with a pending operation
    #[instrument(skip(self, operation, data), fields(operation_id = %operation.id))]
    pub async fn check_pending(
        &self,
        operation: &MeltOperation,
        data: &PreparedMelt,
    ) -> Result<PendingOutcome, Error> {
        let status = self
            .gateway
            .check_melt_quote(&operation.mint_url, &data.quote_id)
            .await?;

        Ok(match status.state {
            MeltQuoteState::Paid => PendingOutcome::Finalize,
            MeltQuoteState::Pending => PendingOutcome::StayPending,
            MeltQuoteState::Unpaid => PendingOutcome::Rollback,
        })
    }

    /// Put the melt inputs back into circulation
    #[instrument(skip(self, operation, data), fields(operation_id = %operation.id))]
    pub async fn rollback(
        &self,
        operation: &MeltOperation,
        data: &PreparedMelt,
    ) -> Result<(), Error> {
        self.db
            .restore_proofs_to_ready(&operation.mint_url, &data.melt_input_secrets())
            .await?;
        Ok(())
    }

    /// Recover an operation found in `executing` after a crash.
    ///
    /// Decides from the mint's view of the quote, the spend state of
    /// the original inputs and the locally saved proofs which of the
    /// crash windows the operation died in, then drives it to an
    /// outcome the service can persist.
    #[instrument(skip(self, operation, data), fields(operation_id = %operation.id))]
    pub async fn recover_executing(
        &self,
        operation: &MeltOperation,
        data: &PreparedMelt,
    ) -> Result<RecoverOutcome, Error> {
        let mint_url = &operation.mint_url;

        let status = self
            .gateway
            .check_melt_quote(mint_url, &data.quote_id)
            .await?;

        match status.state {
            MeltQuoteState::Paid => {
                let melted = self
                    .settle_paid(operation, data, status.payment_preimage, status.change)
                    .await?;
                return Ok(RecoverOutcome::Paid(melted));
            }
            MeltQuoteState::Pending => return Ok(RecoverOutcome::Pending),
            MeltQuoteState::Unpaid => {}
        }

        // quote unpaid: the melt never settled
        let Some(swap_outputs) = data.swap_outputs.as_ref().filter(|_| data.needs_swap) else {
            self.db
                .restore_proofs_to_ready(mint_url, &data.input_proof_secrets)
                .await?;
            return Ok(RecoverOutcome::Failed(
                "melt failed before the mint accepted it".to_string(),
            ));
        };

        // with a pre-swap in the pipeline, the crash may sit on either
        // side of it; the mint's view of the original inputs tells us
        let ys: Vec<PublicKey> = data
            .input_proof_secrets
            .iter()
            .map(|secret| self.signer.y_for_secret(secret))
            .collect::<Result<_, _>>()?;
        let states = self.gateway.check_proof_states(mint_url, ys).await?;
        let swap_happened = states.iter().any(|state| state.state == SpendState::Spent);

        if !swap_happened {
            self.db
                .restore_proofs_to_ready(mint_url, &data.input_proof_secrets)
                .await?;
            return Ok(RecoverOutcome::Failed(
                "melt failed before the mint accepted it".to_string(),
            ));
        }

        let send_secrets = swap_outputs.send.secrets();
        let local = self
            .db
            .get_proofs_by_operation_id(mint_url, operation.id)
            .await?;
        let local_send_count = local
            .iter()
            .filter(|info| send_secrets.contains(&info.proof.secret))
            .count();

        if local_send_count == send_secrets.len() {
            // swap proofs were saved before the crash; give them back
            self.db
                .restore_proofs_to_ready(mint_url, &send_secrets)
                .await?;
            self.mark_spent_best_effort(mint_url, &data.input_proof_secrets)
                .await;
            return Ok(RecoverOutcome::Failed(
                "swap happened but melt failed".to_string(),
            ));
        }

        // crash between the swap and the save: the proofs exist only
        // at the mint. Derivation is deterministic, so asking the mint
        // to restore signatures for the very same outputs yields the
        // proofs the swap produced.
        let mut outputs = swap_outputs.send.blinded_messages();
        outputs.extend(swap_outputs.keep.blinded_messages());

        let response = self
            .gateway
            .restore(
                mint_url,
                RestoreRequest {
                    outputs: outputs.clone(),
                },
            )
            .await?;

        if response.outputs != outputs || response.signatures.len() != outputs.len() {
            return Err(Error::MintProtocol(
                "restore did not return signatures for the swap outputs".to_string(),
            ));
        }

        let keys = self.keyset_keys(mint_url, swap_outputs.send.keyset_id).await?;
        let (send_signatures, keep_signatures) =
            response.signatures.split_at(swap_outputs.send.len());

        let send_proofs =
            self.signer
                .unblind_signatures(send_signatures, &swap_outputs.send, &keys)?;
        let keep_proofs =
            self.signer
                .unblind_signatures(keep_signatures, &swap_outputs.keep, &keys)?;

        let mut recovered = self.proof_infos(
            send_proofs,
            mint_url,
            &operation.unit,
            ProofState::Ready,
            operation.id,
            false,
        )?;
        recovered.extend(self.proof_infos(
            keep_proofs,
            mint_url,
            &operation.unit,
            ProofState::Ready,
            operation.id,
            false,
        )?);
        self.add_proofs_tolerating_duplicates(recovered).await?;

        self.mark_spent_best_effort(mint_url, &data.input_proof_secrets)
            .await;

        Ok(RecoverOutcome::Failed("recovered from mint".to_string()))
    }

    async fn execute_swap(
        &self,
        operation: &MeltOperation,
        data: &PreparedMelt,
        swap_outputs: &SwapOutputs,
        inputs: Vec<ProofInfo>,
    ) -> Result<purse_core::Proofs, Error> {
        let mint_url = &operation.mint_url;

        self.db
            .update_proofs_state(mint_url, &data.input_proof_secrets, ProofState::Inflight)
            .await?;

        let mut outputs = swap_outputs.send.blinded_messages();
        outputs.extend(swap_outputs.keep.blinded_messages());
        let expected = outputs.len();

        let response = self
            .gateway
            .swap(
                mint_url,
                SwapRequest {
                    inputs: inputs.into_iter().map(|info| info.proof).collect(),
                    outputs,
                },
            )
            .await?;

        if response.signatures.len() != expected {
            return Err(Error::MintProtocol(format!(
                "swap returned {} signatures for {} outputs",
                response.signatures.len(),
                expected
            )));
        }

        let keys = self.keyset_keys(mint_url, swap_outputs.send.keyset_id).await?;
        let (send_signatures, keep_signatures) =
            response.signatures.split_at(swap_outputs.send.len());

        let send_proofs =
            self.signer
                .unblind_signatures(send_signatures, &swap_outputs.send, &keys)?;
        let keep_proofs =
            self.signer
                .unblind_signatures(keep_signatures, &swap_outputs.keep, &keys)?;

        self.db
            .update_proofs_state(mint_url, &data.input_proof_secrets, ProofState::Spent)
            .await?;

        // the send partition is inflight immediately: it exists only to
        // be consumed by the melt
        let mut new_proofs = self.proof_infos(
            send_proofs.clone(),
            mint_url,
            &operation.unit,
            ProofState::Inflight,
            operation.id,
            true,
        )?;
        new_proofs.extend(self.proof_infos(
            keep_proofs,
            mint_url,
            &operation.unit,
            ProofState::Ready,
            operation.id,
            false,
        )?);
        self.db.add_proofs(new_proofs).await?;

        Ok(send_proofs)
    }

    async fn settle_paid(
        &self,
        operation: &MeltOperation,
        data: &PreparedMelt,
        preimage: Option<String>,
        change_signatures: Option<Vec<BlindSignature>>,
    ) -> Result<Melted, Error> {
        let mint_url = &operation.mint_url;
        let melt_secrets = data.melt_input_secrets();
        self.db
            .update_proofs_state(mint_url, &melt_secrets, ProofState::Spent)
            .await?;

        let mut change_amount = Amount::ZERO;
        if let Some(signatures) = change_signatures.filter(|sigs| !sigs.is_empty()) {
            let keys = self
                .keyset_keys(mint_url, data.change_outputs.keyset_id)
                .await?;
            let change_proofs =
                self.signer
                    .unblind_signatures(&signatures, &data.change_outputs, &keys)?;
            change_amount = change_proofs.total_amount()?;

            let infos = self.proof_infos(
                change_proofs,
                mint_url,
                &operation.unit,
                ProofState::Ready,
                operation.id,
                false,
            )?;
            self.add_proofs_tolerating_duplicates(infos).await?;
        }

        let melt_input_amount = match (&data.swap_outputs, data.needs_swap) {
            (Some(swap_outputs), true) => swap_outputs.send.total_amount()?,
            _ => data.input_amount,
        };
        let fee_paid = melt_input_amount
            .checked_sub(data.amount)
            .and_then(|rest| rest.checked_sub(change_amount))
            .ok_or(purse_core::Error::AmountOverflow)?;

        Ok(Melted {
            state: MeltQuoteState::Paid,
            preimage,
            amount: data.amount,
            fee_paid,
            change: change_amount,
        })
    }

    async fn load_reserved_inputs(
        &self,
        mint_url: &MintUrl,
        operation_id: Uuid,
        data: &PreparedMelt,
    ) -> Result<Vec<ProofInfo>, Error> {
        let inputs = self
            .db
            .get_proofs_by_secrets(mint_url, &data.input_proof_secrets)
            .await
            .map_err(|err| match err {
                database::Error::ProofNotFound(secret) => Error::ProofValidation(format!(
                    "reserved input proof `{secret}` is missing"
                )),
                other => Error::Database(other),
            })?;

        if inputs.len() != data.input_proof_secrets.len() {
            return Err(Error::ProofValidation(
                "reserved input proofs are incomplete".to_string(),
            ));
        }

        if let Some(stranger) = inputs
            .iter()
            .find(|info| info.used_by_operation != Some(operation_id))
        {
            return Err(Error::ProofValidation(format!(
                "input proof `{}` is not reserved by this operation",
                stranger.proof.secret
            )));
        }

        Ok(inputs)
    }

    async fn derive_outputs(
        &self,
        keyset_id: &KeysetId,
        amounts: &[Amount],
    ) -> Result<purse_core::PreMintSecrets, Error> {
        let counter_start = self
            .db
            .reserve_counter_range(keyset_id, amounts.len() as u32)
            .await?;
        Ok(self
            .signer
            .premint_secrets(*keyset_id, counter_start, amounts)?)
    }

    async fn swap_fee(&self, mint_url: &MintUrl, inputs: &[ProofInfo]) -> Result<Amount, Error> {
        let keysets = self
            .db
            .get_keysets(mint_url.clone())
            .await?
            .unwrap_or_default();
        let keyset_fee_ppk: HashMap<KeysetId, u64> = keysets
            .iter()
            .map(|keyset| (keyset.id, keyset.input_fee_ppk))
            .collect();

        let mut proofs_count: HashMap<KeysetId, u64> = HashMap::new();
        for input in inputs {
            *proofs_count.entry(input.proof.keyset_id).or_insert(0) += 1;
        }

        calculate_fee(&proofs_count, &keyset_fee_ppk)
    }

    async fn active_keyset(&self, mint_url: &MintUrl, unit: &str) -> Result<KeySetInfo, Error> {
        if let Some(keyset) = self.find_active_keyset(mint_url, unit).await? {
            return Ok(keyset);
        }

        // keysets unknown or stale; refresh from the mint
        let response = self.gateway.get_keysets(mint_url).await?;
        self.db
            .add_keysets(mint_url.clone(), response.keysets)
            .await?;

        self.find_active_keyset(mint_url, unit)
            .await?
            .ok_or(Error::NoActiveKeyset)
    }

    async fn find_active_keyset(
        &self,
        mint_url: &MintUrl,
        unit: &str,
    ) -> Result<Option<KeySetInfo>, Error> {
        let mut keysets: Vec<KeySetInfo> = self
            .db
            .get_keysets(mint_url.clone())
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter(|keyset| keyset.active && keyset.unit == unit)
            .collect();

        keysets.sort_by(|a, b| {
            a.input_fee_ppk
                .cmp(&b.input_fee_ppk)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });

        Ok(keysets.into_iter().next())
    }

    async fn keyset_keys(&self, mint_url: &MintUrl, keyset_id: KeysetId) -> Result<Keys, Error> {
        if let Some(keys) = self.db.get_keys(&keyset_id).await? {
            return Ok(keys);
        }

        let keyset = self.gateway.get_keyset_keys(mint_url, keyset_id).await?;
        let keys = keyset.keys.clone();
        self.db.add_keys(keyset).await?;
        Ok(keys)
    }

    fn proof_infos(
        &self,
        proofs: purse_core::Proofs,
        mint_url: &MintUrl,
        unit: &str,
        state: ProofState,
        operation_id: Uuid,
        used_by_operation: bool,
    ) -> Result<Vec<ProofInfo>, Error> {
        proofs
            .into_iter()
            .map(|proof| {
                let y = self.signer.y_for_secret(&proof.secret)?;
                let mut info = ProofInfo::new(proof, y, mint_url.clone(), state, unit)
                    .created_by(operation_id);
                if used_by_operation {
                    info = info.used_by(operation_id);
                }
                Ok(info)
            })
            .collect()
    }

    async fn add_proofs_tolerating_duplicates(
        &self,
        proofs: Vec<ProofInfo>,
    ) -> Result<(), Error> {
        for proof in proofs {
            match self.db.add_proofs(vec![proof]).await {
                Ok(()) => {}
                Err(database::Error::Duplicate) => {
                    // already saved by an earlier, interrupted attempt
                    tracing::debug!("Skipping proof already in the store");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(())
    }

    async fn mark_spent_best_effort(&self, mint_url: &MintUrl, secrets: &[Secret]) {
        for secret in secrets {
            if let Err(err) = self
                .db
                .update_proofs_state(
                    mint_url,
                    std::slice::from_ref(secret),
                    ProofState::Spent,
                )
                .await
            {
                tracing::debug!("Could not mark `{secret}` spent during recovery: {err}");
            }
        }
    }

}
