//! Wallet database
//!
//! One trait covering every repository the engine persists through:
//! mints, keysets, keys, derivation counters, quotes, proofs (with
//! reservation semantics), melt operations and transaction history.
//! Any key-value or relational store can implement it; the crate ships
//! an in-memory implementation used by tests and short-lived wallets.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use purse_core::mint_url::MintUrl;
use purse_core::quote::MintInfo;
use purse_core::{KeySet, KeySetInfo, Keys, KeysetId, Secret};

use crate::operation::MeltOperation;
use crate::types::{
    MeltQuote, MintQuote, ProofInfo, ProofState, Transaction, TransactionDirection,
};

mod memory;

pub use memory::WalletMemoryDatabase;

/// Database error
#[derive(Debug, Error)]
pub enum Error {
    /// Row with the same identity already exists
    #[error("Duplicate entry")]
    Duplicate,
    /// Referenced proof does not exist
    #[error("Proof not found: `{0}`")]
    ProofNotFound(String),
    /// Referenced operation does not exist
    #[error("Operation not found: `{0}`")]
    OperationNotFound(Uuid),
    /// Proof is reserved by a different operation
    #[error("Proof already reserved by another operation")]
    AlreadyReserved,
    /// Transition violates the proof state machine
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
    /// Backend failure
    #[error(transparent)]
    Database(Box<dyn std::error::Error + Send + Sync>),
}

/// Wallet database trait
#[async_trait]
pub trait WalletDatabase: Debug + Send + Sync {
    /// Add mint to storage; presence marks the mint trusted
    async fn add_mint(&self, mint_url: MintUrl, mint_info: Option<MintInfo>) -> Result<(), Error>;

    /// Remove mint from storage
    async fn remove_mint(&self, mint_url: MintUrl) -> Result<(), Error>;

    /// Get mint info from storage
    async fn get_mint(&self, mint_url: MintUrl) -> Result<Option<MintInfo>, Error>;

    /// Get all mints from storage
    async fn get_mints(&self) -> Result<HashMap<MintUrl, Option<MintInfo>>, Error>;

    /// Add keysets of a mint to storage
    async fn add_keysets(&self, mint_url: MintUrl, keysets: Vec<KeySetInfo>) -> Result<(), Error>;

    /// Get keysets of a mint
    async fn get_keysets(&self, mint_url: MintUrl) -> Result<Option<Vec<KeySetInfo>>, Error>;

    /// Get keyset by id
    async fn get_keyset_by_id(&self, keyset_id: &KeysetId) -> Result<Option<KeySetInfo>, Error>;

    /// Add keyset keys to storage
    async fn add_keys(&self, keyset: KeySet) -> Result<(), Error>;

    /// Get keyset keys from storage
    async fn get_keys(&self, keyset_id: &KeysetId) -> Result<Option<Keys>, Error>;

    /// Atomically increment the derivation counter of a keyset by
    /// `count` and return the previous value, i.e. the start of the
    /// reserved range. Counters never decrement.
    async fn reserve_counter_range(&self, keyset_id: &KeysetId, count: u32) -> Result<u32, Error>;

    /// Add mint quote to storage
    async fn add_mint_quote(&self, quote: MintQuote) -> Result<(), Error>;

    /// Get mint quote from storage
    async fn get_mint_quote(&self, quote_id: &str) -> Result<Option<MintQuote>, Error>;

    /// Remove mint quote from storage
    async fn remove_mint_quote(&self, quote_id: &str) -> Result<(), Error>;

    /// Add melt quote to storage
    async fn add_melt_quote(&self, quote: MeltQuote) -> Result<(), Error>;

    /// Get melt quote from storage
    async fn get_melt_quote(&self, quote_id: &str) -> Result<Option<MeltQuote>, Error>;

    /// Remove melt quote from storage
    async fn remove_melt_quote(&self, quote_id: &str) -> Result<(), Error>;

    /// Insert proofs; fails with [`Error::Duplicate`] when a proof with
    /// the same `(mint_url, secret)` identity already exists
    async fn add_proofs(&self, proofs: Vec<ProofInfo>) -> Result<(), Error>;

    /// Get proofs matching the filters
    async fn get_proofs(
        &self,
        mint_url: Option<MintUrl>,
        unit: Option<String>,
        states: Option<Vec<ProofState>>,
    ) -> Result<Vec<ProofInfo>, Error>;

    /// Get proofs by secret; fails with [`Error::ProofNotFound`] when
    /// any secret is absent
    async fn get_proofs_by_secrets(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<Vec<ProofInfo>, Error>;

    /// Set the state of the given proofs. All-or-nothing: fails with
    /// [`Error::ProofNotFound`] when any secret is absent and
    /// [`Error::InvalidStateTransition`] when any proof is `spent`.
    async fn update_proofs_state(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        state: ProofState,
    ) -> Result<(), Error>;

    /// Atomically reserve the given proofs for an operation.
    /// All-or-nothing compare-and-set: every proof must be `ready` and
    /// unreserved (or already reserved by this same operation, making
    /// the call idempotent); otherwise nothing is changed and the call
    /// fails with [`Error::AlreadyReserved`] or
    /// [`Error::InvalidStateTransition`].
    async fn reserve_proofs(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        operation_id: Uuid,
    ) -> Result<(), Error>;

    /// Clear the reservation of the given proofs, leaving their state
    /// untouched. Unknown secrets are ignored.
    async fn release_proofs(&self, mint_url: &MintUrl, secrets: &[Secret]) -> Result<(), Error>;

    /// Set the given proofs back to `ready` and clear their
    /// reservation. Valid from `ready` or `inflight`.
    async fn restore_proofs_to_ready(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<(), Error>;

    /// Get all proofs that carry the operation id, as user or creator
    async fn get_proofs_by_operation_id(
        &self,
        mint_url: &MintUrl,
        operation_id: Uuid,
    ) -> Result<Vec<ProofInfo>, Error>;

    /// Get every reserved proof across all mints
    async fn get_reserved_proofs(&self) -> Result<Vec<ProofInfo>, Error>;

    /// Add a melt operation record
    async fn add_melt_operation(&self, operation: MeltOperation) -> Result<(), Error>;

    /// Replace a melt operation record
    async fn update_melt_operation(&self, operation: MeltOperation) -> Result<(), Error>;

    /// Get a melt operation by id
    async fn get_melt_operation(&self, operation_id: Uuid) -> Result<Option<MeltOperation>, Error>;

    /// Get melt operations in the given phase (string form, e.g.
    /// `executing`)
    async fn get_melt_operations_by_state(&self, state: &str)
        -> Result<Vec<MeltOperation>, Error>;

    /// Get the melt operation holding a quote
    async fn get_melt_operation_by_quote(
        &self,
        quote_id: &str,
    ) -> Result<Option<MeltOperation>, Error>;

    /// Remove a melt operation record
    async fn remove_melt_operation(&self, operation_id: Uuid) -> Result<(), Error>;

    /// Append a transaction to the history
    async fn add_transaction(&self, transaction: Transaction) -> Result<(), Error>;

    /// List transactions matching the filters
    async fn list_transactions(
        &self,
        mint_url: Option<MintUrl>,
        direction: Option<TransactionDirection>,
        unit: Option<String>,
    ) -> Result<Vec<Transaction>, Error>;
}
