//! Memory database

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use purse_core::mint_url::MintUrl;
use purse_core::quote::MintInfo;
use purse_core::{KeySet, KeySetInfo, Keys, KeysetId, Secret};

use super::{Error, WalletDatabase};
use crate::operation::MeltOperation;
use crate::types::{
    MeltQuote, MintQuote, ProofInfo, ProofState, Transaction, TransactionDirection,
};

#[derive(Debug, Default)]
struct Inner {
    mints: HashMap<MintUrl, Option<MintInfo>>,
    keysets: HashMap<MintUrl, Vec<KeySetInfo>>,
    keys: HashMap<KeysetId, Keys>,
    counters: HashMap<KeysetId, u32>,
    mint_quotes: HashMap<String, MintQuote>,
    melt_quotes: HashMap<String, MeltQuote>,
    proofs: HashMap<(MintUrl, Secret), ProofInfo>,
    operations: HashMap<Uuid, MeltOperation>,
    transactions: Vec<Transaction>,
}

/// In-memory wallet database.
///
/// Everything lives behind a single `RwLock`, which is what makes the
/// multi-row operations (reservation, state transitions) atomic with
/// respect to each other.
#[derive(Debug, Default, Clone)]
pub struct WalletMemoryDatabase {
    inner: Arc<RwLock<Inner>>,
}

impl WalletMemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletDatabase for WalletMemoryDatabase {
    async fn add_mint(&self, mint_url: MintUrl, mint_info: Option<MintInfo>) -> Result<(), Error> {
        self.inner.write().await.mints.insert(mint_url, mint_info);
        Ok(())
    }

    async fn remove_mint(&self, mint_url: MintUrl) -> Result<(), Error> {
        self.inner.write().await.mints.remove(&mint_url);
        Ok(())
    }

    async fn get_mint(&self, mint_url: MintUrl) -> Result<Option<MintInfo>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .mints
            .get(&mint_url)
            .cloned()
            .flatten())
    }

    async fn get_mints(&self) -> Result<HashMap<MintUrl, Option<MintInfo>>, Error> {
        Ok(self.inner.read().await.mints.clone())
    }

    async fn add_keysets(&self, mint_url: MintUrl, keysets: Vec<KeySetInfo>) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        let mint_keysets = inner.keysets.entry(mint_url).or_default();
        for keyset in keysets {
            if let Some(existing) = mint_keysets.iter_mut().find(|k| k.id == keyset.id) {
                *existing = keyset;
            } else {
                mint_keysets.push(keyset);
            }
        }
        Ok(())
    }

    async fn get_keysets(&self, mint_url: MintUrl) -> Result<Option<Vec<KeySetInfo>>, Error> {
        Ok(self.inner.read().await.keysets.get(&mint_url).cloned())
    }

    async fn get_keyset_by_id(&self, keyset_id: &KeysetId) -> Result<Option<KeySetInfo>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .keysets
            .values()
            .flatten()
            .find(|keyset| &keyset.id == keyset_id)
            .cloned())
    }

    async fn add_keys(&self, keyset: KeySet) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .keys
            .insert(keyset.id, keyset.keys);
        Ok(())
    }

    async fn get_keys(&self, keyset_id: &KeysetId) -> Result<Option<Keys>, Error> {
        Ok(self.inner.read().await.keys.get(keyset_id).cloned())
    }

    async fn reserve_counter_range(&self, keyset_id: &KeysetId, count: u32) -> Result<u32, Error> {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(*keyset_id).or_insert(0);
        let start = *counter;
        *counter += count;
        Ok(start)
    }

    async fn add_mint_quote(&self, quote: MintQuote) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .mint_quotes
            .insert(quote.id.clone(), quote);
        Ok(())
    }

    async fn get_mint_quote(&self, quote_id: &str) -> Result<Option<MintQuote>, Error> {
        Ok(self.inner.read().await.mint_quotes.get(quote_id).cloned())
    }

    async fn remove_mint_quote(&self, quote_id: &str) -> Result<(), Error> {
        self.inner.write().await.mint_quotes.remove(quote_id);
        Ok(())
    }

    async fn add_melt_quote(&self, quote: MeltQuote) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .melt_quotes
            .insert(quote.id.clone(), quote);
        Ok(())
    }

    async fn get_melt_quote(&self, quote_id: &str) -> Result<Option<MeltQuote>, Error> {
        Ok(self.inner.read().await.melt_quotes.get(quote_id).cloned())
    }

    async fn remove_melt_quote(&self, quote_id: &str) -> Result<(), Error> {
        self.inner.write().await.melt_quotes.remove(quote_id);
        Ok(())
    }

    async fn add_proofs(&self, proofs: Vec<ProofInfo>) -> Result<(), Error> {
        let mut inner = self.inner.write().await;

        for proof in &proofs {
            let key = (proof.mint_url.clone(), proof.proof.secret.clone());
            if inner.proofs.contains_key(&key) {
                return Err(Error::Duplicate);
            }
        }

        for proof in proofs {
            let key = (proof.mint_url.clone(), proof.proof.secret.clone());
            inner.proofs.insert(key, proof);
        }

        Ok(())
    }

    async fn get_proofs(
        &self,
        mint_url: Option<MintUrl>,
        unit: Option<String>,
        states: Option<Vec<ProofState>>,
    ) -> Result<Vec<ProofInfo>, Error> {
        let inner = self.inner.read().await;
        let mut proofs: Vec<ProofInfo> = inner
            .proofs
            .values()
            .filter(|proof| proof.matches_conditions(&mint_url, &unit, &states))
            .cloned()
            .collect();
        proofs.sort_by(|a, b| a.proof.secret.cmp(&b.proof.secret));
        Ok(proofs)
    }

    async fn get_proofs_by_secrets(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<Vec<ProofInfo>, Error> {
        let inner = self.inner.read().await;
        secrets
            .iter()
            .map(|secret| {
                inner
                    .proofs
                    .get(&(mint_url.clone(), secret.clone()))
                    .cloned()
                    .ok_or_else(|| Error::ProofNotFound(secret.to_string()))
            })
            .collect()
    }

    async fn update_proofs_state(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        state: ProofState,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write().await;

        for secret in secrets {
            let proof = inner
                .proofs
                .get(&(mint_url.clone(), secret.clone()))
                .ok_or_else(|| Error::ProofNotFound(secret.to_string()))?;
            if proof.state == ProofState::Spent && state != ProofState::Spent {
                return Err(Error::InvalidStateTransition(format!(
                    "proof `{secret}` is spent"
                )));
            }
        }

        for secret in secrets {
            if let Some(proof) = inner.proofs.get_mut(&(mint_url.clone(), secret.clone())) {
                proof.state = state;
            }
        }

        Ok(())
    }

    async fn reserve_proofs(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
        operation_id: Uuid,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write().await;

        // validate before mutating so the set is all-or-nothing
        for secret in secrets {
            let proof = inner
                .proofs
                .get(&(mint_url.clone(), secret.clone()))
                .ok_or_else(|| Error::ProofNotFound(secret.to_string()))?;

            match proof.used_by_operation {
                Some(holder) if holder != operation_id => return Err(Error::AlreadyReserved),
                Some(_) => continue,
                None => {
                    if proof.state != ProofState::Ready {
                        return Err(Error::InvalidStateTransition(format!(
                            "proof `{secret}` is {}",
                            proof.state
                        )));
                    }
                }
            }
        }

        for secret in secrets {
            if let Some(proof) = inner.proofs.get_mut(&(mint_url.clone(), secret.clone())) {
                proof.used_by_operation = Some(operation_id);
            }
        }

        Ok(())
    }

    async fn release_proofs(&self, mint_url: &MintUrl, secrets: &[Secret]) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        for secret in secrets {
            if let Some(proof) = inner.proofs.get_mut(&(mint_url.clone(), secret.clone())) {
                proof.used_by_operation = None;
            }
        }
        Ok(())
    }

    async fn restore_proofs_to_ready(
        &self,
        mint_url: &MintUrl,
        secrets: &[Secret],
    ) -> Result<(), Error> {
        let mut inner = self.inner.write().await;

        for secret in secrets {
            let proof = inner
                .proofs
                .get(&(mint_url.clone(), secret.clone()))
                .ok_or_else(|| Error::ProofNotFound(secret.to_string()))?;
            if proof.state == ProofState::Spent {
                return Err(Error::InvalidStateTransition(format!(
                    "proof `{secret}` is spent"
                )));
            }
        }

        for secret in secrets {
            if let Some(proof) = inner.proofs.get_mut(&(mint_url.clone(), secret.clone())) {
                proof.state = ProofState::Ready;
                proof.used_by_operation = None;
            }
        }

        Ok(())
    }

    async fn get_proofs_by_operation_id(
        &self,
        mint_url: &MintUrl,
        operation_id: Uuid,
    ) -> Result<Vec<ProofInfo>, Error> {
        let inner = self.inner.read().await;
        let mut proofs: Vec<ProofInfo> = inner
            .proofs
            .values()
            .filter(|proof| {
                proof.mint_url == *mint_url
                    && (proof.used_by_operation == Some(operation_id)
                        || proof.created_by_operation == Some(operation_id))
            })
            .cloned()
            .collect();
        proofs.sort_by(|a, b| a.proof.secret.cmp(&b.proof.secret));
        Ok(proofs)
    }

    async fn get_reserved_proofs(&self) -> Result<Vec<ProofInfo>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .proofs
            .values()
            .filter(|proof| proof.used_by_operation.is_some())
            .cloned()
            .collect())
    }

    async fn add_melt_operation(&self, operation: MeltOperation) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        if inner.operations.contains_key(&operation.id) {
            return Err(Error::Duplicate);
        }
        inner.operations.insert(operation.id, operation);
        Ok(())
    }

    async fn update_melt_operation(&self, operation: MeltOperation) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        if !inner.operations.contains_key(&operation.id) {
            return Err(Error::OperationNotFound(operation.id));
        }
        inner.operations.insert(operation.id, operation);
        Ok(())
    }

    async fn get_melt_operation(&self, operation_id: Uuid) -> Result<Option<MeltOperation>, Error> {
        Ok(self.inner.read().await.operations.get(&operation_id).cloned())
    }

    async fn get_melt_operations_by_state(
        &self,
        state: &str,
    ) -> Result<Vec<MeltOperation>, Error> {
        let inner = self.inner.read().await;
        let mut operations: Vec<MeltOperation> = inner
            .operations
            .values()
            .filter(|operation| operation.state.as_str() == state)
            .cloned()
            .collect();
        operations.sort_by_key(|operation| operation.created_at);
        Ok(operations)
    }

    async fn get_melt_operation_by_quote(
        &self,
        quote_id: &str,
    ) -> Result<Option<MeltOperation>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .operations
            .values()
            .find(|operation| operation.quote_id() == Some(quote_id))
            .cloned())
    }

    async fn remove_melt_operation(&self, operation_id: Uuid) -> Result<(), Error> {
        self.inner.write().await.operations.remove(&operation_id);
        Ok(())
    }

    async fn add_transaction(&self, transaction: Transaction) -> Result<(), Error> {
        self.inner.write().await.transactions.push(transaction);
        Ok(())
    }

    async fn list_transactions(
        &self,
        mint_url: Option<MintUrl>,
        direction: Option<TransactionDirection>,
        unit: Option<String>,
    ) -> Result<Vec<Transaction>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .transactions
            .iter()
            .filter(|tx| tx.matches_conditions(&mint_url, &direction, &unit))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use purse_core::{Amount, Proof, PublicKey};

    use super::*;

    fn mint_url() -> MintUrl {
        MintUrl::from_str("https://mint.example.com").unwrap()
    }

    fn proof_info(secret: &str, amount: u64) -> ProofInfo {
        let proof = Proof::new(
            Amount::from(amount),
            KeysetId::from_str("00deadbeef123456").unwrap(),
            Secret::new(secret),
            PublicKey::from_hex(
                "02deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
            )
            .unwrap(),
        );
        ProofInfo::new(
            proof,
            PublicKey::from_hex(
                "03deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
            )
            .unwrap(),
            mint_url(),
            ProofState::Ready,
            "sat",
        )
    }

    #[tokio::test]
    async fn test_duplicate_proof_rejected() {
        let db = WalletMemoryDatabase::new();
        db.add_proofs(vec![proof_info("a", 1)]).await.unwrap();
        assert!(matches!(
            db.add_proofs(vec![proof_info("a", 1)]).await,
            Err(Error::Duplicate)
        ));
    }

    #[tokio::test]
    async fn test_reservation_is_exclusive_and_idempotent() {
        let db = WalletMemoryDatabase::new();
        db.add_proofs(vec![proof_info("a", 1), proof_info("b", 2)])
            .await
            .unwrap();

        let op_a = Uuid::new_v4();
        let op_b = Uuid::new_v4();
        let secrets = vec![Secret::new("a"), Secret::new("b")];

        db.reserve_proofs(&mint_url(), &secrets, op_a).await.unwrap();
        // same operation: idempotent
        db.reserve_proofs(&mint_url(), &secrets, op_a).await.unwrap();
        // different operation: rejected
        assert!(matches!(
            db.reserve_proofs(&mint_url(), &secrets, op_b).await,
            Err(Error::AlreadyReserved)
        ));

        db.release_proofs(&mint_url(), &secrets).await.unwrap();
        db.reserve_proofs(&mint_url(), &secrets, op_b).await.unwrap();
    }

    #[tokio::test]
    async fn test_reservation_is_all_or_nothing() {
        let db = WalletMemoryDatabase::new();
        db.add_proofs(vec![proof_info("a", 1), proof_info("b", 2)])
            .await
            .unwrap();

        let holder = Uuid::new_v4();
        db.reserve_proofs(&mint_url(), &[Secret::new("b")], holder)
            .await
            .unwrap();

        let contender = Uuid::new_v4();
        let both = vec![Secret::new("a"), Secret::new("b")];
        assert!(db.reserve_proofs(&mint_url(), &both, contender).await.is_err());

        // the free proof must not have been reserved by the failed call
        let a = db
            .get_proofs_by_secrets(&mint_url(), &[Secret::new("a")])
            .await
            .unwrap();
        assert!(a[0].used_by_operation.is_none());
    }

    #[tokio::test]
    async fn test_spent_is_final() {
        let db = WalletMemoryDatabase::new();
        db.add_proofs(vec![proof_info("a", 1)]).await.unwrap();
        let secrets = vec![Secret::new("a")];

        db.update_proofs_state(&mint_url(), &secrets, ProofState::Spent)
            .await
            .unwrap();

        assert!(matches!(
            db.update_proofs_state(&mint_url(), &secrets, ProofState::Ready)
                .await,
            Err(Error::InvalidStateTransition(_))
        ));
        assert!(db
            .restore_proofs_to_ready(&mint_url(), &secrets)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_counter_ranges_do_not_overlap() {
        let db = WalletMemoryDatabase::new();
        let id = KeysetId::from_str("00deadbeef123456").unwrap();

        let first = db.reserve_counter_range(&id, 4).await.unwrap();
        let second = db.reserve_counter_range(&id, 2).await.unwrap();

        assert_eq!(first, 0);
        assert_eq!(second, 4);
    }
}
