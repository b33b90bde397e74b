//! Melt operation service
//!
//! Orchestrates the melt handler: single-flight locking per operation,
//! phase persistence (always before the mint call that makes the phase
//! observable), event emission after persistence, the startup recovery
//! pass and the orphaned-reservation sweep.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::instrument;
use uuid::Uuid;

use purse_core::mint_url::MintUrl;
use purse_core::ws::{NotificationPayload, SubscriptionKind};

use crate::database::WalletDatabase;
use crate::error::Error;
use crate::events::{EventPublisher, WalletEvent};
use crate::melt::handler::{ExecuteOutcome, MeltHandler, PendingOutcome, RecoverOutcome};
use crate::operation::{MeltOperation, MeltState, PreparedMelt};
use crate::subscription::{SubscriptionHandle, SubscriptionManager};
use crate::types::{Melted, Transaction, TransactionDirection};
use crate::util::unix_time;

/// Lease-or-fail lock table keyed by operation id.
///
/// Holding a lease means being the only task mutating that operation;
/// contention surfaces immediately instead of queueing.
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

/// Lease on one operation; released on drop
#[derive(Debug)]
pub struct OperationLockGuard {
    held: Arc<Mutex<HashSet<Uuid>>>,
    operation_id: Uuid,
}

impl OperationLocks {
    /// Take the lease or fail with [`Error::OperationInProgress`]
    pub fn acquire(&self, operation_id: Uuid) -> Result<OperationLockGuard, Error> {
        let mut held = self.held.lock();
        if !held.insert(operation_id) {
            return Err(Error::OperationInProgress(operation_id));
        }
        Ok(OperationLockGuard {
            held: Arc::clone(&self.held),
            operation_id,
        })
    }
}

impl Drop for OperationLockGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.operation_id);
    }
}

/// What a finalize call concluded
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// The operation finalized now
    Finalized(MeltOperation),
    /// It had already finalized; nothing was done
    AlreadyFinalized(MeltOperation),
}

/// Counts from a recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Operations found in `executing` and driven to a terminal or
    /// pending state
    pub recovered_executing: usize,
    /// Pending operations that finalized
    pub finalized: usize,
    /// Operations rolled back
    pub rolled_back: usize,
    /// Reservations released in the orphan sweep
    pub released_reservations: usize,
}

/// Orchestrator for melt operations
#[derive(Debug)]
pub struct MeltOperationService {
    db: Arc<dyn WalletDatabase>,
    handler: MeltHandler,
    events: EventPublisher,
    locks: OperationLocks,
    recovery_lock: tokio::sync::Mutex<()>,
}

impl MeltOperationService {
    /// Create a service around a handler
    pub fn new(db: Arc<dyn WalletDatabase>, handler: MeltHandler) -> Arc<Self> {
        Arc::new(Self {
            db,
            handler,
            events: EventPublisher::new(),
            locks: OperationLocks::default(),
            recovery_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Subscribe to melt lifecycle events
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Create an `init` operation for melting `invoice` against a
    /// trusted mint
    #[instrument(skip(self, invoice))]
    pub async fn init(
        &self,
        mint_url: MintUrl,
        unit: impl Into<String> + std::fmt::Debug,
        invoice: impl Into<String> + std::fmt::Debug,
    ) -> Result<MeltOperation, Error> {
        let invoice = invoice.into();
        if invoice.trim().is_empty() {
            return Err(Error::ProofValidation("empty payment request".to_string()));
        }

        if !self.db.get_mints().await?.contains_key(&mint_url) {
            return Err(Error::UnknownMint(mint_url));
        }

        let operation = MeltOperation::new(mint_url, unit, invoice);
        self.db.add_melt_operation(operation.clone()).await?;

        Ok(operation)
    }

    /// Prepare an `init` operation: quote, selection, reservation,
    /// output derivation.
    ///
    /// On failure every reservation carrying the operation id is
    /// released and the `init` record removed, leaving no trace.
    #[instrument(skip(self))]
    pub async fn prepare(&self, operation_id: Uuid) -> Result<MeltOperation, Error> {
        let _lease = self.locks.acquire(operation_id)?;
        let operation = self.load(operation_id).await?;

        if !matches!(operation.state, MeltState::Init) {
            return Err(Error::IllegalStateTransition(format!(
                "cannot prepare operation in state {}",
                operation.state
            )));
        }

        match self.handler.prepare(&operation).await {
            Ok(data) => {
                let operation = operation.with_state(MeltState::Prepared(data));
                self.persist_and_emit(&operation).await?;
                Ok(operation)
            }
            Err(err) => {
                self.release_operation_reservations(&operation).await;
                self.db.remove_melt_operation(operation_id).await?;
                Err(err)
            }
        }
    }

    /// Execute a `prepared` operation.
    ///
    /// The record is moved to `executing` and persisted before the
    /// mint is called, so a crash anywhere inside the call is
    /// recoverable. A transport failure leaves the record in
    /// `executing` for the recovery pass to resolve.
    #[instrument(skip(self))]
    pub async fn execute(&self, operation_id: Uuid) -> Result<MeltOperation, Error> {
        let _lease = self.locks.acquire(operation_id)?;
        let operation = self.load(operation_id).await?;

        let MeltState::Prepared(data) = operation.state.clone() else {
            return Err(Error::IllegalStateTransition(format!(
                "cannot execute operation in state {}",
                operation.state
            )));
        };

        let operation = operation.with_state(MeltState::Executing(data.clone()));
        self.db.update_melt_operation(operation.clone()).await?;

        match self.handler.execute(&operation, &data).await? {
            ExecuteOutcome::Finalized(melted) => {
                self.settle_finalized(operation, data, melted).await
            }
            ExecuteOutcome::Pending => {
                let operation = operation.with_state(MeltState::Pending(data));
                self.persist_and_emit(&operation).await?;
                Ok(operation)
            }
            ExecuteOutcome::Failed(reason) => {
                let operation = operation.with_error(MeltState::RolledBack(data), reason);
                self.persist_and_emit(&operation).await?;
                Ok(operation)
            }
        }
    }

    /// Finalize a `pending` operation once its quote is paid.
    /// Finalizing an already-finalized operation is a no-op.
    #[instrument(skip(self))]
    pub async fn finalize(&self, operation_id: Uuid) -> Result<FinalizeOutcome, Error> {
        let _lease = self.locks.acquire(operation_id)?;
        let operation = self.load(operation_id).await?;

        match operation.state.clone() {
            MeltState::Finalized(_) => Ok(FinalizeOutcome::AlreadyFinalized(operation)),
            MeltState::Pending(data) => {
                let melted = self.handler.finalize(&operation, &data).await?;
                let operation = self.settle_finalized(operation, data, melted).await?;
                Ok(FinalizeOutcome::Finalized(operation))
            }
            state => Err(Error::IllegalStateTransition(format!(
                "cannot finalize operation in state {state}"
            ))),
        }
    }

    /// Roll back an operation.
    ///
    /// Forbidden from `init` and the terminal states. A `pending`
    /// operation passes through `rolling_back` first so a concurrent
    /// state watcher cannot race a finalize against it.
    #[instrument(skip(self))]
    pub async fn rollback(
        &self,
        operation_id: Uuid,
        reason: impl Into<String> + std::fmt::Debug,
    ) -> Result<MeltOperation, Error> {
        let _lease = self.locks.acquire(operation_id)?;
        let operation = self.load(operation_id).await?;
        self.rollback_locked(operation, reason.into()).await
    }

    /// Poll the quote of a `pending` operation and settle or roll it
    /// back accordingly
    #[instrument(skip(self))]
    pub async fn check_pending(&self, operation_id: Uuid) -> Result<MeltOperation, Error> {
        let _lease = self.locks.acquire(operation_id)?;
        let operation = self.load(operation_id).await?;

        let MeltState::Pending(data) = operation.state.clone() else {
            return Err(Error::IllegalStateTransition(format!(
                "cannot check operation in state {}",
                operation.state
            )));
        };

        match self.handler.check_pending(&operation, &data).await? {
            PendingOutcome::Finalize => {
                let melted = self.handler.finalize(&operation, &data).await?;
                self.settle_finalized(operation, data, melted).await
            }
            PendingOutcome::StayPending => Ok(operation),
            PendingOutcome::Rollback => {
                self.rollback_locked(operation, "melt quote returned to unpaid".to_string())
                    .await
            }
        }
    }

    /// Startup recovery: resolve `executing` crashes, settle or roll
    /// back `pending` operations, then sweep reservations whose owner
    /// is terminal or gone.
    ///
    /// Globally serialized; a second concurrent call fails with
    /// [`Error::RecoveryInProgress`].
    #[instrument(skip(self))]
    pub async fn recover_pending_operations(&self) -> Result<RecoveryReport, Error> {
        let _recovery = self
            .recovery_lock
            .try_lock()
            .map_err(|_| Error::RecoveryInProgress)?;

        let mut report = RecoveryReport::default();

        for operation in self.db.get_melt_operations_by_state("executing").await? {
            let Ok(_lease) = self.locks.acquire(operation.id) else {
                continue;
            };
            let Some(data) = operation.state.prepared().cloned() else {
                continue;
            };

            match self.handler.recover_executing(&operation, &data).await {
                Ok(RecoverOutcome::Paid(melted)) => {
                    self.settle_finalized(operation, data, melted).await?;
                    report.recovered_executing += 1;
                    report.finalized += 1;
                }
                Ok(RecoverOutcome::Pending) => {
                    let operation = operation.with_state(MeltState::Pending(data));
                    self.persist_and_emit(&operation).await?;
                    report.recovered_executing += 1;
                }
                Ok(RecoverOutcome::Failed(reason)) => {
                    let operation = operation.with_error(MeltState::RolledBack(data), reason);
                    self.persist_and_emit(&operation).await?;
                    report.recovered_executing += 1;
                    report.rolled_back += 1;
                }
                Err(err) => {
                    // stays in executing; the next recovery pass retries
                    tracing::warn!(
                        "Recovery of executing operation {} failed: {}",
                        operation.id,
                        err
                    );
                }
            }
        }

        for operation in self.db.get_melt_operations_by_state("pending").await? {
            let Ok(_lease) = self.locks.acquire(operation.id) else {
                continue;
            };
            let MeltState::Pending(data) = operation.state.clone() else {
                continue;
            };

            let outcome = match self.handler.check_pending(&operation, &data).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!("Pending check of {} failed: {}", operation.id, err);
                    continue;
                }
            };

            match outcome {
                PendingOutcome::Finalize => match self.handler.finalize(&operation, &data).await {
                    Ok(melted) => {
                        self.settle_finalized(operation, data, melted).await?;
                        report.finalized += 1;
                    }
                    Err(err) => {
                        tracing::warn!("Finalize of {} failed: {}", operation.id, err);
                    }
                },
                PendingOutcome::StayPending => {}
                PendingOutcome::Rollback => {
                    self.rollback_locked(
                        operation,
                        "melt quote returned to unpaid".to_string(),
                    )
                    .await?;
                    report.rolled_back += 1;
                }
            }
        }

        report.released_reservations = self.sweep_orphaned_reservations().await?;

        Ok(report)
    }

    /// Watch a pending operation's melt quote through the subscription
    /// manager and drive it to finalize or rollback on pushed state
    /// changes
    pub async fn watch_pending(
        self: &Arc<Self>,
        operation_id: Uuid,
        subscriptions: &SubscriptionManager,
    ) -> Result<SubscriptionHandle, Error> {
        let operation = self.load(operation_id).await?;

        let MeltState::Pending(data) = operation.state.clone() else {
            return Err(Error::IllegalStateTransition(format!(
                "cannot watch operation in state {}",
                operation.state
            )));
        };

        let service = Arc::clone(self);
        let callback = Arc::new(move |payload: NotificationPayload| {
            let NotificationPayload::MeltQuote(quote) = payload else {
                return;
            };

            use purse_core::quote::MeltQuoteState;
            let service = Arc::clone(&service);
            match quote.state {
                MeltQuoteState::Paid => {
                    tokio::spawn(async move {
                        if let Err(err) = service.finalize(operation_id).await {
                            tracing::warn!("Watched finalize of {} failed: {}", operation_id, err);
                        }
                    });
                }
                MeltQuoteState::Unpaid => {
                    tokio::spawn(async move {
                        if let Err(err) = service
                            .rollback(operation_id, "melt quote returned to unpaid")
                            .await
                        {
                            tracing::warn!("Watched rollback of {} failed: {}", operation_id, err);
                        }
                    });
                }
                MeltQuoteState::Pending => {}
            }
        });

        subscriptions
            .subscribe(
                operation.mint_url.clone(),
                SubscriptionKind::Bolt11MeltQuote,
                vec![data.quote_id.clone()],
                callback,
            )
            .await
    }

    async fn rollback_locked(
        &self,
        operation: MeltOperation,
        reason: String,
    ) -> Result<MeltOperation, Error> {
        match operation.state.clone() {
            MeltState::Init
            | MeltState::Finalized(_)
            | MeltState::RolledBack(_)
            | MeltState::RollingBack(_) => Err(Error::IllegalStateTransition(format!(
                "cannot roll back operation in state {}",
                operation.state
            ))),
            MeltState::Prepared(data) => {
                // nothing has reached the mint; dropping the
                // reservation is the whole rollback
                self.db
                    .release_proofs(&operation.mint_url, &data.input_proof_secrets)
                    .await?;
                let operation = operation.with_error(MeltState::RolledBack(data), reason);
                self.persist_and_emit(&operation).await?;
                Ok(operation)
            }
            MeltState::Executing(data) => {
                self.handler.rollback(&operation, &data).await?;
                let operation = operation.with_error(MeltState::RolledBack(data), reason);
                self.persist_and_emit(&operation).await?;
                Ok(operation)
            }
            MeltState::Pending(data) => {
                let operation = operation.with_state(MeltState::RollingBack(data.clone()));
                self.db.update_melt_operation(operation.clone()).await?;

                self.handler.rollback(&operation, &data).await?;

                let operation = operation.with_error(MeltState::RolledBack(data), reason);
                self.persist_and_emit(&operation).await?;
                Ok(operation)
            }
        }
    }

    async fn settle_finalized(
        &self,
        operation: MeltOperation,
        data: PreparedMelt,
        melted: Melted,
    ) -> Result<MeltOperation, Error> {
        let operation = operation.with_state(MeltState::Finalized(data.clone()));
        self.db.update_melt_operation(operation.clone()).await?;

        self.db
            .add_transaction(Transaction {
                mint_url: operation.mint_url.clone(),
                direction: TransactionDirection::Outgoing,
                amount: melted.amount,
                fee: melted.fee_paid + data.swap_fee,
                unit: operation.unit.clone(),
                timestamp: unix_time(),
                quote_id: Some(data.quote_id.clone()),
                payment_proof: melted.preimage.clone(),
                operation_id: Some(operation.id),
            })
            .await?;

        if let Some(event) = WalletEvent::for_operation(&operation) {
            self.events.emit(event);
        }

        Ok(operation)
    }

    async fn sweep_orphaned_reservations(&self) -> Result<usize, Error> {
        let mut released = 0;

        for info in self.db.get_reserved_proofs().await? {
            let Some(holder) = info.used_by_operation else {
                continue;
            };

            let stale = match self.db.get_melt_operation(holder).await? {
                None => true,
                Some(operation) => operation.is_terminal(),
            };

            if stale {
                self.db
                    .release_proofs(
                        &info.mint_url,
                        std::slice::from_ref(&info.proof.secret),
                    )
                    .await?;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn release_operation_reservations(&self, operation: &MeltOperation) {
        match self
            .db
            .get_proofs_by_operation_id(&operation.mint_url, operation.id)
            .await
        {
            Ok(proofs) => {
                let secrets: Vec<_> = proofs
                    .into_iter()
                    .filter(|info| info.used_by_operation == Some(operation.id))
                    .map(|info| info.proof.secret)
                    .collect();
                if secrets.is_empty() {
                    return;
                }
                if let Err(err) = self.db.release_proofs(&operation.mint_url, &secrets).await {
                    tracing::warn!(
                        "Releasing reservations of failed prepare {} failed: {}",
                        operation.id,
                        err
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    "Loading reservations of failed prepare {} failed: {}",
                    operation.id,
                    err
                );
            }
        }
    }

    async fn persist_and_emit(&self, operation: &MeltOperation) -> Result<(), Error> {
        self.db.update_melt_operation(operation.clone()).await?;
        if let Some(event) = WalletEvent::for_operation(operation) {
            self.events.emit(event);
        }
        Ok(())
    }

    async fn load(&self, operation_id: Uuid) -> Result<MeltOperation, Error> {
        self.db
            .get_melt_operation(operation_id)
            .await?
            .ok_or(Error::UnknownOperation(operation_id))
    }
}
