//! The bolt11 melt saga: handler (algorithmic phases) and service
//! (locking, persistence, events, recovery).

mod handler;
mod service;

pub use handler::{ExecuteOutcome, MeltHandler, PendingOutcome, RecoverOutcome};
pub use service::{FinalizeOutcome, MeltOperationService, OperationLocks, RecoveryReport};
