//! Melt saga scenarios: the happy paths, the pending settlement path,
//! and recovery from every crash window of the execute pipeline.

mod common;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use purse::database::WalletDatabase;
use purse::melt::{FinalizeOutcome, RecoveryReport};
use purse::operation::MeltState;
use purse::types::ProofState;
use purse::{Error, WalletEvent};
use purse_core::quote::MeltQuoteState;
use purse_core::{Amount, PublicKey};

use common::*;

fn prepared_data(operation: &purse::MeltOperation) -> purse::PreparedMelt {
    operation
        .state
        .prepared()
        .cloned()
        .expect("operation carries prepared data")
}

#[tokio::test]
async fn exact_melt_without_swap() {
    let t = setup(90, 10, &[100]).await;
    let mut events = t.service.events();

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let data = prepared_data(&operation);

    assert!(!data.needs_swap);
    assert_eq!(data.amount, Amount::from(90));
    assert_eq!(data.fee_reserve, Amount::from(10));
    assert_eq!(data.input_amount, Amount::from(100));
    assert_eq!(data.input_proof_secrets.len(), 1);
    // blank outputs cover the 10 unit overshoot, each of value zero
    assert_eq!(data.change_outputs.len(), 4);
    assert!(data
        .change_outputs
        .secrets
        .iter()
        .all(|pre| pre.amount == Amount::ZERO));
    assert!(data.swap_outputs.is_none());

    let operation = t.service.execute(operation.id).await.unwrap();
    assert!(matches!(operation.state, MeltState::Finalized(_)));

    // no swap happened, one melt of exactly the selected proof
    assert_eq!(t.mint.swap_calls(), 0);
    let melts = t.mint.melt_requests();
    assert_eq!(melts.len(), 1);
    assert_eq!(melts[0].inputs.len(), 1);
    assert_eq!(melts[0].inputs[0].amount, Amount::from(100));

    // input spent, nothing new minted
    assert_eq!(ready_balance(&t.db).await, 0);
    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let spent = db
        .get_proofs(Some(mint_url()), None, Some(vec![ProofState::Spent]))
        .await
        .unwrap();
    assert_eq!(spent.len(), 1);

    assert!(matches!(
        events.recv().await.unwrap(),
        WalletEvent::MeltPrepared(_)
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        WalletEvent::MeltFinalized(_)
    ));

    // settled melt leaves a history record
    let transactions = db.list_transactions(None, None, None).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].amount, Amount::from(90));
    assert_eq!(transactions[0].fee, Amount::from(10));
}

#[tokio::test]
async fn swap_then_melt() {
    // 120 available against 100 required crosses the 1.1 swap threshold
    let t = setup(90, 10, &[64, 32, 16, 8]).await;

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let data = prepared_data(&operation);

    assert!(data.needs_swap);
    assert_eq!(data.input_amount, Amount::from(120));
    let swap_outputs = data.swap_outputs.as_ref().unwrap();
    assert_eq!(swap_outputs.send.total_amount().unwrap(), Amount::from(100));
    assert_eq!(swap_outputs.keep.total_amount().unwrap(), Amount::from(20));
    assert_eq!(data.swap_fee, Amount::ZERO);

    let operation = t.service.execute(operation.id).await.unwrap();
    assert!(matches!(operation.state, MeltState::Finalized(_)));

    assert_eq!(t.mint.swap_calls(), 1);
    let melts = t.mint.melt_requests();
    assert_eq!(melts.len(), 1);
    let melt_total: u64 = melts[0].inputs.iter().map(|p| u64::from(p.amount)).sum();
    assert_eq!(melt_total, 100);

    // originals and the send partition are spent, the keep partition
    // remains spendable
    assert_eq!(ready_balance(&t.db).await, 20);

    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let created = db
        .get_proofs_by_operation_id(&mint_url(), operation.id)
        .await
        .unwrap();
    assert!(created
        .iter()
        .all(|info| info.created_by_operation == Some(operation.id)
            || info.used_by_operation == Some(operation.id)));
}

#[tokio::test]
async fn pending_then_paid_with_idempotent_finalize() {
    let t = setup(90, 10, &[100]).await;
    let mut events = t.service.events();

    t.mint.set_melt_reply(MeltReply::Pending);

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let operation = t.service.execute(operation.id).await.unwrap();
    assert!(matches!(operation.state, MeltState::Pending(_)));

    // the committed input stays inflight while the payment settles
    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let inflight = db
        .get_proofs(Some(mint_url()), None, Some(vec![ProofState::Inflight]))
        .await
        .unwrap();
    assert_eq!(inflight.len(), 1);

    // lightning settles
    let data = prepared_data(&operation);
    t.mint.set_quote_state(&data.quote_id, MeltQuoteState::Paid);

    let operation = t.service.check_pending(operation.id).await.unwrap();
    assert!(matches!(operation.state, MeltState::Finalized(_)));

    // a second finalize is a no-op, not an error
    let outcome = t.service.finalize(operation.id).await.unwrap();
    assert!(matches!(outcome, FinalizeOutcome::AlreadyFinalized(_)));

    // exactly one finalized event came out
    let mut finalized_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WalletEvent::MeltFinalized(_)) {
            finalized_events += 1;
        }
    }
    assert_eq!(finalized_events, 1);
}

#[tokio::test]
async fn change_is_saved_on_settlement() {
    let t = setup(90, 10, &[100]).await;
    t.mint
        .set_melt_reply(MeltReply::Paid(vec![Amount::from(4), Amount::from(2)]));

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let operation = t.service.execute(operation.id).await.unwrap();
    assert!(matches!(operation.state, MeltState::Finalized(_)));

    // 6 units of lightning-fee change came back
    assert_eq!(ready_balance(&t.db).await, 6);

    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let transactions = db.list_transactions(None, None, None).await.unwrap();
    assert_eq!(transactions[0].fee, Amount::from(4)); // 100 - 90 - 6
}

#[tokio::test]
async fn recover_after_crash_with_saved_swap_proofs() {
    // scenario: the swap went through and its proofs were saved, then
    // the process died before the melt reached the mint
    let t = setup(90, 10, &[64, 32, 16, 8]).await;
    t.mint.set_melt_reply(MeltReply::TransportError);

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();

    let err = t.service.execute(operation.id).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    // the record is stranded in executing, the swap already happened
    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let stranded = db.get_melt_operation(operation.id).await.unwrap().unwrap();
    assert!(matches!(stranded.state, MeltState::Executing(_)));
    assert_eq!(t.mint.swap_calls(), 1);

    let report = t.service.recover_pending_operations().await.unwrap();
    // the four spent originals still carried the reservation and are
    // released by the sweep once the operation is terminal
    assert_eq!(
        report,
        RecoveryReport {
            recovered_executing: 1,
            finalized: 0,
            rolled_back: 1,
            released_reservations: 4,
        }
    );

    let recovered = db.get_melt_operation(operation.id).await.unwrap().unwrap();
    assert!(matches!(recovered.state, MeltState::RolledBack(_)));
    assert_eq!(
        recovered.error.as_deref(),
        Some("swap happened but melt failed")
    );

    // the swapped value is spendable again
    assert_eq!(ready_balance(&t.db).await, 120);
}

#[tokio::test]
async fn recover_after_crash_before_swap_proofs_saved() {
    // scenario: the process died between the swap succeeding at the
    // mint and the new proofs reaching the store
    let t = setup(90, 10, &[64, 32, 16, 8]).await;

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let data = prepared_data(&operation);
    let swap_outputs = data.swap_outputs.clone().unwrap();

    let db: Arc<dyn WalletDatabase> = t.db.clone();

    // replay the execute pipeline by hand up to the crash point
    let executing = operation.clone().with_state(MeltState::Executing(data.clone()));
    db.update_melt_operation(executing).await.unwrap();

    let inputs = db
        .get_proofs_by_secrets(&mint_url(), &data.input_proof_secrets)
        .await
        .unwrap();
    let mut outputs = swap_outputs.send.blinded_messages();
    outputs.extend(swap_outputs.keep.blinded_messages());
    t.gateway
        .swap(
            &mint_url(),
            purse_core::quote::SwapRequest {
                inputs: inputs.into_iter().map(|info| info.proof).collect(),
                outputs,
            },
        )
        .await
        .unwrap();
    db.update_proofs_state(&mint_url(), &data.input_proof_secrets, ProofState::Spent)
        .await
        .unwrap();
    // crash: the swapped proofs never reach the store

    let report = t.service.recover_pending_operations().await.unwrap();
    assert_eq!(report.rolled_back, 1);

    let recovered = db.get_melt_operation(operation.id).await.unwrap().unwrap();
    assert!(matches!(recovered.state, MeltState::RolledBack(_)));
    assert_eq!(recovered.error.as_deref(), Some("recovered from mint"));

    // the proofs were rebuilt from the mint's restore answer
    assert_eq!(ready_balance(&t.db).await, 120);
}

#[tokio::test]
async fn recover_executing_without_swap_restores_inputs() {
    let t = setup(90, 10, &[100]).await;
    t.mint.set_melt_reply(MeltReply::TransportError);

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let err = t.service.execute(operation.id).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    let report = t.service.recover_pending_operations().await.unwrap();
    assert_eq!(report.rolled_back, 1);
    assert_eq!(ready_balance(&t.db).await, 100);
}

#[tokio::test]
async fn recover_finalizes_paid_executing_operation() {
    // crash after the mint settled the melt but before the record
    // moved on
    let t = setup(90, 10, &[100]).await;

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let data = prepared_data(&operation);

    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let executing = operation.clone().with_state(MeltState::Executing(data.clone()));
    db.update_melt_operation(executing).await.unwrap();

    // the melt reached the mint and settled
    let inputs = db
        .get_proofs_by_secrets(&mint_url(), &data.input_proof_secrets)
        .await
        .unwrap();
    t.gateway
        .melt_bolt11(
            &mint_url(),
            purse_core::quote::MeltRequest {
                quote: data.quote_id.clone(),
                inputs: inputs.into_iter().map(|info| info.proof).collect(),
                outputs: None,
            },
        )
        .await
        .unwrap();

    let report = t.service.recover_pending_operations().await.unwrap();
    assert_eq!(report.finalized, 1);

    let recovered = db.get_melt_operation(operation.id).await.unwrap().unwrap();
    assert!(matches!(recovered.state, MeltState::Finalized(_)));
    assert_eq!(ready_balance(&t.db).await, 0);
}

#[tokio::test]
async fn rollback_from_pending_restores_inputs() {
    let t = setup(90, 10, &[100]).await;
    t.mint.set_melt_reply(MeltReply::Pending);

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let operation = t.service.execute(operation.id).await.unwrap();
    assert!(matches!(operation.state, MeltState::Pending(_)));

    let operation = t
        .service
        .rollback(operation.id, "user abandoned payment")
        .await
        .unwrap();
    assert!(matches!(operation.state, MeltState::RolledBack(_)));
    assert_eq!(ready_balance(&t.db).await, 100);

    // terminal operations refuse further transitions
    assert!(matches!(
        t.service.rollback(operation.id, "again").await,
        Err(Error::IllegalStateTransition(_))
    ));
    assert!(matches!(
        t.service.finalize(operation.id).await,
        Err(Error::IllegalStateTransition(_))
    ));
}

#[tokio::test]
async fn reservations_are_exclusive_across_operations() {
    let t = setup(90, 10, &[100]).await;

    let first = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let second = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();

    t.service.prepare(first.id).await.unwrap();

    // every proof is reserved by the first operation
    assert!(matches!(
        t.service.prepare(second.id).await,
        Err(Error::InsufficientFunds)
    ));
}

#[tokio::test]
async fn failed_prepare_leaves_no_trace() {
    let t = setup(90, 10, &[64, 32, 16, 8]).await;

    // a swap fee large enough that the keep partition cannot be funded
    t.mint.state.lock().input_fee_ppk = 10_000;
    let db: Arc<dyn WalletDatabase> = t.db.clone();
    db.add_keysets(
        mint_url(),
        vec![purse_core::KeySetInfo {
            id: keyset_id(),
            unit: "sat".to_string(),
            active: true,
            input_fee_ppk: 10_000,
        }],
    )
    .await
    .unwrap();

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    assert!(t.service.prepare(operation.id).await.is_err());

    // record removed, reservations released
    assert!(db.get_melt_operation(operation.id).await.unwrap().is_none());
    assert!(db.get_reserved_proofs().await.unwrap().is_empty());
    assert_eq!(ready_balance(&t.db).await, 120);
}

#[tokio::test]
async fn init_requires_trusted_mint() {
    let t = setup(90, 10, &[]).await;

    let unknown = purse_core::mint_url::MintUrl::from_str("https://other.example.com").unwrap();
    assert!(matches!(
        t.service.init(unknown, "sat", "lnbc90n1...").await,
        Err(Error::UnknownMint(_))
    ));

    assert!(matches!(
        t.service.init(mint_url(), "sat", "   ").await,
        Err(Error::ProofValidation(_))
    ));
}

#[tokio::test]
async fn concurrent_pending_checks_contend_on_the_lease() {
    let t = setup(90, 10, &[100]).await;
    t.mint.set_melt_reply(MeltReply::Pending);

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    let operation = t.service.prepare(operation.id).await.unwrap();
    let operation = t.service.execute(operation.id).await.unwrap();

    t.mint.set_quote_status_delay(Duration::from_millis(100));

    let (first, second) = tokio::join!(
        t.service.check_pending(operation.id),
        t.service.check_pending(operation.id),
    );

    let errors = [first, second]
        .into_iter()
        .filter(|result| matches!(result, Err(Error::OperationInProgress(_))))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn recovery_is_globally_serialized() {
    let t = setup(90, 10, &[100]).await;
    t.mint.set_melt_reply(MeltReply::TransportError);

    let operation = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    t.service.prepare(operation.id).await.unwrap();
    let _ = t.service.execute(operation.id).await;

    t.mint.set_quote_status_delay(Duration::from_millis(100));

    let (first, second) = tokio::join!(
        t.service.recover_pending_operations(),
        t.service.recover_pending_operations(),
    );

    let in_progress = [&first, &second]
        .iter()
        .filter(|result| matches!(result, Err(Error::RecoveryInProgress)))
        .count();
    assert_eq!(in_progress, 1);
}

#[tokio::test]
async fn recovery_sweeps_orphaned_reservations() {
    let t = setup(90, 10, &[32, 8]).await;

    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let proofs = db.get_proofs(None, None, None).await.unwrap();
    let secrets: Vec<_> = proofs.iter().map(|info| info.proof.secret.clone()).collect();

    // reservation held by an operation that no longer exists
    db.reserve_proofs(&mint_url(), &secrets, uuid::Uuid::new_v4())
        .await
        .unwrap();

    let report = t.service.recover_pending_operations().await.unwrap();
    assert_eq!(report.released_reservations, 2);
    assert!(db.get_reserved_proofs().await.unwrap().is_empty());
}

#[tokio::test]
async fn balances_are_conserved_across_a_sequence() {
    // two settled melts and one rollback: the ready balance must move
    // by exactly the melted amounts plus the fees actually paid
    let t = setup(90, 10, &[128, 64, 32, 16, 8, 4]).await;
    let initial = ready_balance(&t.db).await;
    assert_eq!(initial, 252);

    // melt 1: settles with 6 units of change (fee paid 4)
    t.mint
        .set_melt_reply(MeltReply::Paid(vec![Amount::from(4), Amount::from(2)]));
    let first = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    t.service.prepare(first.id).await.unwrap();
    let first = t.service.execute(first.id).await.unwrap();
    assert!(matches!(first.state, MeltState::Finalized(_)));

    // melt 2: goes pending, then the user abandons it
    t.mint.set_melt_reply(MeltReply::Pending);
    let second = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    t.service.prepare(second.id).await.unwrap();
    let second = t.service.execute(second.id).await.unwrap();
    t.service.rollback(second.id, "abandoned").await.unwrap();

    // melt 3: settles without change (fee paid = full reserve)
    t.mint.set_melt_reply(MeltReply::Paid(vec![]));
    let third = t.service.init(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    t.service.prepare(third.id).await.unwrap();
    let third = t.service.execute(third.id).await.unwrap();
    assert!(matches!(third.state, MeltState::Finalized(_)));

    // spent: 90 + 4 for the first melt, 90 + 10 for the third; the
    // rolled back melt costs nothing
    assert_eq!(ready_balance(&t.db).await, initial - 94 - 100);

    // no proof is attributed to two different operations
    let db: Arc<dyn WalletDatabase> = t.db.clone();
    let spent = db
        .get_proofs(Some(mint_url()), None, Some(vec![ProofState::Spent]))
        .await
        .unwrap();
    for proof in &spent {
        if let Some(holder) = proof.used_by_operation {
            assert!(
                spent
                    .iter()
                    .filter(|other| other.proof.secret == proof.proof.secret)
                    .all(|other| other.used_by_operation == Some(holder)),
                "proof attributed to more than one operation"
            );
        }
    }
}

#[tokio::test]
async fn wallet_facade_runs_the_whole_flow() {
    let db = Arc::new(purse::database::WalletMemoryDatabase::new());
    let mint = FakeMint::new(90, 10);

    let db_dyn: Arc<dyn WalletDatabase> = db.clone();
    let wallet = purse::Wallet::builder()
        .database(db_dyn.clone())
        .connector(mint.clone())
        .signer(Arc::new(FakeSigner))
        .request_interval(Duration::ZERO)
        .build()
        .unwrap();

    // melting against an untrusted mint is refused
    assert!(matches!(
        wallet.melt(mint_url(), "sat", "lnbc90n1...").await,
        Err(Error::UnknownMint(_))
    ));

    let info = wallet.add_mint(mint_url()).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("fake mint"));

    seed_proofs(&db_dyn, &[100]).await;
    assert_eq!(
        wallet.balance(mint_url(), "sat").await.unwrap(),
        Amount::from(100)
    );

    let mut events = wallet.events();
    let operation = wallet.melt(mint_url(), "sat", "lnbc90n1...").await.unwrap();
    assert!(matches!(operation.state, MeltState::Finalized(_)));

    assert_eq!(wallet.balance(mint_url(), "sat").await.unwrap(), Amount::ZERO);
    assert!(matches!(
        events.recv().await.unwrap(),
        WalletEvent::MeltPrepared(_)
    ));

    let transactions = wallet.transactions(None, None, None).await.unwrap();
    assert_eq!(transactions.len(), 1);

    // a mint quote can be requested and re-checked
    let quote = wallet
        .mint_quote(mint_url(), Amount::from(50), "sat")
        .await
        .unwrap();
    let checked = wallet.check_mint_quote(&quote.id).await.unwrap();
    assert_eq!(checked.id, quote.id);
}

#[tokio::test]
async fn proof_state_checks_are_batched() {
    let t = setup(90, 10, &[]).await;

    let ys: Vec<PublicKey> = (0..250).map(|i| fake_point(&format!("y{i}"))).collect();
    let states = t
        .gateway
        .check_proof_states(&mint_url(), ys)
        .await
        .unwrap();

    assert_eq!(states.len(), 250);
    assert_eq!(t.mint.check_state_calls(), vec![100, 100, 50]);
}
