// Withdrawal Tests
// Multi-signature treasury withdrawals

use freight_escrow::access::Capabilities;
use freight_escrow::clock::ManualClock;
use freight_escrow::identity::{Caller, Keypair};
use freight_escrow::ledger::{
    AccountId, AssetType, LedgerConfig, LedgerError, LedgerService, TransactionKind,
    WithdrawalStatus,
};
use freight_escrow::storage::Store;
use freight_escrow::ErrorKind;
use std::sync::Arc;

struct Fixture {
    ledger: LedgerService,
    admin: Caller,
    signers: Vec<Caller>,
    outsider: Caller,
}

/// Treasury holding 1_000 ICP units, three signers, `required` approvals
async fn fixture(required: u32) -> Fixture {
    fixture_with(LedgerConfig::default().with_required_approvals(required)).await
}

async fn fixture_with(config: LedgerConfig) -> Fixture {
    let admin = Caller::local(&Keypair::generate());
    let signers: Vec<Caller> = (0..3).map(|_| Caller::local(&Keypair::generate())).collect();
    let caps = signers
        .iter()
        .fold(Capabilities::new(), |caps, s| caps.with_signer(s.did().clone()))
        .with_admin(admin.did().clone());
    let ledger = LedgerService::open(
        &Store::temporary().unwrap(),
        config,
        Arc::new(caps),
        Arc::new(ManualClock::new(5_000)),
    )
    .unwrap();

    let outsider = Caller::local(&Keypair::generate());
    ledger
        .deposit(&outsider, AccountId::Treasury, AssetType::Icp, 1_000, "seed")
        .await
        .unwrap();

    Fixture {
        ledger,
        admin,
        signers,
        outsider,
    }
}

fn treasury_icp(ledger: &LedgerService) -> u64 {
    ledger.get_balance(&AccountId::Treasury, AssetType::Icp).unwrap()
}

#[tokio::test]
async fn test_two_of_three_withdrawal_executes() {
    let f = fixture(2).await;
    let [a, b, _c] = [&f.signers[0], &f.signers[1], &f.signers[2]];

    let w = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 400, "cold-wallet-1")
        .await
        .unwrap();
    assert_eq!(w.status, WithdrawalStatus::Pending);
    assert_eq!(w.required_approvals, 2);

    let w = f.ledger.approve_withdrawal(a, w.id).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Pending);

    let err = f.ledger.execute_withdrawal(a, w.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ThresholdNotMet { approvals: 1, required: 2 }));
    assert_eq!(err.kind(), ErrorKind::ThresholdNotMet);
    assert_eq!(treasury_icp(&f.ledger), 1_000);

    let w = f.ledger.approve_withdrawal(b, w.id).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Approved);

    let w = f.ledger.execute_withdrawal(b, w.id).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Executed);
    assert_eq!(w.executed_at, Some(5_000));
    assert_eq!(treasury_icp(&f.ledger), 600);

    let tx = f.ledger.get_transaction(w.transaction_id.unwrap()).unwrap();
    assert_eq!(tx.kind, TransactionKind::Withdrawal);
    assert_eq!(tx.from, Some(AccountId::Treasury));
    assert_eq!(tx.to, None);
    assert_eq!(tx.amount, 400);

    let icp = f
        .ledger
        .get_treasury_balance()
        .unwrap()
        .into_iter()
        .find(|t| t.asset == AssetType::Icp)
        .unwrap();
    assert_eq!(icp.deposited, 1_000);
    assert_eq!(icp.withdrawn, 400);
    assert_eq!(f.ledger.stats().unwrap().withdrawn.get(&AssetType::Icp), Some(&400));
}

#[tokio::test]
async fn test_duplicate_approval_counts_once() {
    let f = fixture(2).await;
    let a = &f.signers[0];

    let w = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 10, "dest")
        .await
        .unwrap();
    f.ledger.approve_withdrawal(a, w.id).await.unwrap();
    let w = f.ledger.approve_withdrawal(a, w.id).await.unwrap();

    assert_eq!(w.approvals.len(), 1);
    assert_eq!(w.status, WithdrawalStatus::Pending);
}

#[tokio::test]
async fn test_executed_withdrawal_cannot_run_twice() {
    let f = fixture(1).await;
    let a = &f.signers[0];

    let w = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 100, "dest")
        .await
        .unwrap();
    f.ledger.approve_withdrawal(a, w.id).await.unwrap();
    f.ledger.execute_withdrawal(a, w.id).await.unwrap();

    let err = f.ledger.execute_withdrawal(a, w.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidWithdrawalState { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(treasury_icp(&f.ledger), 900);
}

#[tokio::test]
async fn test_non_signers_are_refused() {
    let f = fixture(1).await;

    let err = f
        .ledger
        .request_withdrawal(&f.outsider, AssetType::Icp, 10, "dest")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let w = f
        .ledger
        .request_withdrawal(&f.signers[0], AssetType::Icp, 10, "dest")
        .await
        .unwrap();
    let err = f.ledger.approve_withdrawal(&f.outsider, w.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_request_above_treasury_balance_rejected() {
    let f = fixture(1).await;

    let err = f
        .ledger
        .request_withdrawal(&f.signers[0], AssetType::Icp, 1_001, "dest")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
    assert!(f.ledger.get_pending_withdrawals().unwrap().is_empty());
}

#[tokio::test]
async fn test_request_validates_input() {
    let f = fixture(1).await;

    assert!(matches!(
        f.ledger
            .request_withdrawal(&f.signers[0], AssetType::Icp, 0, "dest")
            .await,
        Err(LedgerError::InvalidAmount)
    ));
    assert!(matches!(
        f.ledger
            .request_withdrawal(&f.signers[0], AssetType::Icp, 5, "   ")
            .await,
        Err(LedgerError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_execution_rechecks_balance() {
    let f = fixture(1).await;
    let a = &f.signers[0];

    let first = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 700, "dest")
        .await
        .unwrap();
    let second = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 700, "dest")
        .await
        .unwrap();
    f.ledger.approve_withdrawal(a, first.id).await.unwrap();
    f.ledger.approve_withdrawal(a, second.id).await.unwrap();
    f.ledger.execute_withdrawal(a, first.id).await.unwrap();

    let err = f.ledger.execute_withdrawal(a, second.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
    assert_eq!(treasury_icp(&f.ledger), 300);
    assert_eq!(
        f.ledger.get_withdrawal(second.id).unwrap().status,
        WithdrawalStatus::Approved
    );
}

#[tokio::test]
async fn test_rejected_withdrawal_is_final() {
    let f = fixture(2).await;
    let [a, b] = [&f.signers[0], &f.signers[1]];

    let w = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 50, "dest")
        .await
        .unwrap();
    let w = f
        .ledger
        .reject_withdrawal(b, w.id, "unknown destination")
        .await
        .unwrap();
    assert_eq!(w.status, WithdrawalStatus::Rejected);
    assert_eq!(w.rejection_reason.as_deref(), Some("unknown destination"));

    let err = f.ledger.approve_withdrawal(a, w.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidWithdrawalState { .. }));
    assert!(f.ledger.get_pending_withdrawals().unwrap().is_empty());
}

#[tokio::test]
async fn test_only_requester_may_cancel() {
    let f = fixture(2).await;
    let [a, b] = [&f.signers[0], &f.signers[1]];

    let w = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 50, "dest")
        .await
        .unwrap();

    let err = f.ledger.cancel_withdrawal(b, w.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let w = f.ledger.cancel_withdrawal(a, w.id).await.unwrap();
    assert_eq!(w.status, WithdrawalStatus::Cancelled);
}

#[tokio::test]
async fn test_unknown_withdrawal() {
    let f = fixture(1).await;

    assert!(matches!(
        f.ledger.approve_withdrawal(&f.signers[0], 404).await,
        Err(LedgerError::WithdrawalNotFound(404))
    ));
    assert!(matches!(
        f.ledger.get_withdrawal(404),
        Err(LedgerError::WithdrawalNotFound(404))
    ));
}

#[test]
fn test_zero_approval_threshold_is_invalid() {
    let err = LedgerConfig::default().with_required_approvals(0).validate().unwrap_err();
    assert!(matches!(err, LedgerError::InvalidConfig(_)));
}

// ============================================================================
// RESERVE AND PAUSE
// ============================================================================

#[tokio::test]
async fn test_icp_reserve_limits_requests() {
    let f = fixture_with(LedgerConfig::default().with_min_reserve(300)).await;
    let a = &f.signers[0];

    let err = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 701, "dest")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::BelowReserve { asset: AssetType::Icp, reserve: 300 }));
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);

    let w = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 700, "dest")
        .await
        .unwrap();
    f.ledger.approve_withdrawal(a, w.id).await.unwrap();
    f.ledger.execute_withdrawal(a, w.id).await.unwrap();
    assert_eq!(treasury_icp(&f.ledger), 300);
}

#[tokio::test]
async fn test_icp_reserve_rechecked_at_execution() {
    let f = fixture_with(LedgerConfig::default().with_min_reserve(300)).await;
    let a = &f.signers[0];

    let first = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 500, "dest")
        .await
        .unwrap();
    let second = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 500, "dest")
        .await
        .unwrap();
    f.ledger.approve_withdrawal(a, first.id).await.unwrap();
    f.ledger.approve_withdrawal(a, second.id).await.unwrap();
    f.ledger.execute_withdrawal(a, first.id).await.unwrap();

    let err = f.ledger.execute_withdrawal(a, second.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::BelowReserve { .. }));
    assert_eq!(treasury_icp(&f.ledger), 500);
    assert_eq!(
        f.ledger.get_withdrawal(second.id).unwrap().status,
        WithdrawalStatus::Approved
    );
}

#[tokio::test]
async fn test_reserve_applies_to_icp_only() {
    let f = fixture_with(LedgerConfig::default().with_min_reserve(300)).await;
    let a = &f.signers[0];
    f.ledger
        .deposit(&f.outsider, AccountId::Treasury, AssetType::CkUsdc, 200, "seed")
        .await
        .unwrap();

    let w = f
        .ledger
        .request_withdrawal(a, AssetType::CkUsdc, 200, "dest")
        .await
        .unwrap();
    f.ledger.approve_withdrawal(a, w.id).await.unwrap();
    f.ledger.execute_withdrawal(a, w.id).await.unwrap();
    assert_eq!(
        f.ledger.get_balance(&AccountId::Treasury, AssetType::CkUsdc).unwrap(),
        0
    );
}

#[tokio::test]
async fn test_pause_stops_requests_and_execution() {
    let f = fixture(1).await;
    let a = &f.signers[0];

    let approved = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 100, "dest")
        .await
        .unwrap();
    f.ledger.approve_withdrawal(a, approved.id).await.unwrap();

    assert!(f.ledger.set_withdrawals_paused(&f.admin, true).await.unwrap());
    assert!(f.ledger.withdrawals_paused().unwrap());
    assert!(f.ledger.stats().unwrap().withdrawals_paused);

    let err = f
        .ledger
        .request_withdrawal(a, AssetType::Icp, 10, "dest")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::WithdrawalsPaused));
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    assert!(matches!(
        f.ledger.execute_withdrawal(a, approved.id).await,
        Err(LedgerError::WithdrawalsPaused)
    ));
    assert_eq!(treasury_icp(&f.ledger), 1_000);

    // Approved requests execute once resumed
    assert!(!f.ledger.set_withdrawals_paused(&f.admin, false).await.unwrap());
    let done = f.ledger.execute_withdrawal(a, approved.id).await.unwrap();
    assert_eq!(done.status, WithdrawalStatus::Executed);
    assert_eq!(treasury_icp(&f.ledger), 900);
    assert!(!f.ledger.stats().unwrap().withdrawals_paused);
}

#[tokio::test]
async fn test_only_admin_may_pause() {
    let f = fixture(1).await;

    let err = f
        .ledger
        .set_withdrawals_paused(&f.signers[0], true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(!f.ledger.withdrawals_paused().unwrap());
}
