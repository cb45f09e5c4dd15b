// Escrow Tests
// Creation, funding, handoff codes, release and cancellation

use freight_escrow::access::Capabilities;
use freight_escrow::clock::ManualClock;
use freight_escrow::config::PlatformConfig;
use freight_escrow::escrow::{
    CodeKind, CreateEscrowArgs, Escrow, EscrowError, EscrowId, EscrowStatus,
};
use freight_escrow::identity::{Caller, Keypair};
use freight_escrow::ledger::{AccountId, AssetType};
use freight_escrow::storage::Store;
use freight_escrow::{ErrorKind, Platform};
use std::sync::Arc;

struct Fixture {
    platform: Platform,
    clock: Arc<ManualClock>,
    admin: Caller,
    shipper: Caller,
    carrier: Caller,
    stranger: Caller,
}

fn fixture() -> Fixture {
    let admin = Caller::local(&Keypair::generate());
    let clock = Arc::new(ManualClock::new(1_000));
    let platform = Platform::builder(PlatformConfig::default(), Store::temporary().unwrap())
        .with_capabilities(Capabilities::new().with_admin(admin.did().clone()))
        .with_clock(clock.clone())
        .build()
        .unwrap();

    Fixture {
        platform,
        clock,
        admin,
        shipper: Caller::local(&Keypair::generate()),
        carrier: Caller::local(&Keypair::generate()),
        stranger: Caller::local(&Keypair::generate()),
    }
}

impl Fixture {
    fn args(&self, load_id: &str, amount: u64) -> CreateEscrowArgs {
        CreateEscrowArgs::new(
            load_id,
            self.shipper.did().clone(),
            self.carrier.did().clone(),
            amount,
        )
    }

    async fn deposit(&self, caller: &Caller, amount: u64) {
        self.platform
            .ledger()
            .deposit(caller, AccountId::user(caller.did()), AssetType::Icp, amount, "top up")
            .await
            .unwrap();
    }

    fn balance(&self, account: &AccountId) -> u64 {
        self.platform.ledger().get_balance(account, AssetType::Icp).unwrap()
    }

    async fn funded(&self, load_id: &str, amount: u64) -> Escrow {
        self.deposit(&self.shipper, amount).await;
        let escrow = self
            .platform
            .escrow()
            .create_escrow(&self.shipper, self.args(load_id, amount))
            .await
            .unwrap();
        self.platform
            .escrow()
            .fund_escrow(&self.shipper, &escrow.id)
            .await
            .unwrap()
    }
}

// ============================================================================
// CREATION
// ============================================================================

#[tokio::test]
async fn test_create_escrow() {
    let f = fixture();

    let escrow = f
        .platform
        .escrow()
        .create_escrow(&f.shipper, f.args("LOAD-000001", 1_000).with_metadata("Reno -> Boise"))
        .await
        .unwrap();

    assert!(EscrowId::parse(escrow.id.as_str()).is_ok());
    assert_eq!(escrow.status, EscrowStatus::Created);
    assert_eq!(escrow.asset, AssetType::Icp);
    assert_eq!(escrow.fee_bps, 300);
    assert_eq!(escrow.platform_fee, 30);
    assert_eq!(escrow.carrier_amount(), 970);
    assert_eq!(escrow.created_at, 1_000);
    assert!(escrow.pickup_code.starts_with("QR-PICKUP-"));
    assert!(escrow.delivery_code.starts_with("QR-DELIVERY-"));
    assert_ne!(escrow.pickup_code, escrow.delivery_code);

    let record = f.platform.escrow().verify_qr_code(&escrow.pickup_code).unwrap();
    assert_eq!(record.kind, CodeKind::Pickup);
    assert_eq!(record.escrow_id, escrow.id);
    assert!(!record.is_used());

    // Creation moves no funds
    assert_eq!(f.balance(&escrow.account()), 0);
}

#[tokio::test]
async fn test_create_validates_arguments() {
    let f = fixture();
    let escrow = f.platform.escrow();

    assert!(matches!(
        escrow.create_escrow(&f.shipper, f.args("LOAD-1", 0)).await,
        Err(EscrowError::InvalidAmount)
    ));
    assert!(matches!(
        escrow.create_escrow(&f.shipper, f.args("  ", 10)).await,
        Err(EscrowError::InvalidInput(_))
    ));

    let same = CreateEscrowArgs::new("LOAD-1", f.shipper.did().clone(), f.shipper.did().clone(), 10);
    assert!(matches!(
        escrow.create_escrow(&f.shipper, same).await,
        Err(EscrowError::SameParty)
    ));

    let err = escrow
        .create_escrow(&f.stranger, f.args("LOAD-1", 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_repeated_create_returns_same_escrow() {
    let f = fixture();
    let escrow = f.platform.escrow();

    let first = escrow.create_escrow(&f.shipper, f.args("LOAD-7", 500)).await.unwrap();
    let again = escrow.create_escrow(&f.shipper, f.args("LOAD-7", 500)).await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(escrow.stats().unwrap().total, 1);

    let err = escrow
        .create_escrow(&f.shipper, f.args("LOAD-7", 501))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::ActiveEscrowExists { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_new_escrow_allowed_after_cancellation() {
    let f = fixture();
    let escrow = f.platform.escrow();

    let first = escrow.create_escrow(&f.shipper, f.args("LOAD-8", 500)).await.unwrap();
    escrow.cancel_escrow(&f.shipper, &first.id).await.unwrap();

    let second = escrow.create_escrow(&f.shipper, f.args("LOAD-8", 500)).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(
        escrow.get_escrow_for_load("LOAD-8").unwrap().map(|e| e.id),
        Some(second.id)
    );
}

// ============================================================================
// FUNDING
// ============================================================================

#[tokio::test]
async fn test_fund_moves_amount_into_escrow_account() {
    let f = fixture();
    let escrow = f.funded("LOAD-1", 1_000).await;

    assert_eq!(escrow.status, EscrowStatus::Funded);
    assert_eq!(escrow.funded_at, Some(1_000));
    assert_eq!(f.balance(&AccountId::user(f.shipper.did())), 0);
    assert_eq!(f.balance(&escrow.account()), 1_000);

    let tx = f
        .platform
        .ledger()
        .get_transaction(escrow.funding_tx.unwrap())
        .unwrap();
    assert_eq!(tx.to, Some(escrow.account()));
}

#[tokio::test]
async fn test_second_fund_is_rejected_without_debit() {
    let f = fixture();
    f.deposit(&f.shipper, 1_000).await;
    let escrow = f.funded("LOAD-1", 1_000).await;
    assert_eq!(f.balance(&AccountId::user(f.shipper.did())), 1_000);

    let err = f
        .platform
        .escrow()
        .fund_escrow(&f.shipper, &escrow.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::WrongStatus { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(f.balance(&AccountId::user(f.shipper.did())), 1_000);
    assert_eq!(f.balance(&escrow.account()), 1_000);
}

#[tokio::test]
async fn test_fund_without_balance_leaves_escrow_created() {
    let f = fixture();
    f.deposit(&f.shipper, 999).await;
    let escrow = f
        .platform
        .escrow()
        .create_escrow(&f.shipper, f.args("LOAD-1", 1_000))
        .await
        .unwrap();

    let err = f
        .platform
        .escrow()
        .fund_escrow(&f.shipper, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
    assert_eq!(
        f.platform.escrow().get_escrow(&escrow.id).unwrap().status,
        EscrowStatus::Created
    );
    assert_eq!(f.balance(&AccountId::user(f.shipper.did())), 999);
}

#[tokio::test]
async fn test_only_shipper_side_may_fund() {
    let f = fixture();
    f.deposit(&f.shipper, 100).await;
    let escrow = f
        .platform
        .escrow()
        .create_escrow(&f.shipper, f.args("LOAD-1", 100))
        .await
        .unwrap();

    let err = f
        .platform
        .escrow()
        .fund_escrow(&f.carrier, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

// ============================================================================
// HANDOFF CODES
// ============================================================================

#[tokio::test]
async fn test_full_lifecycle_releases_to_carrier_and_treasury() {
    let f = fixture();
    let escrow_service = f.platform.escrow();
    let escrow = f.funded("LOAD-1", 1_000).await;

    f.clock.advance(60);
    let picked = escrow_service
        .verify_qr(&f.carrier, &escrow.pickup_code, Some("Reno dock 4"))
        .await
        .unwrap();
    assert_eq!(picked.status, EscrowStatus::PickupConfirmed);
    assert_eq!(picked.pickup_at, Some(1_060));

    let moving = escrow_service.mark_in_transit(&f.carrier, &escrow.id).await.unwrap();
    assert_eq!(moving.status, EscrowStatus::InTransit);

    f.clock.advance(3_600);
    let delivered = escrow_service
        .verify_qr(&f.shipper, &escrow.delivery_code, None)
        .await
        .unwrap();
    assert_eq!(delivered.status, EscrowStatus::DeliveryConfirmed);
    assert_eq!(delivered.delivery_at, Some(4_660));

    let released = escrow_service.release_payment(&f.shipper, &escrow.id).await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(released.settlement_txs.len(), 2);

    assert_eq!(f.balance(&AccountId::user(f.carrier.did())), 970);
    assert_eq!(f.balance(&AccountId::Treasury), 30);
    assert_eq!(f.balance(&escrow.account()), 0);

    let record = escrow_service.verify_qr_code(&escrow.pickup_code).unwrap();
    let verification = record.verification.unwrap();
    assert_eq!(&verification.verified_by, f.carrier.did());
    assert_eq!(verification.location.as_deref(), Some("Reno dock 4"));
}

#[tokio::test]
async fn test_code_cannot_be_used_twice() {
    let f = fixture();
    let escrow = f.funded("LOAD-1", 100).await;

    f.platform
        .escrow()
        .verify_qr(&f.carrier, &escrow.pickup_code, None)
        .await
        .unwrap();
    let err = f
        .platform
        .escrow()
        .verify_qr(&f.carrier, &escrow.pickup_code, None)
        .await
        .unwrap_err();

    assert!(matches!(err, EscrowError::CodeAlreadyUsed(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_unknown_code() {
    let f = fixture();
    let err = f
        .platform
        .escrow()
        .verify_qr(&f.carrier, "QR-PICKUP-0000000000000000", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_pickup_code_needs_the_carrier() {
    let f = fixture();
    let escrow = f.funded("LOAD-1", 100).await;

    let err = f
        .platform
        .escrow()
        .verify_qr(&f.stranger, &escrow.pickup_code, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(!f
        .platform
        .escrow()
        .verify_qr_code(&escrow.pickup_code)
        .unwrap()
        .is_used());
}

#[tokio::test]
async fn test_delivery_before_pickup_leaves_code_unused() {
    let f = fixture();
    let escrow = f.funded("LOAD-1", 100).await;

    let err = f
        .platform
        .escrow()
        .verify_qr(&f.shipper, &escrow.delivery_code, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(!f
        .platform
        .escrow()
        .verify_qr_code(&escrow.delivery_code)
        .unwrap()
        .is_used());
    assert_eq!(
        f.platform.escrow().get_escrow(&escrow.id).unwrap().status,
        EscrowStatus::Funded
    );
}

#[tokio::test]
async fn test_warehouse_can_confirm_delivery() {
    let f = fixture();
    let warehouse = Caller::local(&Keypair::generate());
    f.deposit(&f.shipper, 100).await;
    let escrow_service = f.platform.escrow();

    let escrow = escrow_service
        .create_escrow(
            &f.shipper,
            f.args("LOAD-1", 100).with_warehouse(warehouse.did().clone()),
        )
        .await
        .unwrap();
    escrow_service.fund_escrow(&f.shipper, &escrow.id).await.unwrap();
    escrow_service
        .verify_qr(&f.carrier, &escrow.pickup_code, None)
        .await
        .unwrap();

    // Carrier cannot sign off its own delivery
    let err = escrow_service
        .verify_qr(&f.carrier, &escrow.delivery_code, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let delivered = escrow_service
        .verify_qr(&warehouse, &escrow.delivery_code, None)
        .await
        .unwrap();
    assert_eq!(delivered.status, EscrowStatus::DeliveryConfirmed);
}

#[tokio::test]
async fn test_mark_in_transit_rules() {
    let f = fixture();
    let escrow_service = f.platform.escrow();
    let escrow = f.funded("LOAD-1", 100).await;

    let err = escrow_service
        .mark_in_transit(&f.carrier, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    escrow_service
        .verify_qr(&f.carrier, &escrow.pickup_code, None)
        .await
        .unwrap();
    let err = escrow_service
        .mark_in_transit(&f.stranger, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    escrow_service.mark_in_transit(&f.carrier, &escrow.id).await.unwrap();
    let again = escrow_service.mark_in_transit(&f.carrier, &escrow.id).await.unwrap();
    assert_eq!(again.status, EscrowStatus::InTransit);
}

// ============================================================================
// RELEASE
// ============================================================================

#[tokio::test]
async fn test_release_requires_confirmed_delivery() {
    let f = fixture();
    let escrow = f.funded("LOAD-1", 100).await;

    let err = f
        .platform
        .escrow()
        .release_payment(&f.shipper, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(f.balance(&escrow.account()), 100);
}

#[tokio::test]
async fn test_release_by_carrier_refused_but_admin_allowed() {
    let f = fixture();
    let escrow_service = f.platform.escrow();
    let escrow = f.funded("LOAD-1", 1_000).await;
    escrow_service
        .verify_qr(&f.carrier, &escrow.pickup_code, None)
        .await
        .unwrap();
    escrow_service
        .verify_qr(&f.shipper, &escrow.delivery_code, None)
        .await
        .unwrap();

    let err = escrow_service
        .release_payment(&f.carrier, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let released = escrow_service.release_payment(&f.admin, &escrow.id).await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);

    let err = escrow_service
        .release_payment(&f.shipper, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(f.balance(&AccountId::user(f.carrier.did())), 970);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_cancel_unfunded_escrow() {
    let f = fixture();
    let escrow_service = f.platform.escrow();
    let escrow = escrow_service
        .create_escrow(&f.shipper, f.args("LOAD-1", 100))
        .await
        .unwrap();

    let cancelled = escrow_service.cancel_escrow(&f.shipper, &escrow.id).await.unwrap();
    assert_eq!(cancelled.status, EscrowStatus::Cancelled);

    let again = escrow_service.cancel_escrow(&f.shipper, &escrow.id).await.unwrap();
    assert_eq!(again, cancelled);
}

#[tokio::test]
async fn test_cancel_funded_escrow_refunds_shipper() {
    let f = fixture();
    let escrow = f.funded("LOAD-1", 1_000).await;

    let cancelled = f
        .platform
        .escrow()
        .cancel_escrow(&f.shipper, &escrow.id)
        .await
        .unwrap();

    assert_eq!(cancelled.status, EscrowStatus::Cancelled);
    assert_eq!(f.balance(&AccountId::user(f.shipper.did())), 1_000);
    assert_eq!(f.balance(&escrow.account()), 0);
    assert_eq!(f.balance(&AccountId::Treasury), 0);
}

#[tokio::test]
async fn test_cannot_cancel_after_pickup() {
    let f = fixture();
    let escrow = f.funded("LOAD-1", 100).await;
    f.platform
        .escrow()
        .verify_qr(&f.carrier, &escrow.pickup_code, None)
        .await
        .unwrap();

    let err = f
        .platform
        .escrow()
        .cancel_escrow(&f.shipper, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_carrier_cannot_cancel() {
    let f = fixture();
    let escrow = f
        .platform
        .escrow()
        .create_escrow(&f.shipper, f.args("LOAD-1", 100))
        .await
        .unwrap();

    let err = f
        .platform
        .escrow()
        .cancel_escrow(&f.carrier, &escrow.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

// ============================================================================
// QUERIES
// ============================================================================

#[tokio::test]
async fn test_queries_by_party_and_status() {
    let f = fixture();
    let escrow_service = f.platform.escrow();
    let funded = f.funded("LOAD-1", 100).await;
    let created = escrow_service
        .create_escrow(&f.shipper, f.args("LOAD-2", 50))
        .await
        .unwrap();

    assert_eq!(escrow_service.get_escrows_for_party(f.carrier.did()).unwrap().len(), 2);
    assert!(escrow_service.get_escrows_for_party(f.stranger.did()).unwrap().is_empty());

    let by_status = escrow_service.get_escrows_by_status(EscrowStatus::Created).unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].id, created.id);

    let stats = escrow_service.stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.held, 100);
    assert_eq!(stats.by_status.get("Funded"), Some(&1));
    assert_eq!(escrow_service.get_escrow(&funded.id).unwrap().amount, 100);
}

#[tokio::test]
async fn test_held_total_saturates() {
    let f = fixture();
    let escrow_service = f.platform.escrow();
    f.funded("LOAD-1", u64::MAX).await;

    f.deposit(&f.stranger, u64::MAX).await;
    let args = CreateEscrowArgs::new("LOAD-2", f.stranger.did().clone(), f.carrier.did().clone(), u64::MAX);
    let second = escrow_service.create_escrow(&f.stranger, args).await.unwrap();
    escrow_service.fund_escrow(&f.stranger, &second.id).await.unwrap();

    let stats = escrow_service.stats().unwrap();
    assert_eq!(stats.by_status.get("Funded"), Some(&2));
    assert_eq!(stats.held, u64::MAX);
}

#[tokio::test]
async fn test_unknown_escrow_and_bad_id() {
    let f = fixture();

    let id = EscrowId::parse("ESC-000000000000").unwrap();
    assert!(matches!(
        f.platform.escrow().get_escrow(&id),
        Err(EscrowError::EscrowNotFound(_))
    ));
    assert!(matches!(
        "ESC-xyz".parse::<EscrowId>(),
        Err(EscrowError::InvalidEscrowId(_))
    ));
    assert!(f.platform.escrow().get_escrow_for_load("LOAD-404").unwrap().is_none());
}

#[tokio::test]
async fn test_reference_id_is_part_of_the_terms() {
    let f = fixture();
    let escrow_service = f.platform.escrow();

    let args = f.args("LOAD-9", 400).with_reference_id("PO-7731");
    let escrow = escrow_service.create_escrow(&f.shipper, args.clone()).await.unwrap();
    assert_eq!(escrow.reference_id.as_deref(), Some("PO-7731"));

    let again = escrow_service.create_escrow(&f.shipper, args).await.unwrap();
    assert_eq!(again.id, escrow.id);

    let other = f.args("LOAD-9", 400).with_reference_id("PO-7732");
    assert!(matches!(
        escrow_service.create_escrow(&f.shipper, other).await,
        Err(EscrowError::ActiveEscrowExists { .. })
    ));
}

// ============================================================================
// PLATFORM FEE
// ============================================================================

#[tokio::test]
async fn test_fee_update_applies_to_new_escrows_only() {
    let f = fixture();
    let escrow_service = f.platform.escrow();
    let existing = f.funded("LOAD-1", 1_000).await;

    let fee = escrow_service.update_platform_fee(&f.admin, 500).await.unwrap();
    assert_eq!(fee, 500);
    assert_eq!(escrow_service.platform_fee_bps(), 500);

    let newer = escrow_service
        .create_escrow(&f.shipper, f.args("LOAD-2", 1_000))
        .await
        .unwrap();
    assert_eq!(newer.fee_bps, 500);
    assert_eq!(newer.platform_fee, 50);

    // The funded escrow settles on the fee it was opened with
    escrow_service
        .verify_qr(&f.carrier, &existing.pickup_code, None)
        .await
        .unwrap();
    escrow_service
        .verify_qr(&f.shipper, &existing.delivery_code, None)
        .await
        .unwrap();
    let released = escrow_service.release_payment(&f.shipper, &existing.id).await.unwrap();
    assert_eq!(released.fee_bps, 300);
    assert_eq!(f.balance(&AccountId::user(f.carrier.did())), 970);
    assert_eq!(f.balance(&AccountId::Treasury), 30);
}

#[tokio::test]
async fn test_fee_update_rules() {
    let f = fixture();
    let escrow_service = f.platform.escrow();

    let err = escrow_service
        .update_platform_fee(&f.shipper, 100)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    assert!(matches!(
        escrow_service.update_platform_fee(&f.admin, 1_001).await,
        Err(EscrowError::InvalidInput(_))
    ));
    assert_eq!(escrow_service.platform_fee_bps(), 300);

    assert_eq!(escrow_service.update_platform_fee(&f.admin, 0).await.unwrap(), 0);
    let free = escrow_service
        .create_escrow(&f.shipper, f.args("LOAD-3", 1_000))
        .await
        .unwrap();
    assert_eq!(free.platform_fee, 0);
    assert_eq!(free.carrier_amount(), 1_000);
}

#[tokio::test]
async fn test_fee_update_survives_reopen() {
    let f = fixture();
    f.platform
        .escrow()
        .update_platform_fee(&f.admin, 250)
        .await
        .unwrap();

    let reopened = Platform::builder(PlatformConfig::default(), f.platform.store().clone())
        .with_capabilities(Capabilities::new().with_admin(f.admin.did().clone()))
        .with_clock(f.clock.clone())
        .build()
        .unwrap();
    assert_eq!(reopened.escrow().platform_fee_bps(), 250);
}
