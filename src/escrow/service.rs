// Escrow service - custodial records, handoff codes and settlement
//
// Money moves only through the ledger port, always with a deterministic
// idempotency reference, and always before the escrow record is updated.
// A step that fails after its ledger call can therefore be retried: the
// ledger replays the original transaction instead of paying twice.

use crate::access::{AccessDenied, Capabilities};
use crate::clock::Clock;
use crate::error::{ErrorKind, ServiceError};
use crate::escrow::fees::{platform_fee, MAX_FEE_BPS};
use crate::escrow::{
    CodeKind, CodeRecord, CreateEscrowArgs, DisputeRecord, Escrow, EscrowId, EscrowStatus,
    QrVerification,
};
use crate::identity::{Caller, Did};
use crate::ledger::{AccountId, AssetType, LedgerError, LedgerPort, TransferRequest};
use crate::relay::RelayError;
use crate::storage::{finish, tx_put, Store, StoreError, Table};
use serde::{Deserialize, Serialize};
use sled::Transactional;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

mod trees {
    pub const ESCROWS: &str = "escrow.escrows";
    pub const CODES: &str = "escrow.codes";
    pub const BY_LOAD: &str = "escrow.by_load";
    pub const SETTINGS: &str = "escrow.settings";
}

const PLATFORM_FEE_KEY: &[u8] = b"platform_fee_bps";

// ============================================================================
// ESCROW CONFIG
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    /// Fee retained by the treasury on release, in basis points
    pub platform_fee_bps: u16,
    /// Asset escrows are denominated in
    pub asset: AssetType,
    /// Delivery-confirmed escrows older than this are released automatically
    pub auto_release_delay_secs: u64,
    /// How often the auto-release sweep runs
    pub sweep_interval_secs: u64,
}

impl EscrowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform_fee_bps(mut self, bps: u16) -> Self {
        self.platform_fee_bps = bps;
        self
    }

    pub fn with_asset(mut self, asset: AssetType) -> Self {
        self.asset = asset;
        self
    }

    pub fn with_auto_release_delay_secs(mut self, secs: u64) -> Self {
        self.auto_release_delay_secs = secs;
        self
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<(), EscrowError> {
        if self.platform_fee_bps > MAX_FEE_BPS {
            return Err(EscrowError::InvalidConfig(format!(
                "platform_fee_bps must be <= {}",
                MAX_FEE_BPS
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(EscrowError::InvalidConfig(
                "sweep_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 300,
            asset: AssetType::Icp,
            auto_release_delay_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

// ============================================================================
// ESCROW ERROR
// ============================================================================

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid escrow id: {0}")]
    InvalidEscrowId(String),

    #[error("Shipper and carrier must be different parties")]
    SameParty,

    #[error("Escrow {0} not found")]
    EscrowNotFound(EscrowId),

    #[error("Code {0} not found")]
    CodeNotFound(String),

    #[error("Code {0} has already been used")]
    CodeAlreadyUsed(String),

    #[error("Cannot {operation} escrow {id} while {status}")]
    WrongStatus {
        id: EscrowId,
        status: EscrowStatus,
        operation: &'static str,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: EscrowStatus, to: EscrowStatus },

    #[error("Load {load_id} already has active escrow {escrow_id}")]
    ActiveEscrowExists { load_id: String, escrow_id: EscrowId },

    #[error("Escrow {id} is already being settled (release to carrier: {release_to_carrier})")]
    SettlementInProgress { id: EscrowId, release_to_carrier: bool },

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AccessDenied),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::InvalidAmount
            | EscrowError::InvalidInput(_)
            | EscrowError::InvalidEscrowId(_)
            | EscrowError::SameParty
            | EscrowError::InvalidConfig(_) => ErrorKind::InvalidInput,
            EscrowError::EscrowNotFound(_) | EscrowError::CodeNotFound(_) => ErrorKind::NotFound,
            EscrowError::CodeAlreadyUsed(_)
            | EscrowError::WrongStatus { .. }
            | EscrowError::InvalidTransition { .. }
            | EscrowError::ActiveEscrowExists { .. }
            | EscrowError::SettlementInProgress { .. } => ErrorKind::InvalidState,
            EscrowError::Unauthorized(_) => ErrorKind::Unauthorized,
            EscrowError::Ledger(e) => e.kind(),
            EscrowError::Storage(_) | EscrowError::Relay(_) => ErrorKind::Storage,
        }
    }
}

impl ServiceError for EscrowError {
    fn kind(&self) -> ErrorKind {
        EscrowError::kind(self)
    }
}

/// Counts by status, plus value currently held in escrow
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EscrowStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub held: u64,
}

// ============================================================================
// ESCROW SERVICE
// ============================================================================

pub struct EscrowService {
    config: EscrowConfig,
    capabilities: Arc<Capabilities>,
    ledger: Arc<dyn LedgerPort>,
    clock: Arc<dyn Clock>,
    escrows: Table<Escrow>,
    codes: Table<CodeRecord>,
    by_load: Table<EscrowId>,
    settings: Table<u16>,
    fee_bps: AtomicU16,
    write_lock: Mutex<()>,
}

impl EscrowService {
    pub fn open(
        store: &Store,
        config: EscrowConfig,
        capabilities: Arc<Capabilities>,
        ledger: Arc<dyn LedgerPort>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EscrowError> {
        config.validate()?;

        // An admin fee override outlives restarts and wins over the config
        let settings: Table<u16> = store.table(trees::SETTINGS)?;
        let fee_bps = settings
            .get(PLATFORM_FEE_KEY)?
            .unwrap_or(config.platform_fee_bps);

        Ok(Self {
            config,
            capabilities,
            ledger,
            clock,
            escrows: store.table(trees::ESCROWS)?,
            codes: store.table(trees::CODES)?,
            by_load: store.table(trees::BY_LOAD)?,
            settings,
            fee_bps: AtomicU16::new(fee_bps),
            write_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    /// Fee applied to escrows created from now on
    pub fn platform_fee_bps(&self) -> u16 {
        self.fee_bps.load(Ordering::SeqCst)
    }

    /// Change the platform fee for new escrows. Existing escrows keep the
    /// fee they were created with.
    pub async fn update_platform_fee(&self, caller: &Caller, fee_bps: u16) -> Result<u16, EscrowError> {
        self.capabilities.admin(caller)?;
        if fee_bps > MAX_FEE_BPS {
            return Err(EscrowError::InvalidInput(format!(
                "platform fee must be <= {} bps",
                MAX_FEE_BPS
            )));
        }
        let _guard = self.write_lock.lock().await;

        self.settings.insert(PLATFORM_FEE_KEY, &fee_bps)?;
        let previous = self.fee_bps.swap(fee_bps, Ordering::SeqCst);

        tracing::info!(previous, fee_bps, by = %caller.did(), "platform fee updated");
        Ok(fee_bps)
    }

    // ========================================================================
    // CREATION AND FUNDING
    // ========================================================================

    /// Open an escrow for a load. No funds move.
    ///
    /// Repeating a call with identical arguments while the earlier escrow is
    /// still `Created` returns that escrow.
    pub async fn create_escrow(
        &self,
        caller: &Caller,
        args: CreateEscrowArgs,
    ) -> Result<Escrow, EscrowError> {
        self.capabilities.operator_for(caller, &args.shipper)?;
        if args.amount == 0 {
            return Err(EscrowError::InvalidAmount);
        }
        if args.shipper == args.carrier {
            return Err(EscrowError::SameParty);
        }
        if args.load_id.trim().is_empty() {
            return Err(EscrowError::InvalidInput("load id must not be empty".to_string()));
        }

        let _guard = self.write_lock.lock().await;

        // One active escrow per load; an identical retry gets the same one
        if let Some(existing) = self.get_escrow_for_load(&args.load_id)? {
            if !existing.status.is_terminal() {
                if existing.status == EscrowStatus::Created && args.same_terms(&existing) {
                    tracing::debug!(escrow = %existing.id, load = %args.load_id, "escrow create replayed");
                    return Ok(existing);
                }
                return Err(EscrowError::ActiveEscrowExists {
                    load_id: args.load_id.clone(),
                    escrow_id: existing.id,
                });
            }
        }

        let now = self.clock.now();
        let fee_bps = self.platform_fee_bps();
        let id = EscrowId::generate(&args, now);
        let escrow = Escrow {
            pickup_code: CodeKind::Pickup.generate_code(&id),
            delivery_code: CodeKind::Delivery.generate_code(&id),
            id,
            load_id: args.load_id,
            reference_id: args.reference_id,
            shipper: args.shipper,
            carrier: args.carrier,
            warehouse: args.warehouse,
            asset: self.config.asset,
            amount: args.amount,
            fee_bps,
            platform_fee: platform_fee(args.amount, fee_bps),
            status: EscrowStatus::Created,
            metadata: args.metadata,
            created_at: now,
            updated_at: now,
            funded_at: None,
            pickup_at: None,
            delivery_at: None,
            settled_at: None,
            dispute: None,
            funding_tx: None,
            settlement_txs: Vec::new(),
        };

        // Both codes and the load index commit with the record
        let codes = [
            CodeRecord {
                code: escrow.pickup_code.clone(),
                escrow_id: escrow.id.clone(),
                kind: CodeKind::Pickup,
                verification: None,
            },
            CodeRecord {
                code: escrow.delivery_code.clone(),
                escrow_id: escrow.id.clone(),
                kind: CodeKind::Delivery,
                verification: None,
            },
        ];

        finish(
            (self.escrows.tree(), self.codes.tree(), self.by_load.tree()).transaction(
                |(escrows, code_tree, by_load)| {
                    tx_put::<_, EscrowError>(escrows, escrow.id.as_str().as_bytes(), &escrow)?;
                    for record in &codes {
                        tx_put::<_, EscrowError>(code_tree, record.code.as_bytes(), record)?;
                    }
                    tx_put::<_, EscrowError>(by_load, escrow.load_id.as_bytes(), &escrow.id)?;
                    Ok(())
                },
            ),
        )?;

        tracing::info!(
            escrow = %escrow.id,
            load = %escrow.load_id,
            amount = escrow.amount,
            fee = escrow.platform_fee,
            "escrow created"
        );
        Ok(escrow)
    }

    /// Move the escrow amount from the shipper into the escrow-held account.
    ///
    /// A retry after a lost reply replays the original ledger transfer, so
    /// the shipper is debited once.
    pub async fn fund_escrow(&self, caller: &Caller, id: &EscrowId) -> Result<Escrow, EscrowError> {
        let _guard = self.write_lock.lock().await;

        let mut escrow = self.load(id)?;
        self.capabilities.operator_for(caller, &escrow.shipper)?;
        self.require_status(&escrow, &[EscrowStatus::Created], "fund")?;

        let request = TransferRequest::new(
            AccountId::user(&escrow.shipper),
            escrow.account(),
            escrow.asset,
            escrow.amount,
        )
        .with_memo(&format!("fund escrow {}", escrow.id))
        .with_reference(&escrow.reference("fund"));
        let tx = self.ledger.transfer(request).await.inspect_err(|e| {
            tracing::warn!(escrow = %id, error = %e, "escrow funding failed");
        })?;

        self.mark_funded(&mut escrow, tx.id)?;

        tracing::info!(escrow = %id, tx = tx.id, amount = escrow.amount, "escrow funded");
        Ok(escrow)
    }

    // ========================================================================
    // HANDOFF VERIFICATION
    // ========================================================================

    /// Consume a pickup or delivery code.
    ///
    /// The code stays unused unless the escrow advances; the verification
    /// record and the escrow update commit together.
    pub async fn verify_qr(
        &self,
        caller: &Caller,
        code: &str,
        location: Option<&str>,
    ) -> Result<Escrow, EscrowError> {
        let _guard = self.write_lock.lock().await;

        let mut record = self
            .codes
            .get(code.as_bytes())?
            .ok_or_else(|| EscrowError::CodeNotFound(code.to_string()))?;
        if record.is_used() {
            tracing::warn!(code, by = %caller.did(), "code reuse rejected");
            return Err(EscrowError::CodeAlreadyUsed(code.to_string()));
        }
        let escrow = self.load(&record.escrow_id)?;
        let mut escrow = self.reconcile(escrow).await?;

        // The code kind decides who may scan it and from which status
        let next = match record.kind {
            CodeKind::Pickup => {
                self.capabilities.carrier_of(caller, &escrow.carrier)?;
                self.require_status(&escrow, &[EscrowStatus::Funded], "confirm pickup of")?;
                EscrowStatus::PickupConfirmed
            }
            CodeKind::Delivery => {
                if escrow.warehouse.as_ref() != Some(caller.did()) {
                    self.capabilities.shipper_of(caller, &escrow.shipper)?;
                }
                self.require_status(
                    &escrow,
                    &[EscrowStatus::PickupConfirmed, EscrowStatus::InTransit],
                    "confirm delivery of",
                )?;
                EscrowStatus::DeliveryConfirmed
            }
        };

        // Consume the code and advance the escrow in one write
        let now = self.clock.now();
        escrow.transition(next, now)?;
        match record.kind {
            CodeKind::Pickup => escrow.pickup_at = Some(now),
            CodeKind::Delivery => escrow.delivery_at = Some(now),
        }
        record.verification = Some(QrVerification {
            code: record.code.clone(),
            escrow_id: escrow.id.clone(),
            kind: record.kind,
            verified_by: caller.did().clone(),
            verified_at: now,
            location: location.map(str::to_string),
        });

        finish(
            (self.escrows.tree(), self.codes.tree()).transaction(|(escrows, codes)| {
                tx_put::<_, EscrowError>(escrows, escrow.id.as_str().as_bytes(), &escrow)?;
                tx_put::<_, EscrowError>(codes, record.code.as_bytes(), &record)?;
                Ok(())
            }),
        )?;

        tracing::info!(escrow = %escrow.id, kind = record.kind.label(), status = %escrow.status, "handoff verified");
        Ok(escrow)
    }

    /// Record that a picked-up shipment is on the road. Repeating the call
    /// once in transit is a no-op.
    pub async fn mark_in_transit(&self, caller: &Caller, id: &EscrowId) -> Result<Escrow, EscrowError> {
        let _guard = self.write_lock.lock().await;

        let mut escrow = self.load(id)?;
        self.capabilities
            .carrier_of(caller, &escrow.carrier)
            .or_else(|_| self.capabilities.operator(caller))?;
        if escrow.status == EscrowStatus::InTransit {
            return Ok(escrow);
        }
        self.require_status(&escrow, &[EscrowStatus::PickupConfirmed], "mark in transit")?;

        escrow.transition(EscrowStatus::InTransit, self.clock.now())?;
        self.save(&escrow)?;

        tracing::info!(escrow = %id, "escrow in transit");
        Ok(escrow)
    }

    // ========================================================================
    // SETTLEMENT
    // ========================================================================

    pub async fn release_payment(&self, caller: &Caller, id: &EscrowId) -> Result<Escrow, EscrowError> {
        let _guard = self.write_lock.lock().await;

        let escrow = self.load(id)?;
        self.capabilities.shipper_of(caller, &escrow.shipper)?;
        self.require_status(&escrow, &[EscrowStatus::DeliveryConfirmed], "release")?;

        self.settle_release(escrow).await
    }

    /// Freeze the escrow pending a resolver's decision
    pub async fn dispute_escrow(
        &self,
        caller: &Caller,
        id: &EscrowId,
        reason: &str,
    ) -> Result<Escrow, EscrowError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EscrowError::InvalidInput("dispute reason must not be empty".to_string()));
        }
        let _guard = self.write_lock.lock().await;

        let escrow = self.load(id)?;
        self.capabilities
            .party_to(caller, &escrow.shipper, &escrow.carrier)?;

        // A payout or refund already under way settles before any dispute
        let mut escrow = self.reconcile(escrow).await?;
        if !escrow.status.is_disputable() {
            return Err(self.wrong_status(&escrow, "dispute"));
        }

        let now = self.clock.now();
        let status_when_raised = escrow.status;
        escrow.transition(EscrowStatus::Disputed, now)?;
        escrow.dispute = Some(DisputeRecord {
            raised_by: caller.did().clone(),
            reason: reason.to_string(),
            raised_at: now,
            status_when_raised,
            resolved_by: None,
            resolved_at: None,
            released_to_carrier: None,
        });
        self.save(&escrow)?;

        tracing::warn!(escrow = %id, by = %caller.did(), was = %status_when_raised, "escrow disputed");
        Ok(escrow)
    }

    /// Settle a disputed escrow: pay the carrier net of fee, or refund the
    /// shipper in full
    pub async fn resolve_dispute(
        &self,
        caller: &Caller,
        id: &EscrowId,
        release_to_carrier: bool,
    ) -> Result<Escrow, EscrowError> {
        self.capabilities.resolver(caller)?;
        let _guard = self.write_lock.lock().await;

        let mut escrow = self.load(id)?;
        self.require_status(&escrow, &[EscrowStatus::Disputed], "resolve")?;

        // An earlier decision that already started moving money stands
        if let Some(pending) = self.settlement_under_way(&escrow).await? {
            if pending != release_to_carrier {
                return Err(EscrowError::SettlementInProgress {
                    id: id.clone(),
                    release_to_carrier: pending,
                });
            }
        }

        // Record the decision before any transfer
        let now = self.clock.now();
        if let Some(dispute) = escrow.dispute.as_mut() {
            dispute.resolved_by = Some(caller.did().clone());
            dispute.resolved_at = Some(now);
            dispute.released_to_carrier = Some(release_to_carrier);
        }
        self.save(&escrow)?;

        let escrow = if release_to_carrier {
            self.settle_release(escrow).await?
        } else {
            self.settle_refund(escrow, EscrowStatus::Refunded).await?
        };

        tracing::info!(escrow = %id, resolver = %caller.did(), release_to_carrier, "dispute resolved");
        Ok(escrow)
    }

    /// Abandon an escrow before pickup, refunding the shipper if funded.
    /// Cancelling a cancelled escrow returns it unchanged.
    pub async fn cancel_escrow(&self, caller: &Caller, id: &EscrowId) -> Result<Escrow, EscrowError> {
        let _guard = self.write_lock.lock().await;

        let escrow = self.load(id)?;
        self.capabilities
            .shipper_of(caller, &escrow.shipper)
            .or_else(|_| self.capabilities.operator(caller))?;

        // Funding whose reply was lost turns a Created escrow into a
        // Funded one here, so the cancel below refunds it
        let mut escrow = self.reconcile(escrow).await?;

        match escrow.status {
            EscrowStatus::Cancelled => Ok(escrow),
            EscrowStatus::Created => {
                escrow.transition(EscrowStatus::Cancelled, self.clock.now())?;
                self.save(&escrow)?;
                tracing::info!(escrow = %id, "escrow cancelled");
                Ok(escrow)
            }
            EscrowStatus::Funded => {
                let escrow = self.settle_refund(escrow, EscrowStatus::Cancelled).await?;
                tracing::info!(escrow = %id, "funded escrow cancelled and refunded");
                Ok(escrow)
            }
            _ => Err(self.wrong_status(&escrow, "cancel")),
        }
    }

    /// Release every delivery-confirmed escrow whose confirmation is older
    /// than the auto-release delay. Failures are logged and left for the
    /// next sweep.
    pub async fn sweep_auto_release(&self) -> Result<Vec<EscrowId>, EscrowError> {
        let now = self.clock.now();
        let delay = self.config.auto_release_delay_secs;
        let due = self.escrows.filter(|e| {
            e.status == EscrowStatus::DeliveryConfirmed
                && e.delivery_at.is_some_and(|at| at.saturating_add(delay) <= now)
        })?;

        let mut released = Vec::new();
        for candidate in due {
            let _guard = self.write_lock.lock().await;

            let escrow = self.load(&candidate.id)?;
            if escrow.status != EscrowStatus::DeliveryConfirmed {
                continue;
            }
            match self.settle_release(escrow).await {
                Ok(escrow) => {
                    tracing::info!(escrow = %escrow.id, "escrow auto-released");
                    released.push(escrow.id);
                }
                Err(e) => {
                    tracing::warn!(escrow = %candidate.id, error = %e, "auto-release failed");
                }
            }
        }
        Ok(released)
    }

    /// Pay the carrier and the fee, then mark the escrow released.
    /// Caller must hold the write lock.
    async fn settle_release(&self, mut escrow: Escrow) -> Result<Escrow, EscrowError> {
        let mut txs = Vec::new();

        // Carrier first, then the fee; both replay on retry
        let carrier_amount = escrow.carrier_amount();
        if carrier_amount > 0 {
            let request = TransferRequest::new(
                escrow.account(),
                AccountId::user(&escrow.carrier),
                escrow.asset,
                carrier_amount,
            )
            .with_memo(&format!("release escrow {}", escrow.id))
            .with_reference(&escrow.reference("release:carrier"));
            txs.push(self.ledger.transfer(request).await?.id);
        }

        if escrow.platform_fee > 0 {
            let request = TransferRequest::new(
                escrow.account(),
                AccountId::Treasury,
                escrow.asset,
                escrow.platform_fee,
            )
            .with_memo(&format!("platform fee for escrow {}", escrow.id))
            .with_reference(&escrow.reference("release:fee"))
            .as_platform_fee();
            txs.push(self.ledger.transfer(request).await?.id);
        }

        let now = self.clock.now();
        escrow.transition(EscrowStatus::Released, now)?;
        escrow.settled_at = Some(now);
        escrow.settlement_txs.extend(txs);
        self.save(&escrow)?;

        tracing::info!(
            escrow = %escrow.id,
            carrier = %escrow.carrier,
            carrier_amount,
            fee = escrow.platform_fee,
            "escrow released"
        );
        Ok(escrow)
    }

    /// Return the full amount to the shipper. Caller must hold the write lock.
    async fn settle_refund(&self, mut escrow: Escrow, outcome: EscrowStatus) -> Result<Escrow, EscrowError> {
        let request = TransferRequest::new(
            escrow.account(),
            AccountId::user(&escrow.shipper),
            escrow.asset,
            escrow.amount,
        )
        .with_memo(&format!("refund escrow {}", escrow.id))
        .with_reference(&escrow.reference("refund"));
        let tx = self.ledger.transfer(request).await?;

        let now = self.clock.now();
        escrow.transition(outcome, now)?;
        escrow.settled_at = Some(now);
        escrow.settlement_txs.push(tx.id);
        self.save(&escrow)?;

        tracing::info!(escrow = %escrow.id, shipper = %escrow.shipper, amount = escrow.amount, "escrow refunded");
        Ok(escrow)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_escrow(&self, id: &EscrowId) -> Result<Escrow, EscrowError> {
        self.load(id)
    }

    /// Look up a code without consuming it
    pub fn verify_qr_code(&self, code: &str) -> Result<CodeRecord, EscrowError> {
        self.codes
            .get(code.as_bytes())?
            .ok_or_else(|| EscrowError::CodeNotFound(code.to_string()))
    }

    /// The most recent escrow opened for a load
    pub fn get_escrow_for_load(&self, load_id: &str) -> Result<Option<Escrow>, EscrowError> {
        match self.by_load.get(load_id.as_bytes())? {
            Some(id) => Ok(Some(self.load(&id)?)),
            None => Ok(None),
        }
    }

    /// Escrows where the DID is shipper, carrier or warehouse
    pub fn get_escrows_for_party(&self, did: &Did) -> Result<Vec<Escrow>, EscrowError> {
        Ok(self.escrows.filter(|e| e.involves(did))?)
    }

    pub fn get_escrows_by_status(&self, status: EscrowStatus) -> Result<Vec<Escrow>, EscrowError> {
        Ok(self.escrows.filter(|e| e.status == status)?)
    }

    pub fn stats(&self) -> Result<EscrowStats, EscrowError> {
        let mut stats = EscrowStats::default();
        for escrow in self.escrows.values()? {
            stats.total += 1;
            *stats.by_status.entry(escrow.status.to_string()).or_default() += 1;
            if escrow.status.holds_funds() {
                stats.held = stats.held.saturating_add(escrow.amount);
            }
        }
        Ok(stats)
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    /// Bring the record up to date with transfers the ledger already applied
    /// for it. A step whose reply was lost, or whose record was never saved,
    /// is finished here before anything else happens to the escrow.
    /// Caller must hold the write lock.
    async fn reconcile(&self, mut escrow: Escrow) -> Result<Escrow, EscrowError> {
        match escrow.status {
            EscrowStatus::Created => {
                if let Some(tx) = self.ledger.find_transfer(&escrow.reference("fund")).await? {
                    tracing::warn!(escrow = %escrow.id, tx = tx.id, "recovering funding applied by the ledger");
                    self.mark_funded(&mut escrow, tx.id)?;
                }
                Ok(escrow)
            }
            EscrowStatus::Funded => {
                if self.ledger.find_transfer(&escrow.reference("refund")).await?.is_some() {
                    tracing::warn!(escrow = %escrow.id, "finishing interrupted cancellation");
                    return self.settle_refund(escrow, EscrowStatus::Cancelled).await;
                }
                Ok(escrow)
            }
            EscrowStatus::DeliveryConfirmed => {
                if self.release_started(&escrow).await? {
                    tracing::warn!(escrow = %escrow.id, "finishing interrupted release");
                    return self.settle_release(escrow).await;
                }
                Ok(escrow)
            }
            EscrowStatus::Disputed => match self.settlement_under_way(&escrow).await? {
                Some(true) => {
                    tracing::warn!(escrow = %escrow.id, "finishing interrupted dispute release");
                    self.settle_release(escrow).await
                }
                Some(false) => {
                    tracing::warn!(escrow = %escrow.id, "finishing interrupted dispute refund");
                    self.settle_refund(escrow, EscrowStatus::Refunded).await
                }
                None => Ok(escrow),
            },
            _ => Ok(escrow),
        }
    }

    /// Whether any part of the payout reached the ledger
    async fn release_started(&self, escrow: &Escrow) -> Result<bool, EscrowError> {
        for step in ["release:carrier", "release:fee"] {
            if self.ledger.find_transfer(&escrow.reference(step)).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The outcome a disputed escrow is already committed to: a recorded
    /// resolution, or else whichever settlement the ledger has seen
    async fn settlement_under_way(&self, escrow: &Escrow) -> Result<Option<bool>, EscrowError> {
        if let Some(decided) = escrow.dispute.as_ref().and_then(|d| d.released_to_carrier) {
            return Ok(Some(decided));
        }
        if self.release_started(escrow).await? {
            return Ok(Some(true));
        }
        if self.ledger.find_transfer(&escrow.reference("refund")).await?.is_some() {
            return Ok(Some(false));
        }
        Ok(None)
    }

    fn mark_funded(&self, escrow: &mut Escrow, tx_id: u64) -> Result<(), EscrowError> {
        let now = self.clock.now();
        escrow.transition(EscrowStatus::Funded, now)?;
        escrow.funded_at = Some(now);
        escrow.funding_tx = Some(tx_id);
        self.save(escrow)
    }

    fn load(&self, id: &EscrowId) -> Result<Escrow, EscrowError> {
        self.escrows
            .get(id.as_str().as_bytes())?
            .ok_or_else(|| EscrowError::EscrowNotFound(id.clone()))
    }

    fn save(&self, escrow: &Escrow) -> Result<(), EscrowError> {
        self.escrows.insert(escrow.id.as_str().as_bytes(), escrow)?;
        Ok(())
    }

    fn require_status(
        &self,
        escrow: &Escrow,
        allowed: &[EscrowStatus],
        operation: &'static str,
    ) -> Result<(), EscrowError> {
        if allowed.contains(&escrow.status) {
            Ok(())
        } else {
            Err(self.wrong_status(escrow, operation))
        }
    }

    fn wrong_status(&self, escrow: &Escrow, operation: &'static str) -> EscrowError {
        tracing::debug!(escrow = %escrow.id, status = %escrow.status, operation, "rejected by status");
        EscrowError::WrongStatus {
            id: escrow.id.clone(),
            status: escrow.status,
            operation,
        }
    }
}
