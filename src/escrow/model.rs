// Escrow data model and status machine

use crate::escrow::EscrowError;
use crate::identity::Did;
use crate::ledger::{AccountId, AssetType};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ESCROW ID
// ============================================================================

/// Escrow identifier, `ESC-` followed by 12 hex digits
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EscrowId(String);

impl EscrowId {
    const PREFIX: &'static str = "ESC-";
    const HEX_LEN: usize = 12;

    pub(crate) fn generate(args: &CreateEscrowArgs, now: u64) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(args.load_id.as_bytes());
        hasher.update(args.shipper.to_string().as_bytes());
        hasher.update(args.carrier.to_string().as_bytes());
        hasher.update(args.amount.to_be_bytes());
        hasher.update(now.to_be_bytes());
        hasher.update(salt);
        let digest = hex::encode(hasher.finalize());

        Self(format!("{}{}", Self::PREFIX, &digest[..Self::HEX_LEN]))
    }

    pub fn parse(s: &str) -> Result<Self, EscrowError> {
        let hex_part = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| EscrowError::InvalidEscrowId(s.to_string()))?;
        if hex_part.len() != Self::HEX_LEN || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EscrowError::InvalidEscrowId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ledger sub-account holding this escrow's funds
    pub fn account(&self) -> AccountId {
        AccountId::Escrow(self.0.clone())
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EscrowId {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EscrowId::parse(s)
    }
}

// ============================================================================
// ESCROW STATUS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowStatus {
    Created,
    Funded,
    PickupConfirmed,
    InTransit,
    DeliveryConfirmed,
    Released,
    Disputed,
    Refunded,
    Cancelled,
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 9] = [
        EscrowStatus::Created,
        EscrowStatus::Funded,
        EscrowStatus::PickupConfirmed,
        EscrowStatus::InTransit,
        EscrowStatus::DeliveryConfirmed,
        EscrowStatus::Released,
        EscrowStatus::Disputed,
        EscrowStatus::Refunded,
        EscrowStatus::Cancelled,
    ];

    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        match self {
            Created => matches!(next, Funded | Cancelled),
            Funded => matches!(next, PickupConfirmed | Disputed | Cancelled),
            PickupConfirmed => matches!(next, InTransit | DeliveryConfirmed | Disputed),
            InTransit => matches!(next, DeliveryConfirmed | Disputed),
            DeliveryConfirmed => matches!(next, Released | Disputed),
            Disputed => matches!(next, Released | Refunded),
            Released | Refunded | Cancelled => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Cancelled
        )
    }

    /// Funds are held and the shipment is underway
    pub fn is_disputable(&self) -> bool {
        self.can_transition_to(EscrowStatus::Disputed)
    }

    /// Whether the escrow-held account carries the escrow amount
    pub fn holds_funds(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Funded
                | EscrowStatus::PickupConfirmed
                | EscrowStatus::InTransit
                | EscrowStatus::DeliveryConfirmed
                | EscrowStatus::Disputed
        )
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for EscrowStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EscrowStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| EscrowError::InvalidInput(format!("unknown escrow status '{}'", s)))
    }
}

// ============================================================================
// HANDOFF CODES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeKind {
    Pickup,
    Delivery,
}

impl CodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            CodeKind::Pickup => "PICKUP",
            CodeKind::Delivery => "DELIVERY",
        }
    }

    /// A fresh single-use code, `QR-<KIND>-<16 hex>`
    pub(crate) fn generate_code(&self, escrow_id: &EscrowId) -> String {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(escrow_id.as_str().as_bytes());
        hasher.update(self.label().as_bytes());
        hasher.update(salt);
        format!("QR-{}-{}", self.label(), &hex::encode(hasher.finalize())[..16])
    }
}

/// Proof that a handoff code was consumed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrVerification {
    pub code: String,
    pub escrow_id: EscrowId,
    pub kind: CodeKind,
    pub verified_by: Did,
    pub verified_at: u64,
    pub location: Option<String>,
}

/// A handoff code and, once consumed, its verification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub code: String,
    pub escrow_id: EscrowId,
    pub kind: CodeKind,
    pub verification: Option<QrVerification>,
}

impl CodeRecord {
    pub fn is_used(&self) -> bool {
        self.verification.is_some()
    }
}

// ============================================================================
// ESCROW
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub raised_by: Did,
    pub reason: String,
    pub raised_at: u64,
    pub status_when_raised: EscrowStatus,
    pub resolved_by: Option<Did>,
    pub resolved_at: Option<u64>,
    pub released_to_carrier: Option<bool>,
}

/// Custodial record for one shipment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub load_id: String,
    /// Collectible token attached to the shipment, if any
    pub reference_id: Option<String>,
    pub shipper: Did,
    pub carrier: Did,
    pub warehouse: Option<Did>,
    pub asset: AssetType,
    pub amount: u64,
    pub fee_bps: u16,
    pub platform_fee: u64,
    pub status: EscrowStatus,
    pub pickup_code: String,
    pub delivery_code: String,
    pub metadata: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub funded_at: Option<u64>,
    pub pickup_at: Option<u64>,
    pub delivery_at: Option<u64>,
    pub settled_at: Option<u64>,
    pub dispute: Option<DisputeRecord>,
    pub funding_tx: Option<u64>,
    pub settlement_txs: Vec<u64>,
}

impl Escrow {
    /// What the carrier receives on release
    pub fn carrier_amount(&self) -> u64 {
        self.amount - self.platform_fee
    }

    pub fn account(&self) -> AccountId {
        self.id.account()
    }

    pub fn involves(&self, did: &Did) -> bool {
        &self.shipper == did || &self.carrier == did || self.warehouse.as_ref() == Some(did)
    }

    pub(crate) fn transition(&mut self, next: EscrowStatus, now: u64) -> Result<(), EscrowError> {
        if !self.status.can_transition_to(next) {
            return Err(EscrowError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn reference(&self, step: &str) -> String {
        format!("escrow:{}:{}", self.id, step)
    }
}

/// Arguments to `EscrowService::create_escrow`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateEscrowArgs {
    pub load_id: String,
    pub shipper: Did,
    pub carrier: Did,
    pub warehouse: Option<Did>,
    pub amount: u64,
    pub metadata: Option<String>,
    pub reference_id: Option<String>,
}

impl CreateEscrowArgs {
    pub fn new(load_id: &str, shipper: Did, carrier: Did, amount: u64) -> Self {
        Self {
            load_id: load_id.to_string(),
            shipper,
            carrier,
            warehouse: None,
            amount,
            metadata: None,
            reference_id: None,
        }
    }

    pub fn with_warehouse(mut self, warehouse: Did) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    pub fn with_metadata(mut self, metadata: &str) -> Self {
        self.metadata = Some(metadata.to_string());
        self
    }

    pub fn with_reference_id(mut self, reference_id: &str) -> Self {
        self.reference_id = Some(reference_id.to_string());
        self
    }

    /// Whether an existing escrow was created from these same arguments
    pub(crate) fn same_terms(&self, escrow: &Escrow) -> bool {
        self.load_id == escrow.load_id
            && self.shipper == escrow.shipper
            && self.carrier == escrow.carrier
            && self.warehouse == escrow.warehouse
            && self.amount == escrow.amount
            && self.metadata == escrow.metadata
            && self.reference_id == escrow.reference_id
    }
}
