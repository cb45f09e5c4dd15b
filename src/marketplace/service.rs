// Marketplace service - load postings, bidding and shipment status
//
// The marketplace never moves money. Accepting a bid opens an escrow
// through the escrow port; cancelling an assigned load cancels its escrow
// first. Either way the load only changes once the escrow call succeeded.

use crate::access::{Capabilities, IdentityVerifier};
use crate::clock::Clock;
use crate::error::{ErrorKind, ServiceError};
use crate::escrow::{CreateEscrowArgs, Escrow, EscrowError, EscrowPort};
use crate::identity::{Caller, Did};
use crate::marketplace::model::parse_date;
use crate::marketplace::{Bid, BidId, BidStatus, Load, LoadId, LoadStatus, PostLoadArgs};
use crate::storage::{finish, tx_next_id, tx_put, Store, StoreError, Table};
use serde::{Deserialize, Serialize};
use sled::Transactional;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

mod trees {
    pub const LOADS: &str = "market.loads";
    pub const BIDS: &str = "market.bids";
    pub const META: &str = "market.meta";
}

const NEXT_LOAD: &[u8] = b"next_load_id";
const NEXT_BID: &[u8] = b"next_bid_id";

// ============================================================================
// MARKETPLACE CONFIG
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    /// Upper bound on bids a single load accepts
    pub max_bids_per_load: usize,
    /// Reject bids from carriers the identity verifier does not vouch for
    pub require_verified_carriers: bool,
}

impl MarketplaceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_bids_per_load(mut self, max: usize) -> Self {
        self.max_bids_per_load = max;
        self
    }

    pub fn with_require_verified_carriers(mut self, required: bool) -> Self {
        self.require_verified_carriers = required;
        self
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.max_bids_per_load == 0 {
            return Err(MarketError::InvalidConfig(
                "max_bids_per_load must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            max_bids_per_load: 100,
            require_verified_carriers: true,
        }
    }
}

// ============================================================================
// MARKET ERROR
// ============================================================================

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid date {0}")]
    InvalidDate(String),

    #[error("Shippers cannot bid on their own loads")]
    OwnLoad,

    #[error("Carrier {0} has not passed identity verification")]
    NotVerified(Did),

    #[error("Load {0} not found")]
    LoadNotFound(LoadId),

    #[error("Bid {0} not found")]
    BidNotFound(BidId),

    #[error("Bid {bid} belongs to {actual}, not {expected}")]
    BidNotForLoad {
        bid: BidId,
        expected: LoadId,
        actual: LoadId,
    },

    #[error("Load {id} is {status} and not open for bidding")]
    LoadNotOpen { id: LoadId, status: LoadStatus },

    #[error("Load {0} has reached its bid limit")]
    BidLimitReached(LoadId),

    #[error("Bid {id} is already {status}")]
    BidNotOpen { id: BidId, status: BidStatus },

    #[error("Load status cannot change from {from} to {to}")]
    InvalidStatusChange { from: LoadStatus, to: LoadStatus },

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] crate::access::AccessDenied),

    #[error("Escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::InvalidAmount
            | MarketError::InvalidInput(_)
            | MarketError::InvalidDate(_)
            | MarketError::OwnLoad
            | MarketError::BidNotForLoad { .. }
            | MarketError::InvalidConfig(_) => ErrorKind::InvalidInput,
            MarketError::NotVerified(_) | MarketError::Unauthorized(_) => ErrorKind::Unauthorized,
            MarketError::LoadNotFound(_) | MarketError::BidNotFound(_) => ErrorKind::NotFound,
            MarketError::LoadNotOpen { .. }
            | MarketError::BidLimitReached(_)
            | MarketError::BidNotOpen { .. }
            | MarketError::InvalidStatusChange { .. } => ErrorKind::InvalidState,
            MarketError::Escrow(e) => e.kind(),
            MarketError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl ServiceError for MarketError {
    fn kind(&self) -> ErrorKind {
        MarketError::kind(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarketStats {
    pub total_loads: usize,
    pub open_loads: usize,
    pub total_bids: usize,
    pub by_status: BTreeMap<String, usize>,
}

// ============================================================================
// MARKETPLACE SERVICE
// ============================================================================

pub struct MarketplaceService {
    config: MarketplaceConfig,
    capabilities: Arc<Capabilities>,
    verifier: Arc<dyn IdentityVerifier>,
    escrow: Arc<dyn EscrowPort>,
    clock: Arc<dyn Clock>,
    loads: Table<Load>,
    bids: Table<Bid>,
    meta: Table<u64>,
    write_lock: Mutex<()>,
}

impl MarketplaceService {
    pub fn open(
        store: &Store,
        config: MarketplaceConfig,
        capabilities: Arc<Capabilities>,
        verifier: Arc<dyn IdentityVerifier>,
        escrow: Arc<dyn EscrowPort>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MarketError> {
        config.validate()?;
        Ok(Self {
            config,
            capabilities,
            verifier,
            escrow,
            clock,
            loads: store.table(trees::LOADS)?,
            bids: store.table(trees::BIDS)?,
            meta: store.table(trees::META)?,
            write_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &MarketplaceConfig {
        &self.config
    }

    // ========================================================================
    // POSTING AND BIDDING
    // ========================================================================

    pub async fn post_load(&self, caller: &Caller, args: PostLoadArgs) -> Result<Load, MarketError> {
        let origin = args.origin.trim();
        let destination = args.destination.trim();
        if origin.is_empty() || destination.is_empty() {
            return Err(MarketError::InvalidInput(
                "origin and destination are required".to_string(),
            ));
        }
        if args.rate == 0 {
            return Err(MarketError::InvalidAmount);
        }
        // Dates are YYYY-MM-DD and delivery cannot precede pickup
        let pickup_date = parse_date(&args.pickup_date)?;
        let delivery_date = parse_date(&args.delivery_date)?;
        if delivery_date < pickup_date {
            return Err(MarketError::InvalidDate(format!(
                "delivery {} is before pickup {}",
                delivery_date, pickup_date
            )));
        }

        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();

        let load = finish((self.loads.tree(), self.meta.tree()).transaction(|(loads, meta)| {
            let id = LoadId::new(tx_next_id::<MarketError>(meta, NEXT_LOAD)?);
            let load = Load {
                id,
                shipper: caller.did().clone(),
                origin: origin.to_string(),
                destination: destination.to_string(),
                pickup_date,
                delivery_date,
                weight: args.weight.clone(),
                cargo_type: args.cargo_type.clone(),
                rate: args.rate,
                distance: args.distance.clone(),
                description: args.description.clone(),
                status: LoadStatus::Posted,
                assigned_carrier: None,
                accepted_bid: None,
                escrow_id: None,
                created_at: now,
                updated_at: now,
            };
            tx_put::<_, MarketError>(loads, &id.key(), &load)?;
            Ok(load)
        }))?;

        tracing::info!(load = %load.id, shipper = %load.shipper, rate = load.rate, "load posted");
        Ok(load)
    }

    pub async fn place_bid(
        &self,
        caller: &Caller,
        load_id: LoadId,
        amount: u64,
        message: &str,
        eta: &str,
    ) -> Result<Bid, MarketError> {
        if amount == 0 {
            return Err(MarketError::InvalidAmount);
        }
        let _guard = self.write_lock.lock().await;

        let mut load = self.load(load_id)?;
        if !load.status.is_open() {
            return Err(MarketError::LoadNotOpen {
                id: load_id,
                status: load.status,
            });
        }
        if &load.shipper == caller.did() {
            return Err(MarketError::OwnLoad);
        }
        // Carrier must pass identity verification
        if self.config.require_verified_carriers && !self.verifier.is_verified(caller.did()) {
            tracing::warn!(carrier = %caller.did(), load = %load_id, "bid from unverified carrier rejected");
            return Err(MarketError::NotVerified(caller.did().clone()));
        }
        if self.bids_for(load_id)?.len() >= self.config.max_bids_per_load {
            return Err(MarketError::BidLimitReached(load_id));
        }

        // First bid opens the bidding
        let now = self.clock.now();
        if load.status == LoadStatus::Posted {
            load.status = LoadStatus::Bidding;
            load.updated_at = now;
        }

        let bid = finish(
            (self.loads.tree(), self.bids.tree(), self.meta.tree()).transaction(
                |(loads, bids, meta)| {
                    let id = BidId::new(tx_next_id::<MarketError>(meta, NEXT_BID)?);
                    let bid = Bid {
                        id,
                        load_id,
                        carrier: caller.did().clone(),
                        amount,
                        message: message.to_string(),
                        eta: eta.to_string(),
                        status: BidStatus::Open,
                        created_at: now,
                    };
                    tx_put::<_, MarketError>(bids, &id.key(), &bid)?;
                    tx_put::<_, MarketError>(loads, &load_id.key(), &load)?;
                    Ok(bid)
                },
            ),
        )?;

        tracing::info!(bid = %bid.id, load = %load_id, carrier = %bid.carrier, amount, "bid placed");
        Ok(bid)
    }

    /// Accept one bid: open its escrow, assign the carrier and reject every
    /// other open bid on the load
    pub async fn accept_bid(
        &self,
        caller: &Caller,
        load_id: LoadId,
        bid_id: BidId,
    ) -> Result<Load, MarketError> {
        let _guard = self.write_lock.lock().await;

        let mut load = self.load(load_id)?;
        self.capabilities.shipper_of(caller, &load.shipper)?;
        if !load.status.is_open() {
            return Err(MarketError::LoadNotOpen {
                id: load_id,
                status: load.status,
            });
        }

        // The bid must be open and belong to this load
        let mut bid = self
            .bids
            .get(&bid_id.key())?
            .ok_or(MarketError::BidNotFound(bid_id))?;
        if bid.load_id != load_id {
            return Err(MarketError::BidNotForLoad {
                bid: bid_id,
                expected: load_id,
                actual: bid.load_id,
            });
        }
        if bid.status != BidStatus::Open {
            return Err(MarketError::BidNotOpen {
                id: bid_id,
                status: bid.status,
            });
        }

        let args = CreateEscrowArgs::new(
            &load_id.to_string(),
            load.shipper.clone(),
            bid.carrier.clone(),
            bid.amount,
        )
        .with_metadata(&format!("{} -> {}", load.origin, load.destination));
        let escrow = self.open_escrow(&load, args).await.inspect_err(|e| {
            tracing::warn!(load = %load_id, bid = %bid_id, error = %e, "escrow creation failed, bid not accepted");
        })?;

        // Assign the carrier and close the bidding
        let now = self.clock.now();
        load.status = LoadStatus::Assigned;
        load.assigned_carrier = Some(bid.carrier.clone());
        load.accepted_bid = Some(bid_id);
        load.escrow_id = Some(escrow.id.clone());
        load.updated_at = now;
        bid.status = BidStatus::Accepted;

        let rejected: Vec<Bid> = self
            .bids_for(load_id)?
            .into_iter()
            .filter(|b| b.id != bid_id && b.status == BidStatus::Open)
            .map(|mut b| {
                b.status = BidStatus::Rejected;
                b
            })
            .collect();

        let written = finish((self.loads.tree(), self.bids.tree()).transaction(|(loads, bids)| {
            tx_put::<_, MarketError>(loads, &load_id.key(), &load)?;
            tx_put::<_, MarketError>(bids, &bid_id.key(), &bid)?;
            for other in &rejected {
                tx_put::<_, MarketError>(bids, &other.id.key(), other)?;
            }
            Ok(())
        }));
        if let Err(e) = written {
            // The load never pointed at this escrow; take it back
            if let Err(cancel_err) = self.escrow.cancel_escrow(&escrow.id).await {
                tracing::error!(load = %load_id, escrow = %escrow.id, error = %cancel_err, "orphaned escrow not cancelled");
            }
            return Err(e);
        }

        tracing::info!(
            load = %load_id,
            bid = %bid_id,
            carrier = %bid.carrier,
            escrow = %escrow.id,
            rejected = rejected.len(),
            "bid accepted"
        );
        Ok(load)
    }

    /// Create the escrow for an acceptance. An escrow left behind by an
    /// acceptance that never reached the load is cancelled first.
    async fn open_escrow(&self, load: &Load, args: CreateEscrowArgs) -> Result<Escrow, MarketError> {
        match self.escrow.create_escrow(args.clone()).await {
            Err(EscrowError::ActiveEscrowExists { escrow_id, .. }) if load.escrow_id.is_none() => {
                tracing::warn!(load = %load.id, escrow = %escrow_id, "cancelling orphaned escrow");
                self.escrow.cancel_escrow(&escrow_id).await?;
                Ok(self.escrow.create_escrow(args).await?)
            }
            result => Ok(result?),
        }
    }

    // ========================================================================
    // SHIPMENT STATUS
    // ========================================================================

    /// Advance a load along its lifecycle, or cancel it
    pub async fn update_load_status(
        &self,
        caller: &Caller,
        load_id: LoadId,
        new_status: LoadStatus,
    ) -> Result<Load, MarketError> {
        let _guard = self.write_lock.lock().await;

        let mut load = self.load(load_id)?;
        // Assigned carrier, shipper or admin
        if load.assigned_carrier.as_ref() != Some(caller.did()) {
            self.capabilities.shipper_of(caller, &load.shipper)?;
        }
        if !load.status.can_update_to(new_status) {
            tracing::debug!(load = %load_id, from = %load.status, to = %new_status, "status change rejected");
            return Err(MarketError::InvalidStatusChange {
                from: load.status,
                to: new_status,
            });
        }

        // Cancel the escrow before the load; a failure leaves both unchanged
        if new_status == LoadStatus::Cancelled {
            if let Some(escrow_id) = &load.escrow_id {
                let escrow = self.escrow.get_escrow(escrow_id).await?;
                if !escrow.status.is_terminal() {
                    self.escrow.cancel_escrow(escrow_id).await.inspect_err(|e| {
                        tracing::warn!(load = %load_id, escrow = %escrow_id, error = %e, "escrow cancel failed, load unchanged");
                    })?;
                }
            }
        }

        let previous = load.status;
        load.status = new_status;
        load.updated_at = self.clock.now();
        self.loads.insert(&load_id.key(), &load)?;

        // Best effort; the load update stands either way
        if new_status == LoadStatus::InTransit {
            if let Some(escrow_id) = &load.escrow_id {
                if let Err(e) = self.escrow.note_in_transit(escrow_id).await {
                    tracing::warn!(load = %load_id, escrow = %escrow_id, error = %e, "in-transit note not applied");
                }
            }
        }

        tracing::info!(load = %load_id, from = %previous, to = %new_status, by = %caller.did(), "load status updated");
        Ok(load)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_load(&self, id: LoadId) -> Result<Load, MarketError> {
        self.load(id)
    }

    /// Loads still accepting bids
    pub fn get_available_loads(&self) -> Result<Vec<Load>, MarketError> {
        Ok(self.loads.filter(|l| l.status.is_open())?)
    }

    pub fn get_bids_for_load(&self, id: LoadId) -> Result<Vec<Bid>, MarketError> {
        self.load(id)?;
        self.bids_for(id)
    }

    pub fn get_bid(&self, id: BidId) -> Result<Bid, MarketError> {
        self.bids
            .get(&id.key())?
            .ok_or(MarketError::BidNotFound(id))
    }

    /// Loads the DID shipped or was assigned to carry
    pub fn get_loads_for_party(&self, did: &Did) -> Result<Vec<Load>, MarketError> {
        Ok(self.loads.filter(|l| l.involves(did))?)
    }

    pub fn get_loads_by_status(&self, status: LoadStatus) -> Result<Vec<Load>, MarketError> {
        Ok(self.loads.filter(|l| l.status == status)?)
    }

    pub fn get_bids_by_carrier(&self, did: &Did) -> Result<Vec<Bid>, MarketError> {
        Ok(self.bids.filter(|b| &b.carrier == did)?)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.len()
    }

    pub fn stats(&self) -> Result<MarketStats, MarketError> {
        let mut stats = MarketStats {
            total_bids: self.bids.len(),
            ..Default::default()
        };
        for load in self.loads.values()? {
            stats.total_loads += 1;
            if load.status.is_open() {
                stats.open_loads += 1;
            }
            *stats.by_status.entry(load.status.to_string()).or_default() += 1;
        }
        Ok(stats)
    }

    fn load(&self, id: LoadId) -> Result<Load, MarketError> {
        self.loads.get(&id.key())?.ok_or(MarketError::LoadNotFound(id))
    }

    fn bids_for(&self, load_id: LoadId) -> Result<Vec<Bid>, MarketError> {
        Ok(self.bids.filter(|b| b.load_id == load_id)?)
    }
}
