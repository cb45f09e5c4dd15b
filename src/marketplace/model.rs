// Marketplace data model

use crate::escrow::EscrowId;
use crate::identity::Did;
use crate::marketplace::MarketError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(s: &str) -> Result<NaiveDate, MarketError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| MarketError::InvalidDate(format!("'{}': {}", s, e)))
}

// ============================================================================
// IDS
// ============================================================================

macro_rules! sequential_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            pub fn new(n: u64) -> Self {
                Self(n)
            }

            pub fn value(&self) -> u64 {
                self.0
            }

            pub(crate) fn key(&self) -> [u8; 8] {
                self.0.to_be_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{:06}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = MarketError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.strip_prefix(concat!($prefix, "-"))
                    .and_then(|n| n.parse::<u64>().ok())
                    .filter(|n| *n > 0)
                    .map(Self)
                    .ok_or_else(|| MarketError::InvalidInput(format!("bad {} id '{}'", $prefix, s)))
            }
        }
    };
}

sequential_id!(LoadId, "LOAD");
sequential_id!(BidId, "BID");

// ============================================================================
// LOAD
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadStatus {
    Posted,
    Bidding,
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Completed,
    Cancelled,
}

impl LoadStatus {
    pub const ALL: [LoadStatus; 8] = [
        LoadStatus::Posted,
        LoadStatus::Bidding,
        LoadStatus::Assigned,
        LoadStatus::PickedUp,
        LoadStatus::InTransit,
        LoadStatus::Delivered,
        LoadStatus::Completed,
        LoadStatus::Cancelled,
    ];

    /// Position along the forward path; `Cancelled` sits off it
    fn rank(&self) -> Option<u8> {
        match self {
            LoadStatus::Posted => Some(0),
            LoadStatus::Bidding => Some(1),
            LoadStatus::Assigned => Some(2),
            LoadStatus::PickedUp => Some(3),
            LoadStatus::InTransit => Some(4),
            LoadStatus::Delivered => Some(5),
            LoadStatus::Completed => Some(6),
            LoadStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadStatus::Completed | LoadStatus::Cancelled)
    }

    /// Open for bids
    pub fn is_open(&self) -> bool {
        matches!(self, LoadStatus::Posted | LoadStatus::Bidding)
    }

    /// Whether `update_load_status` may move a load from `self` to `next`.
    /// Statuses up to `Assigned` are set only by bidding and acceptance.
    pub fn can_update_to(&self, next: LoadStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            LoadStatus::Cancelled => true,
            LoadStatus::Posted | LoadStatus::Bidding | LoadStatus::Assigned => false,
            LoadStatus::Completed => *self == LoadStatus::Delivered,
            LoadStatus::PickedUp | LoadStatus::InTransit | LoadStatus::Delivered => {
                match (self.rank(), next.rank()) {
                    (Some(from), Some(to)) => from >= 2 && to > from,
                    _ => false,
                }
            }
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for LoadStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LoadStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| MarketError::InvalidInput(format!("unknown load status '{}'", s)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CargoType {
    DryVan,
    Refrigerated,
    Flatbed,
    Tanker,
    Container,
    Other(String),
}

impl FromStr for CargoType {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cargo = match s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "dryvan" => CargoType::DryVan,
            "refrigerated" | "reefer" => CargoType::Refrigerated,
            "flatbed" => CargoType::Flatbed,
            "tanker" => CargoType::Tanker,
            "container" => CargoType::Container,
            "" => return Err(MarketError::InvalidInput("empty cargo type".to_string())),
            _ => CargoType::Other(s.trim().to_string()),
        };
        Ok(cargo)
    }
}

/// A shipment listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub shipper: Did,
    pub origin: String,
    pub destination: String,
    pub pickup_date: NaiveDate,
    pub delivery_date: NaiveDate,
    /// Free text, e.g. "20,000 lbs"
    pub weight: String,
    pub cargo_type: CargoType,
    /// Asking rate in the escrow asset's smallest unit
    pub rate: u64,
    pub distance: String,
    pub description: String,
    pub status: LoadStatus,
    pub assigned_carrier: Option<Did>,
    pub accepted_bid: Option<BidId>,
    pub escrow_id: Option<EscrowId>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Load {
    pub fn involves(&self, did: &Did) -> bool {
        &self.shipper == did || self.assigned_carrier.as_ref() == Some(did)
    }
}

/// Arguments to `MarketplaceService::post_load`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostLoadArgs {
    pub origin: String,
    pub destination: String,
    pub pickup_date: String,
    pub delivery_date: String,
    pub weight: String,
    pub cargo_type: CargoType,
    pub rate: u64,
    pub distance: String,
    pub description: String,
}

impl PostLoadArgs {
    pub fn new(origin: &str, destination: &str, pickup_date: &str, delivery_date: &str, rate: u64) -> Self {
        Self {
            origin: origin.to_string(),
            destination: destination.to_string(),
            pickup_date: pickup_date.to_string(),
            delivery_date: delivery_date.to_string(),
            weight: String::new(),
            cargo_type: CargoType::DryVan,
            rate,
            distance: String::new(),
            description: String::new(),
        }
    }

    pub fn with_weight(mut self, weight: &str) -> Self {
        self.weight = weight.to_string();
        self
    }

    pub fn with_cargo_type(mut self, cargo_type: CargoType) -> Self {
        self.cargo_type = cargo_type;
        self
    }

    pub fn with_distance(mut self, distance: &str) -> Self {
        self.distance = distance.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

// ============================================================================
// BID
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidStatus {
    Open,
    Accepted,
    Rejected,
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A carrier's offer on a load. Only `status` changes after placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub load_id: LoadId,
    pub carrier: Did,
    pub amount: u64,
    pub message: String,
    /// Promised arrival, as given by the carrier
    pub eta: String,
    pub status: BidStatus,
    pub created_at: u64,
}
