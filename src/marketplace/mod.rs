// Marketplace module - LOADS AND BIDS
// Shippers post loads, carriers bid, acceptance opens an escrow

mod model;
mod service;

pub use model::{parse_date, Bid, BidId, BidStatus, CargoType, Load, LoadId, LoadStatus, PostLoadArgs};
pub use service::{MarketError, MarketStats, MarketplaceConfig, MarketplaceService};
