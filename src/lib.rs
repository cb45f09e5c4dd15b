//! Escrow-backed freight marketplace.
//!
//! Three services share one sled store:
//!
//! - [`marketplace`]: shippers post loads, carriers bid, accepting a bid
//!   opens an escrow.
//! - [`escrow`]: custodial records released on verified delivery, with
//!   single-use pickup and delivery codes and dispute resolution.
//! - [`ledger`]: multi-asset balances, an append-only transaction log and
//!   multi-signature treasury withdrawals.
//!
//! [`platform::Platform`] wires them together.

pub mod access;
pub mod clock;
pub mod config;
pub mod error;
pub mod escrow;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod marketplace;
pub mod platform;
pub mod relay;
pub mod storage;

pub use error::{ErrorKind, ServiceError};
pub use platform::{Platform, PlatformError};
