// Escrow module - CUSTODY
// One custodial record per shipment, released on verified delivery or
// settled by a dispute resolver

pub mod fees;
mod model;
mod port;
mod service;
mod sweeper;

pub use model::{
    CodeKind, CodeRecord, CreateEscrowArgs, DisputeRecord, Escrow, EscrowId, EscrowStatus,
    QrVerification,
};
pub use port::{EscrowPort, OperatorEscrow};
pub use service::{EscrowConfig, EscrowError, EscrowService, EscrowStats};
pub use sweeper::AutoReleaseSweeper;
