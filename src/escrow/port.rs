// Escrow port - the narrow interface the marketplace drives escrows through

use crate::escrow::{CreateEscrowArgs, Escrow, EscrowError, EscrowId, EscrowService};
use crate::identity::Caller;
use crate::relay::{relay, RelayConfig};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EscrowPort: Send + Sync {
    /// Open an escrow; repeating identical arguments returns the same escrow
    async fn create_escrow(&self, args: CreateEscrowArgs) -> Result<Escrow, EscrowError>;

    async fn get_escrow(&self, id: &EscrowId) -> Result<Escrow, EscrowError>;

    /// Forward an in-transit status update
    async fn note_in_transit(&self, id: &EscrowId) -> Result<Escrow, EscrowError>;

    async fn cancel_escrow(&self, id: &EscrowId) -> Result<Escrow, EscrowError>;
}

/// Calls the in-process escrow service as the marketplace operator
pub struct OperatorEscrow {
    escrow: Arc<EscrowService>,
    operator: Caller,
    relay: RelayConfig,
}

impl OperatorEscrow {
    pub fn new(escrow: Arc<EscrowService>, operator: Caller, relay: RelayConfig) -> Self {
        Self {
            escrow,
            operator,
            relay,
        }
    }
}

#[async_trait]
impl EscrowPort for OperatorEscrow {
    async fn create_escrow(&self, args: CreateEscrowArgs) -> Result<Escrow, EscrowError> {
        relay(&self.relay, "escrow.create", || {
            self.escrow.create_escrow(&self.operator, args.clone())
        })
        .await
    }

    async fn get_escrow(&self, id: &EscrowId) -> Result<Escrow, EscrowError> {
        self.escrow.get_escrow(id)
    }

    async fn note_in_transit(&self, id: &EscrowId) -> Result<Escrow, EscrowError> {
        relay(&self.relay, "escrow.in_transit", || {
            self.escrow.mark_in_transit(&self.operator, id)
        })
        .await
    }

    async fn cancel_escrow(&self, id: &EscrowId) -> Result<Escrow, EscrowError> {
        relay(&self.relay, "escrow.cancel", || {
            self.escrow.cancel_escrow(&self.operator, id)
        })
        .await
    }
}
