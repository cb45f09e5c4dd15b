// Ledger port - the narrow interface the escrow service moves money through

use crate::identity::Caller;
use crate::ledger::{LedgerError, LedgerService, Transaction, TransferRequest};
use crate::relay::{relay, RelayConfig};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait LedgerPort: Send + Sync {
    /// Apply a transfer. Requests carrying a reference must be safe to repeat.
    async fn transfer(&self, request: TransferRequest) -> Result<Transaction, LedgerError>;

    /// The transfer already applied under an idempotency reference, if any
    async fn find_transfer(&self, reference: &str) -> Result<Option<Transaction>, LedgerError>;
}

/// Calls the in-process ledger as the escrow custodian, through the relay
pub struct CustodialLedger {
    ledger: Arc<LedgerService>,
    custodian: Caller,
    relay: RelayConfig,
}

impl CustodialLedger {
    pub fn new(ledger: Arc<LedgerService>, custodian: Caller, relay: RelayConfig) -> Self {
        Self {
            ledger,
            custodian,
            relay,
        }
    }

    pub fn custodian(&self) -> &Caller {
        &self.custodian
    }
}

#[async_trait]
impl LedgerPort for CustodialLedger {
    async fn transfer(&self, request: TransferRequest) -> Result<Transaction, LedgerError> {
        relay(&self.relay, "ledger.transfer", || {
            self.ledger.transfer(&self.custodian, request.clone())
        })
        .await
    }

    async fn find_transfer(&self, reference: &str) -> Result<Option<Transaction>, LedgerError> {
        self.ledger.get_transaction_by_reference(reference)
    }
}
