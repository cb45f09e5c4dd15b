// Ledger module - BALANCES AND TREASURY
// Multi-asset balances, the append-only transaction log and
// multi-signature treasury withdrawals

mod model;
mod port;
mod service;

pub use model::{
    AccountId, AssetType, LedgerStats, PendingWithdrawal, Transaction, TransactionKind,
    TransferRequest, TreasuryBalance, TreasuryTotals, WithdrawalStatus,
};
pub use port::{CustodialLedger, LedgerPort};
pub use service::{LedgerConfig, LedgerError, LedgerService};
