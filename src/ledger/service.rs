// Ledger service - balances, the transaction log and treasury withdrawals
//
// Every mutation runs under the service write lock and commits as a single
// sled transaction across the balance, log, reference and counter trees.

use crate::access::{AccessDenied, Capabilities};
use crate::clock::Clock;
use crate::error::{ErrorKind, ServiceError};
use crate::identity::Caller;
use crate::ledger::{
    AccountId, AssetType, LedgerStats, PendingWithdrawal, Transaction, TransactionKind,
    TransferRequest, TreasuryBalance, TreasuryTotals, WithdrawalStatus,
};
use crate::relay::RelayError;
use crate::storage::{abort, finish, tx_get, tx_next_id, tx_put, Store, StoreError, Table, TxResult};
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionalTree;
use sled::Transactional;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

mod trees {
    pub const BALANCES: &str = "ledger.balances";
    pub const TRANSACTIONS: &str = "ledger.transactions";
    pub const WITHDRAWALS: &str = "ledger.withdrawals";
    pub const REFERENCES: &str = "ledger.references";
    pub const TREASURY: &str = "ledger.treasury";
    pub const META: &str = "ledger.meta";
}

const NEXT_TRANSACTION: &[u8] = b"next_transaction_id";
const NEXT_WITHDRAWAL: &[u8] = b"next_withdrawal_id";
const WITHDRAWALS_PAUSED: &[u8] = b"withdrawals_paused";

// ============================================================================
// LEDGER CONFIG
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Distinct signer approvals needed before a withdrawal can execute
    pub required_approvals: u32,
    /// ICP the treasury keeps after any withdrawal, in e8s
    pub min_reserve: u64,
}

impl LedgerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required_approvals(mut self, approvals: u32) -> Self {
        self.required_approvals = approvals;
        self
    }

    pub fn with_min_reserve(mut self, reserve: u64) -> Self {
        self.min_reserve = reserve;
        self
    }

    /// The floor a withdrawal of `asset` may not take the treasury below
    pub fn reserve_for(&self, asset: AssetType) -> u64 {
        match asset {
            AssetType::Icp => self.min_reserve,
            _ => 0,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.required_approvals == 0 {
            return Err(LedgerError::InvalidConfig(
                "required_approvals must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            required_approvals: 1,
            min_reserve: 0,
        }
    }
}

// ============================================================================
// LEDGER ERROR
// ============================================================================

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("The treasury can only be debited by an executed withdrawal")]
    TreasuryDebit,

    #[error("Balance overflow on {0}")]
    BalanceOverflow(String),

    #[error("Insufficient balance in {account}: available {available}, required {required}")]
    InsufficientBalance {
        account: String,
        asset: AssetType,
        available: u64,
        required: u64,
    },

    #[error("Reference '{0}' was already used for a different transfer")]
    ReferenceConflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AccessDenied),

    #[error("Transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("Withdrawal {0} not found")]
    WithdrawalNotFound(u64),

    #[error("Withdrawal {id} is {status}")]
    InvalidWithdrawalState { id: u64, status: WithdrawalStatus },

    #[error("Withdrawal would take the {asset} treasury below its reserve of {reserve}")]
    BelowReserve { asset: AssetType, reserve: u64 },

    #[error("Treasury withdrawals are paused")]
    WithdrawalsPaused,

    #[error("Threshold not met: {approvals} of {required} approvals")]
    ThresholdNotMet { approvals: usize, required: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount
            | LedgerError::InvalidInput(_)
            | LedgerError::UnknownAsset(_)
            | LedgerError::BalanceOverflow(_)
            | LedgerError::ReferenceConflict(_)
            | LedgerError::InvalidConfig(_) => ErrorKind::InvalidInput,
            LedgerError::TreasuryDebit | LedgerError::Unauthorized(_) => ErrorKind::Unauthorized,
            LedgerError::InsufficientBalance { .. } | LedgerError::BelowReserve { .. } => {
                ErrorKind::InsufficientBalance
            }
            LedgerError::TransactionNotFound(_) | LedgerError::WithdrawalNotFound(_) => {
                ErrorKind::NotFound
            }
            LedgerError::InvalidWithdrawalState { .. } | LedgerError::WithdrawalsPaused => {
                ErrorKind::InvalidState
            }
            LedgerError::ThresholdNotMet { .. } => ErrorKind::ThresholdNotMet,
            LedgerError::Storage(_) | LedgerError::Relay(_) => ErrorKind::Storage,
        }
    }
}

impl ServiceError for LedgerError {
    fn kind(&self) -> ErrorKind {
        LedgerError::kind(self)
    }
}

// ============================================================================
// TRANSACTION HELPERS
// ============================================================================

fn read_balance(
    balances: &TransactionalTree,
    account: &AccountId,
    asset: AssetType,
) -> TxResult<u64, LedgerError> {
    Ok(tx_get::<u64, LedgerError>(balances, &account.balance_key(asset))?.unwrap_or(0))
}

fn credit(
    balances: &TransactionalTree,
    account: &AccountId,
    asset: AssetType,
    amount: u64,
) -> TxResult<(), LedgerError> {
    let current = read_balance(balances, account, asset)?;
    let Some(next) = current.checked_add(amount) else {
        return abort(LedgerError::BalanceOverflow(account.to_string()));
    };
    tx_put::<_, LedgerError>(balances, &account.balance_key(asset), &next)
}

fn debit(
    balances: &TransactionalTree,
    account: &AccountId,
    asset: AssetType,
    amount: u64,
) -> TxResult<(), LedgerError> {
    let available = read_balance(balances, account, asset)?;
    if available < amount {
        return abort(LedgerError::InsufficientBalance {
            account: account.to_string(),
            asset,
            available,
            required: amount,
        });
    }
    tx_put::<_, LedgerError>(balances, &account.balance_key(asset), &(available - amount))
}

/// Debit the treasury for a withdrawal, keeping the configured reserve
fn debit_treasury(
    balances: &TransactionalTree,
    asset: AssetType,
    amount: u64,
    reserve: u64,
) -> TxResult<(), LedgerError> {
    let available = read_balance(balances, &AccountId::Treasury, asset)?;
    if amount <= available && available - amount < reserve {
        return abort(LedgerError::BelowReserve { asset, reserve });
    }
    debit(balances, &AccountId::Treasury, asset, amount)
}

fn update_totals<F>(
    treasury: &TransactionalTree,
    asset: AssetType,
    update: F,
) -> TxResult<(), LedgerError>
where
    F: Fn(&mut TreasuryTotals),
{
    let key = asset.symbol().as_bytes();
    let mut totals: TreasuryTotals = tx_get::<TreasuryTotals, LedgerError>(treasury, key)?.unwrap_or_default();
    update(&mut totals);
    tx_put::<_, LedgerError>(treasury, key, &totals)
}

// ============================================================================
// LEDGER SERVICE
// ============================================================================

pub struct LedgerService {
    config: LedgerConfig,
    capabilities: Arc<Capabilities>,
    clock: Arc<dyn Clock>,
    balances: Table<u64>,
    transactions: Table<Transaction>,
    withdrawals: Table<PendingWithdrawal>,
    references: Table<u64>,
    treasury: Table<TreasuryTotals>,
    meta: Table<u64>,
    write_lock: Mutex<()>,
}

impl LedgerService {
    pub fn open(
        store: &Store,
        config: LedgerConfig,
        capabilities: Arc<Capabilities>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        if capabilities.signer_count() < config.required_approvals as usize {
            tracing::warn!(
                signers = capabilities.signer_count(),
                required = config.required_approvals,
                "fewer treasury signers than required approvals; withdrawals cannot execute"
            );
        }
        Ok(Self {
            config,
            capabilities,
            clock,
            balances: store.table(trees::BALANCES)?,
            transactions: store.table(trees::TRANSACTIONS)?,
            withdrawals: store.table(trees::WITHDRAWALS)?,
            references: store.table(trees::REFERENCES)?,
            treasury: store.table(trees::TREASURY)?,
            meta: store.table(trees::META)?,
            write_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // ========================================================================
    // DEPOSITS AND TRANSFERS
    // ========================================================================

    /// Record an external inflow into a user account or the treasury
    pub async fn deposit(
        &self,
        caller: &Caller,
        to: AccountId,
        asset: AssetType,
        amount: u64,
        memo: &str,
    ) -> Result<Transaction, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        // Users deposit for themselves; escrow accounts are only funded by transfer
        match &to {
            AccountId::User(did) => self.capabilities.operator_for(caller, did)?,
            AccountId::Escrow(_) => {
                return Err(LedgerError::InvalidInput(
                    "escrow-held accounts cannot receive deposits".to_string(),
                ))
            }
            AccountId::Treasury => {}
        }

        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();

        let tx = finish(
            (
                self.balances.tree(),
                self.transactions.tree(),
                self.treasury.tree(),
                self.meta.tree(),
            )
                .transaction(|(balances, transactions, treasury, meta)| {
                    credit(balances, &to, asset, amount)?;
                    if to.is_treasury() {
                        update_totals(treasury, asset, |t| {
                            t.deposited = t.deposited.saturating_add(amount)
                        })?;
                    }

                    let id = tx_next_id::<LedgerError>(meta, NEXT_TRANSACTION)?;
                    let tx = Transaction {
                        id,
                        kind: TransactionKind::Deposit,
                        asset,
                        amount,
                        from: None,
                        to: Some(to.clone()),
                        timestamp: now,
                        memo: memo.to_string(),
                        reference: None,
                    };
                    tx_put::<_, LedgerError>(transactions, &id.to_be_bytes(), &tx)?;
                    Ok(tx)
                }),
        )?;

        tracing::info!(tx = tx.id, account = %to, asset = %asset, amount, "deposit recorded");
        Ok(tx)
    }

    /// Move funds between accounts.
    ///
    /// Callers may move their own funds. Operators may debit escrow-held
    /// accounts and debit users on their behalf. A request whose reference
    /// was already applied returns the original transaction.
    pub async fn transfer(
        &self,
        caller: &Caller,
        request: TransferRequest,
    ) -> Result<Transaction, LedgerError> {
        if request.amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if request.from == request.to {
            return Err(LedgerError::InvalidInput(
                "source and destination are the same account".to_string(),
            ));
        }
        if !matches!(
            request.kind,
            TransactionKind::Transfer | TransactionKind::PlatformFee
        ) {
            return Err(LedgerError::InvalidInput(format!(
                "{:?} cannot be recorded through transfer",
                request.kind
            )));
        }
        // Fees only flow into the treasury
        if request.kind == TransactionKind::PlatformFee && !request.to.is_treasury() {
            return Err(LedgerError::InvalidInput(
                "platform fees must be paid to the treasury".to_string(),
            ));
        }
        if matches!(&request.reference, Some(r) if r.is_empty()) {
            return Err(LedgerError::InvalidInput("empty reference".to_string()));
        }
        // Authorize against the account being debited
        match &request.from {
            AccountId::User(did) => self.capabilities.operator_for(caller, did)?,
            AccountId::Escrow(_) => self.capabilities.operator(caller)?,
            AccountId::Treasury => return Err(LedgerError::TreasuryDebit),
        }

        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();

        let (tx, replayed) = finish(
            (
                self.balances.tree(),
                self.transactions.tree(),
                self.references.tree(),
                self.treasury.tree(),
                self.meta.tree(),
            )
                .transaction(|(balances, transactions, references, treasury, meta)| {
                    // Replay an already applied reference
                    if let Some(reference) = &request.reference {
                        if let Some(existing_id) =
                            tx_get::<u64, LedgerError>(references, reference.as_bytes())?
                        {
                            let Some(existing) = tx_get::<Transaction, LedgerError>(
                                transactions,
                                &existing_id.to_be_bytes(),
                            )?
                            else {
                                return abort(LedgerError::TransactionNotFound(existing_id));
                            };
                            if !request.matches(&existing) {
                                return abort(LedgerError::ReferenceConflict(reference.clone()));
                            }
                            return Ok((existing, true));
                        }
                    }

                    // Move the funds
                    debit(balances, &request.from, request.asset, request.amount)?;
                    credit(balances, &request.to, request.asset, request.amount)?;
                    if request.to.is_treasury() {
                        let amount = request.amount;
                        match request.kind {
                            TransactionKind::PlatformFee => {
                                update_totals(treasury, request.asset, |t| {
                                    t.fees_collected = t.fees_collected.saturating_add(amount)
                                })?
                            }
                            _ => update_totals(treasury, request.asset, |t| {
                                t.deposited = t.deposited.saturating_add(amount)
                            })?,
                        }
                    }

                    // Append to the log and index the reference
                    let id = tx_next_id::<LedgerError>(meta, NEXT_TRANSACTION)?;
                    let tx = Transaction {
                        id,
                        kind: request.kind,
                        asset: request.asset,
                        amount: request.amount,
                        from: Some(request.from.clone()),
                        to: Some(request.to.clone()),
                        timestamp: now,
                        memo: request.memo.clone(),
                        reference: request.reference.clone(),
                    };
                    tx_put::<_, LedgerError>(transactions, &id.to_be_bytes(), &tx)?;
                    if let Some(reference) = &request.reference {
                        tx_put::<_, LedgerError>(references, reference.as_bytes(), &id)?;
                    }
                    Ok((tx, false))
                }),
        )
        .inspect_err(|e| {
            tracing::debug!(from = %request.from, to = %request.to, error = %e, "transfer rejected")
        })?;

        if replayed {
            tracing::debug!(tx = tx.id, reference = ?tx.reference, "transfer replayed");
        } else {
            tracing::info!(
                tx = tx.id,
                from = %request.from,
                to = %request.to,
                asset = %request.asset,
                amount = request.amount,
                "transfer committed"
            );
        }
        Ok(tx)
    }

    // ========================================================================
    // WITHDRAWALS
    // ========================================================================

    pub async fn request_withdrawal(
        &self,
        caller: &Caller,
        asset: AssetType,
        amount: u64,
        destination: &str,
    ) -> Result<PendingWithdrawal, LedgerError> {
        self.capabilities.signer(caller)?;
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(LedgerError::InvalidInput(
                "destination must not be empty".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        self.ensure_withdrawals_open()?;
        let now = self.clock.now();
        let required_approvals = self.config.required_approvals;
        let reserve = self.config.reserve_for(asset);

        let withdrawal = finish(
            (self.balances.tree(), self.withdrawals.tree(), self.meta.tree()).transaction(
                |(balances, withdrawals, meta)| {
                    // Funds must be there now; execution checks again
                    let available = read_balance(balances, &AccountId::Treasury, asset)?;
                    if amount > available {
                        return abort(LedgerError::InsufficientBalance {
                            account: AccountId::Treasury.to_string(),
                            asset,
                            available,
                            required: amount,
                        });
                    }
                    if available - amount < reserve {
                        return abort(LedgerError::BelowReserve { asset, reserve });
                    }

                    let id = tx_next_id::<LedgerError>(meta, NEXT_WITHDRAWAL)?;
                    let withdrawal = PendingWithdrawal {
                        id,
                        asset,
                        amount,
                        destination: destination.to_string(),
                        requested_by: caller.did().clone(),
                        requested_at: now,
                        approvals: BTreeSet::new(),
                        required_approvals,
                        status: WithdrawalStatus::Pending,
                        rejection_reason: None,
                        executed_at: None,
                        transaction_id: None,
                    };
                    tx_put::<_, LedgerError>(withdrawals, &id.to_be_bytes(), &withdrawal)?;
                    Ok(withdrawal)
                },
            ),
        )?;

        tracing::info!(
            withdrawal = withdrawal.id,
            asset = %asset,
            amount,
            requested_by = %caller.did(),
            "withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// Add the caller's approval. Approving twice has no further effect.
    pub async fn approve_withdrawal(
        &self,
        caller: &Caller,
        id: u64,
    ) -> Result<PendingWithdrawal, LedgerError> {
        self.capabilities.signer(caller)?;
        let _guard = self.write_lock.lock().await;

        let mut withdrawal = self.load_withdrawal(id)?;
        if withdrawal.status.is_terminal() {
            return Err(LedgerError::InvalidWithdrawalState {
                id,
                status: withdrawal.status,
            });
        }

        if withdrawal.approvals.insert(caller.did().clone()) {
            if withdrawal.threshold_met() {
                withdrawal.status = WithdrawalStatus::Approved;
            }
            self.withdrawals.insert(&id.to_be_bytes(), &withdrawal)?;
            tracing::info!(
                withdrawal = id,
                approver = %caller.did(),
                approvals = withdrawal.approvals.len(),
                required = withdrawal.required_approvals,
                "withdrawal approved"
            );
        }
        Ok(withdrawal)
    }

    /// Debit the treasury for an approved withdrawal
    pub async fn execute_withdrawal(
        &self,
        caller: &Caller,
        id: u64,
    ) -> Result<PendingWithdrawal, LedgerError> {
        self.capabilities.signer(caller)?;
        let _guard = self.write_lock.lock().await;
        self.ensure_withdrawals_open()?;
        let now = self.clock.now();
        let config = &self.config;

        let withdrawal = finish(
            (
                self.balances.tree(),
                self.transactions.tree(),
                self.withdrawals.tree(),
                self.treasury.tree(),
                self.meta.tree(),
            )
                .transaction(|(balances, transactions, withdrawals, treasury, meta)| {
                    let Some(mut withdrawal) =
                        tx_get::<PendingWithdrawal, LedgerError>(withdrawals, &id.to_be_bytes())?
                    else {
                        return abort(LedgerError::WithdrawalNotFound(id));
                    };
                    if withdrawal.status.is_terminal() {
                        return abort(LedgerError::InvalidWithdrawalState {
                            id,
                            status: withdrawal.status,
                        });
                    }
                    // Execution re-checks the threshold and the balance
                    if withdrawal.status != WithdrawalStatus::Approved
                        || !withdrawal.threshold_met()
                    {
                        return abort(LedgerError::ThresholdNotMet {
                            approvals: withdrawal.approvals.len(),
                            required: withdrawal.required_approvals,
                        });
                    }

                    // Debit, log and mark executed together
                    let (asset, amount) = (withdrawal.asset, withdrawal.amount);
                    debit_treasury(balances, asset, amount, config.reserve_for(asset))?;
                    update_totals(treasury, asset, |t| {
                        t.withdrawn = t.withdrawn.saturating_add(amount)
                    })?;

                    let tx_id = tx_next_id::<LedgerError>(meta, NEXT_TRANSACTION)?;
                    let tx = Transaction {
                        id: tx_id,
                        kind: TransactionKind::Withdrawal,
                        asset,
                        amount,
                        from: Some(AccountId::Treasury),
                        to: None,
                        timestamp: now,
                        memo: format!("withdrawal {} to {}", id, withdrawal.destination),
                        reference: Some(format!("withdrawal:{}", id)),
                    };
                    tx_put::<_, LedgerError>(transactions, &tx_id.to_be_bytes(), &tx)?;

                    withdrawal.status = WithdrawalStatus::Executed;
                    withdrawal.executed_at = Some(now);
                    withdrawal.transaction_id = Some(tx_id);
                    tx_put::<_, LedgerError>(withdrawals, &id.to_be_bytes(), &withdrawal)?;
                    Ok(withdrawal)
                }),
        )?;

        tracing::info!(
            withdrawal = id,
            tx = ?withdrawal.transaction_id,
            asset = %withdrawal.asset,
            amount = withdrawal.amount,
            "withdrawal executed"
        );
        Ok(withdrawal)
    }

    /// Stop or restart treasury outflows. Requests already approved stay
    /// approved and execute once withdrawals resume.
    pub async fn set_withdrawals_paused(
        &self,
        caller: &Caller,
        paused: bool,
    ) -> Result<bool, LedgerError> {
        self.capabilities.admin(caller)?;
        let _guard = self.write_lock.lock().await;

        self.meta.insert(WITHDRAWALS_PAUSED, &u64::from(paused))?;

        if paused {
            tracing::warn!(by = %caller.did(), "treasury withdrawals paused");
        } else {
            tracing::info!(by = %caller.did(), "treasury withdrawals resumed");
        }
        Ok(paused)
    }

    pub fn withdrawals_paused(&self) -> Result<bool, LedgerError> {
        Ok(self.meta.get(WITHDRAWALS_PAUSED)?.unwrap_or(0) != 0)
    }

    fn ensure_withdrawals_open(&self) -> Result<(), LedgerError> {
        if self.withdrawals_paused()? {
            return Err(LedgerError::WithdrawalsPaused);
        }
        Ok(())
    }

    pub async fn reject_withdrawal(
        &self,
        caller: &Caller,
        id: u64,
        reason: &str,
    ) -> Result<PendingWithdrawal, LedgerError> {
        self.capabilities.signer(caller)?;
        if reason.trim().is_empty() {
            return Err(LedgerError::InvalidInput("reason must not be empty".to_string()));
        }
        let _guard = self.write_lock.lock().await;

        let mut withdrawal = self.load_withdrawal(id)?;
        if withdrawal.status.is_terminal() {
            return Err(LedgerError::InvalidWithdrawalState {
                id,
                status: withdrawal.status,
            });
        }
        withdrawal.status = WithdrawalStatus::Rejected;
        withdrawal.rejection_reason = Some(reason.trim().to_string());
        self.withdrawals.insert(&id.to_be_bytes(), &withdrawal)?;

        tracing::info!(withdrawal = id, by = %caller.did(), "withdrawal rejected");
        Ok(withdrawal)
    }

    /// Withdraw a request; only its requester may cancel it
    pub async fn cancel_withdrawal(
        &self,
        caller: &Caller,
        id: u64,
    ) -> Result<PendingWithdrawal, LedgerError> {
        let _guard = self.write_lock.lock().await;

        let mut withdrawal = self.load_withdrawal(id)?;
        if &withdrawal.requested_by != caller.did() {
            return Err(LedgerError::Unauthorized(AccessDenied {
                caller: caller.did().clone(),
                required: "requester",
            }));
        }
        if withdrawal.status.is_terminal() {
            return Err(LedgerError::InvalidWithdrawalState {
                id,
                status: withdrawal.status,
            });
        }
        withdrawal.status = WithdrawalStatus::Cancelled;
        self.withdrawals.insert(&id.to_be_bytes(), &withdrawal)?;

        tracing::info!(withdrawal = id, "withdrawal cancelled");
        Ok(withdrawal)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_balance(&self, account: &AccountId, asset: AssetType) -> Result<u64, LedgerError> {
        Ok(self.balances.get(&account.balance_key(asset))?.unwrap_or(0))
    }

    /// Non-zero balances of an account
    pub fn get_balances(&self, account: &AccountId) -> Result<Vec<(AssetType, u64)>, LedgerError> {
        let mut out = Vec::new();
        for asset in AssetType::ALL {
            let balance = self.get_balance(account, asset)?;
            if balance > 0 {
                out.push((asset, balance));
            }
        }
        Ok(out)
    }

    pub fn get_treasury_balance(&self) -> Result<Vec<TreasuryBalance>, LedgerError> {
        AssetType::ALL
            .into_iter()
            .map(|asset| {
                let totals = self
                    .treasury
                    .get(asset.symbol().as_bytes())?
                    .unwrap_or_default();
                Ok(TreasuryBalance {
                    asset,
                    balance: self.get_balance(&AccountId::Treasury, asset)?,
                    deposited: totals.deposited,
                    fees_collected: totals.fees_collected,
                    withdrawn: totals.withdrawn,
                })
            })
            .collect()
    }

    pub fn get_transaction(&self, id: u64) -> Result<Transaction, LedgerError> {
        self.transactions
            .get(&id.to_be_bytes())?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    /// Transactions in id order
    pub fn get_transactions(&self, offset: usize, limit: usize) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.transactions.page(offset, limit)?)
    }

    /// Transactions touching an account, in id order
    pub fn get_account_transactions(&self, account: &AccountId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.transactions.filter(|tx| {
            tx.from.as_ref() == Some(account) || tx.to.as_ref() == Some(account)
        })?)
    }

    /// The transaction recorded under an idempotency reference
    pub fn get_transaction_by_reference(&self, reference: &str) -> Result<Option<Transaction>, LedgerError> {
        match self.references.get(reference.as_bytes())? {
            Some(id) => Ok(Some(self.get_transaction(id)?)),
            None => Ok(None),
        }
    }

    pub fn get_withdrawal(&self, id: u64) -> Result<PendingWithdrawal, LedgerError> {
        self.load_withdrawal(id)
    }

    /// Withdrawals still awaiting approval or execution
    pub fn get_pending_withdrawals(&self) -> Result<Vec<PendingWithdrawal>, LedgerError> {
        Ok(self.withdrawals.filter(|w| !w.status.is_terminal())?)
    }

    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let mut stats = LedgerStats {
            transaction_count: self.transactions.len(),
            pending_withdrawals: self.get_pending_withdrawals()?.len(),
            withdrawals_paused: self.withdrawals_paused()?,
            ..Default::default()
        };
        for treasury in self.get_treasury_balance()? {
            if treasury.fees_collected > 0 {
                stats.fees_collected.insert(treasury.asset, treasury.fees_collected);
            }
            if treasury.withdrawn > 0 {
                stats.withdrawn.insert(treasury.asset, treasury.withdrawn);
            }
        }
        Ok(stats)
    }

    fn load_withdrawal(&self, id: u64) -> Result<PendingWithdrawal, LedgerError> {
        self.withdrawals
            .get(&id.to_be_bytes())?
            .ok_or(LedgerError::WithdrawalNotFound(id))
    }
}
