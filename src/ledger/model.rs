// Ledger data model

use crate::identity::Did;
use crate::ledger::LedgerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ASSETS
// ============================================================================

/// Supported assets. Amounts are integers in the asset's smallest unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetType {
    Icp,
    CkBtc,
    CkEth,
    CkUsdc,
    CkUsdt,
}

impl AssetType {
    pub const ALL: [AssetType; 5] = [
        AssetType::Icp,
        AssetType::CkBtc,
        AssetType::CkEth,
        AssetType::CkUsdc,
        AssetType::CkUsdt,
    ];

    pub fn decimals(&self) -> u32 {
        match self {
            AssetType::Icp | AssetType::CkBtc => 8,
            AssetType::CkEth => 18,
            AssetType::CkUsdc | AssetType::CkUsdt => 6,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AssetType::Icp => "ICP",
            AssetType::CkBtc => "ckBTC",
            AssetType::CkEth => "ckETH",
            AssetType::CkUsdc => "ckUSDC",
            AssetType::CkUsdt => "ckUSDT",
        }
    }

    /// Render an amount in whole units, e.g. `12.50000000 ICP`
    pub fn format_amount(&self, amount: u64) -> String {
        let unit = 10u64.pow(self.decimals());
        format!(
            "{}.{:0width$} {}",
            amount / unit,
            amount % unit,
            self.symbol(),
            width = self.decimals() as usize
        )
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for AssetType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetType::ALL
            .into_iter()
            .find(|a| a.symbol().eq_ignore_ascii_case(s))
            .ok_or_else(|| LedgerError::UnknownAsset(s.to_string()))
    }
}

// ============================================================================
// ACCOUNTS
// ============================================================================

/// A balance holder
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccountId {
    User(Did),
    /// Custodial sub-account holding the funds of one escrow
    Escrow(String),
    Treasury,
}

impl AccountId {
    pub fn user(did: &Did) -> Self {
        AccountId::User(did.clone())
    }

    pub fn is_treasury(&self) -> bool {
        matches!(self, AccountId::Treasury)
    }

    pub(crate) fn balance_key(&self, asset: AssetType) -> Vec<u8> {
        format!("{}|{}", self, asset.symbol()).into_bytes()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountId::User(did) => write!(f, "{}", did),
            AccountId::Escrow(id) => write!(f, "escrow:{}", id),
            AccountId::Treasury => f.write_str("treasury"),
        }
    }
}

impl FromStr for AccountId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "treasury" {
            return Ok(AccountId::Treasury);
        }
        if let Some(id) = s.strip_prefix("escrow:") {
            if id.is_empty() {
                return Err(LedgerError::InvalidInput("empty escrow account".into()));
            }
            return Ok(AccountId::Escrow(id.to_string()));
        }
        Did::parse(s)
            .map(AccountId::User)
            .map_err(|e| LedgerError::InvalidInput(format!("bad account '{}': {}", s, e)))
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    PlatformFee,
    Transfer,
}

/// An immutable ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub kind: TransactionKind,
    pub asset: AssetType,
    pub amount: u64,
    pub from: Option<AccountId>,
    pub to: Option<AccountId>,
    pub timestamp: u64,
    pub memo: String,
    pub reference: Option<String>,
}

/// Arguments to `LedgerService::transfer`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub asset: AssetType,
    pub amount: u64,
    pub memo: String,
    pub reference: Option<String>,
    pub kind: TransactionKind,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, asset: AssetType, amount: u64) -> Self {
        Self {
            from,
            to,
            asset,
            amount,
            memo: String::new(),
            reference: None,
            kind: TransactionKind::Transfer,
        }
    }

    pub fn with_memo(mut self, memo: &str) -> Self {
        self.memo = memo.to_string();
        self
    }

    /// Idempotency reference; a replay with the same reference returns the
    /// original transaction instead of moving funds again
    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    /// Record the transfer as platform fee income
    pub fn as_platform_fee(mut self) -> Self {
        self.kind = TransactionKind::PlatformFee;
        self
    }

    pub(crate) fn matches(&self, tx: &Transaction) -> bool {
        tx.kind == self.kind
            && tx.asset == self.asset
            && tx.amount == self.amount
            && tx.from.as_ref() == Some(&self.from)
            && tx.to.as_ref() == Some(&self.to)
    }
}

// ============================================================================
// WITHDRAWALS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Executed,
    Rejected,
    Cancelled,
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            WithdrawalStatus::Pending | WithdrawalStatus::Approved => false,
            WithdrawalStatus::Executed
            | WithdrawalStatus::Rejected
            | WithdrawalStatus::Cancelled => true,
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A treasury outflow awaiting multi-signature approval
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub id: u64,
    pub asset: AssetType,
    pub amount: u64,
    pub destination: String,
    pub requested_by: Did,
    pub requested_at: u64,
    pub approvals: BTreeSet<Did>,
    pub required_approvals: u32,
    pub status: WithdrawalStatus,
    pub rejection_reason: Option<String>,
    pub executed_at: Option<u64>,
    pub transaction_id: Option<u64>,
}

impl PendingWithdrawal {
    pub fn threshold_met(&self) -> bool {
        self.approvals.len() >= self.required_approvals as usize
    }
}

// ============================================================================
// TREASURY
// ============================================================================

/// Running treasury totals for one asset
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryTotals {
    pub deposited: u64,
    pub fees_collected: u64,
    pub withdrawn: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreasuryBalance {
    pub asset: AssetType,
    pub balance: u64,
    pub deposited: u64,
    pub fees_collected: u64,
    pub withdrawn: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub transaction_count: usize,
    pub pending_withdrawals: usize,
    pub withdrawals_paused: bool,
    pub fees_collected: BTreeMap<AssetType, u64>,
    pub withdrawn: BTreeMap<AssetType, u64>,
}
