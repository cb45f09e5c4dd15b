// Platform fee arithmetic. Integer only, rounding down.

/// Upper bound on the configurable fee, 10%
pub const MAX_FEE_BPS: u16 = 1_000;

const BPS_DENOMINATOR: u128 = 10_000;

/// `floor(amount * fee_bps / 10000)`
pub fn platform_fee(amount: u64, fee_bps: u16) -> u64 {
    let fee = (amount as u128 * fee_bps.min(10_000) as u128) / BPS_DENOMINATOR;
    fee as u64
}
