//! Token amount scaling
//!
//! Human amounts are decimals; the ledger counts integer base units with
//! 18 decimal places. Oracle stakes are fractions sent as whole percents.
//! Every conversion between the two goes through this module.

use rust_decimal::{prelude::ToPrimitive, Decimal};

use crate::{error::EscrowError, EscrowResult};

/// Decimal places of the payment token
pub const TOKEN_DECIMALS: u32 = 18;

/// Multiplier turning a stake fraction into a percent
pub const STAKE_SCALE: u8 = 100;

fn unit_scale() -> Decimal {
    Decimal::new(1_000_000_000_000_000_000, 0)
}

/// Convert a token amount into ledger base units
///
/// Rejects negative amounts and amounts finer than one base unit.
pub fn to_base_units(amount: Decimal) -> EscrowResult<u128> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(EscrowError::amount(format!("negative amount {}", amount)));
    }
    let scaled = amount
        .checked_mul(unit_scale())
        .ok_or_else(|| EscrowError::amount(format!("amount {} overflows", amount)))?;
    if !scaled.fract().is_zero() {
        return Err(EscrowError::amount(format!(
            "amount {} has more than {} decimal places",
            amount, TOKEN_DECIMALS
        )));
    }
    scaled
        .to_u128()
        .ok_or_else(|| EscrowError::amount(format!("amount {} out of range", amount)))
}

/// Convert ledger base units back into a token amount
pub fn from_base_units(units: u128) -> EscrowResult<Decimal> {
    let signed = i128::try_from(units)
        .map_err(|_| EscrowError::amount(format!("{} base units out of range", units)))?;
    Decimal::try_from_i128_with_scale(signed, TOKEN_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|e| EscrowError::amount(format!("{} base units: {}", units, e)))
}

/// Convert a stake fraction such as `0.05` into a percent (`5`)
pub fn stake_to_percent(stake: Decimal) -> EscrowResult<u8> {
    let percent = stake
        .checked_mul(Decimal::from(STAKE_SCALE))
        .ok_or_else(|| EscrowError::amount(format!("stake {} overflows", stake)))?;
    if !percent.fract().is_zero() {
        return Err(EscrowError::amount(format!(
            "stake {} is not a whole percent",
            stake
        )));
    }
    match percent.to_u8() {
        Some(p) if p <= STAKE_SCALE => Ok(p),
        _ => Err(EscrowError::amount(format!("stake {} outside [0, 1]", stake))),
    }
}

/// Sum base unit amounts, failing on overflow
pub fn checked_total(amounts: &[u128]) -> EscrowResult<u128> {
    amounts.iter().try_fold(0u128, |acc, a| {
        acc.checked_add(*a)
            .ok_or_else(|| EscrowError::amount("payout total overflows"))
    })
}
