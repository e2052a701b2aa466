//! Capital amount helpers
//!
//! Order sizing works in `Decimal` end to end; conversion to float only
//! happens at the venue boundary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Decimal places kept for capital amounts
pub const MONEY_SCALE: u32 = 8;

/// Size an order as a percentage of the running balance
///
/// # Safety
/// - Rejects negative balances and percentages
/// - Rounds to `MONEY_SCALE` places so persisted values are stable
pub fn position_size(running_balance: Decimal, pct: Decimal) -> anyhow::Result<Decimal> {
    if running_balance < Decimal::ZERO {
        return Err(anyhow::anyhow!(
            "Running balance cannot be negative: {}",
            running_balance
        ));
    }
    if pct < Decimal::ZERO {
        return Err(anyhow::anyhow!("Position percentage cannot be negative: {}", pct));
    }

    let size = running_balance * pct / Decimal::from(100);
    Ok(size.round_dp(MONEY_SCALE))
}

/// Convert an amount to `f64` for venues that take floating point sizes
pub fn to_venue_units(amount: Decimal) -> anyhow::Result<f64> {
    amount
        .to_f64()
        .ok_or_else(|| anyhow::anyhow!("Amount {} does not fit in f64", amount))
}

/// Parse a venue-reported amount back into a `Decimal`
pub fn from_venue_units(value: f64) -> anyhow::Result<Decimal> {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(MONEY_SCALE))
        .ok_or_else(|| anyhow::anyhow!("Venue amount {} is not a finite number", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_position_size() {
        let five = Decimal::from(5);
        assert_eq!(
            position_size(Decimal::from(300), five).unwrap(),
            Decimal::from(15)
        );
        assert_eq!(
            position_size(Decimal::from(285), five).unwrap(),
            Decimal::from_str("14.25").unwrap()
        );
        assert_eq!(
            position_size(Decimal::from_str("270.75").unwrap(), five).unwrap(),
            Decimal::from_str("13.5375").unwrap()
        );

        assert!(position_size(Decimal::from(-1), five).is_err());
        assert!(position_size(Decimal::from(100), Decimal::from(-5)).is_err());
    }

    #[test]
    fn test_venue_unit_conversion() {
        let amount = Decimal::from_str("14.25").unwrap();
        assert_eq!(to_venue_units(amount).unwrap(), 14.25);
        assert_eq!(from_venue_units(14.25).unwrap(), amount);
        assert!(from_venue_units(f64::NAN).is_err());
    }
}
