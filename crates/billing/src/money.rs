//! Money and platform fee calculation
//!
//! All amounts are integer minor units (cents). Fee math never touches floating point.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Supported settlement currency. Multi-currency is out of scope; the enum exists so
/// amounts always carry their unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Some(Currency::Usd),
            _ => None,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An amount in minor units of a currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    pub minor_units: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(minor_units: i64, currency: Currency) -> Self {
        Self {
            minor_units,
            currency,
        }
    }

    pub fn usd(minor_units: i64) -> Self {
        Self::new(minor_units, Currency::Usd)
    }

    pub fn is_zero(&self) -> bool {
        self.minor_units == 0
    }
}

/// Platform fee as a whole percentage (0..=100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePercent(u8);

impl FeePercent {
    pub fn new(percent: u8) -> BillingResult<Self> {
        if percent > 100 {
            return Err(BillingError::InvalidAmount(format!(
                "fee percent {} exceeds 100",
                percent
            )));
        }
        Ok(Self(percent))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// 20%, the platform's standard cut
    pub const fn default_platform() -> Self {
        Self(20)
    }
}

/// How one charge is divided between the processor, the platform, and the creator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSplit {
    /// Amount submitted to the processor (the full price)
    pub processor_amount: Money,
    /// Withheld by the platform
    pub platform_fee: Money,
    /// Credited to the creator
    pub creator_net: Money,
}

/// Split a price into platform fee and creator net.
///
/// The fee is rounded half-up; the remainder goes to the creator so that
/// `platform_fee + creator_net == price` always holds.
pub fn split(price: Money, fee: FeePercent) -> BillingResult<FeeSplit> {
    if price.minor_units < 0 {
        return Err(BillingError::InvalidAmount(format!(
            "price must not be negative (got {})",
            price.minor_units
        )));
    }

    // i128 keeps price * 100 + 50 from overflowing for any i64 price
    let fee_minor = (i128::from(price.minor_units) * i128::from(fee.get()) + 50) / 100;
    let fee_minor = i64::try_from(fee_minor)
        .map_err(|_| BillingError::InvalidAmount("fee overflow".to_string()))?;

    Ok(FeeSplit {
        processor_amount: price,
        platform_fee: Money::new(fee_minor, price.currency),
        creator_net: Money::new(price.minor_units - fee_minor, price.currency),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_twenty_percent() {
        let s = split(Money::usd(1000), FeePercent::new(20).unwrap()).unwrap();
        assert_eq!(s.processor_amount.minor_units, 1000);
        assert_eq!(s.platform_fee.minor_units, 200);
        assert_eq!(s.creator_net.minor_units, 800);
    }

    #[test]
    fn test_split_rounds_half_up() {
        // 15% of 999 = 149.85 -> 150
        let s = split(Money::usd(999), FeePercent::new(15).unwrap()).unwrap();
        assert_eq!(s.platform_fee.minor_units, 150);
        assert_eq!(s.creator_net.minor_units, 849);

        // 10% of 5 = 0.5 -> 1
        let s = split(Money::usd(5), FeePercent::new(10).unwrap()).unwrap();
        assert_eq!(s.platform_fee.minor_units, 1);
        assert_eq!(s.creator_net.minor_units, 4);

        // 10% of 4 = 0.4 -> 0
        let s = split(Money::usd(4), FeePercent::new(10).unwrap()).unwrap();
        assert_eq!(s.platform_fee.minor_units, 0);
    }

    #[test]
    fn test_split_edges() {
        let zero = split(Money::usd(0), FeePercent::new(20).unwrap()).unwrap();
        assert!(zero.platform_fee.is_zero() && zero.creator_net.is_zero());

        let all = split(Money::usd(777), FeePercent::new(100).unwrap()).unwrap();
        assert_eq!(all.platform_fee.minor_units, 777);
        assert_eq!(all.creator_net.minor_units, 0);

        let none = split(Money::usd(777), FeePercent::new(0).unwrap()).unwrap();
        assert_eq!(none.creator_net.minor_units, 777);
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        assert!(FeePercent::new(101).is_err());
        assert!(split(Money::usd(-1), FeePercent::new(20).unwrap()).is_err());
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!(Currency::parse("usd"), Some(Currency::Usd));
        assert_eq!(Currency::parse("EUR"), None);
    }

    proptest! {
        #[test]
        fn fee_plus_net_equals_price(price in 0i64..=i64::MAX / 2, percent in 0u8..=100) {
            let s = split(Money::usd(price), FeePercent::new(percent).unwrap()).unwrap();
            prop_assert_eq!(s.platform_fee.minor_units + s.creator_net.minor_units, price);
            prop_assert!(s.platform_fee.minor_units >= 0);
            prop_assert!(s.creator_net.minor_units >= 0);
        }
    }
}
