//! Billing engine settings

use crate::error::{BillingError, BillingResult};
use crate::money::{Currency, FeePercent};
use time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub fee_percent: FeePercent,
    pub currency: Currency,
    /// Declined renewals tolerated before the subscription is canceled
    pub max_renewal_attempts: i32,
    /// Wait after a declined renewal before the scheduler charges again
    pub renewal_retry_interval: Duration,
    pub renewal_batch_size: i64,
    pub renewal_concurrency: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            fee_percent: FeePercent::default_platform(),
            currency: Currency::Usd,
            max_renewal_attempts: 4,
            renewal_retry_interval: Duration::hours(24),
            renewal_batch_size: 200,
            renewal_concurrency: 8,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let fee_percent = match std::env::var("PLATFORM_FEE_PERCENT") {
            Ok(v) => {
                let pct: u8 = v.parse().map_err(|_| {
                    BillingError::Config(format!("PLATFORM_FEE_PERCENT is not a percentage: {}", v))
                })?;
                FeePercent::new(pct).map_err(|e| BillingError::Config(e.to_string()))?
            }
            Err(_) => defaults.fee_percent,
        };

        let currency = match std::env::var("BILLING_CURRENCY") {
            Ok(v) => Currency::parse(&v)
                .ok_or_else(|| BillingError::Config(format!("unsupported currency {}", v)))?,
            Err(_) => defaults.currency,
        };

        let max_renewal_attempts = env_or("MAX_RENEWAL_ATTEMPTS", defaults.max_renewal_attempts)?;
        if max_renewal_attempts < 1 {
            return Err(BillingError::Config(
                "MAX_RENEWAL_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let retry_hours: i64 = env_or(
            "RENEWAL_RETRY_HOURS",
            defaults.renewal_retry_interval.whole_hours(),
        )?;
        if retry_hours < 0 {
            return Err(BillingError::Config(
                "RENEWAL_RETRY_HOURS must not be negative".to_string(),
            ));
        }

        Ok(Self {
            fee_percent,
            currency,
            max_renewal_attempts,
            renewal_retry_interval: Duration::hours(retry_hours),
            renewal_batch_size: env_or("RENEWAL_BATCH_SIZE", defaults.renewal_batch_size)?
                .max(1),
            renewal_concurrency: env_or("RENEWAL_CONCURRENCY", defaults.renewal_concurrency)?
                .max(1),
        })
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", name, v))),
        Err(_) => Ok(default),
    }
}
