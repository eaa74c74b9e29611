//! Time source and billing period arithmetic

use std::sync::Mutex;

use time::{Date, Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Same instant one calendar month later, clamped to the last day of the target month
/// (Jan 31 -> Feb 28/29).
pub fn one_month_after(at: OffsetDateTime) -> BillingResult<OffsetDateTime> {
    let date = at.date();
    let month = date.month();
    let next = month.next();
    let year = if next == time::Month::January {
        date.year() + 1
    } else {
        date.year()
    };
    let day = date.day().min(time::util::days_in_year_month(year, next));
    let next_date = Date::from_calendar_date(year, next, day)
        .map_err(|e| BillingError::Internal(format!("period arithmetic: {}", e)))?;
    Ok(at.replace_date(next_date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_one_month_after() {
        assert_eq!(
            one_month_after(datetime!(2026-03-15 10:00 UTC)).unwrap(),
            datetime!(2026-04-15 10:00 UTC)
        );
        assert_eq!(
            one_month_after(datetime!(2026-12-31 23:59 UTC)).unwrap(),
            datetime!(2027-01-31 23:59 UTC)
        );
    }

    #[test]
    fn test_one_month_after_clamps_short_months() {
        assert_eq!(
            one_month_after(datetime!(2026-01-31 08:00 UTC)).unwrap(),
            datetime!(2026-02-28 08:00 UTC)
        );
        assert_eq!(
            one_month_after(datetime!(2028-01-30 08:00 UTC)).unwrap(),
            datetime!(2028-02-29 08:00 UTC)
        );
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(datetime!(2026-01-01 00:00 UTC));
        clock.advance(Duration::days(10));
        assert_eq!(clock.now(), datetime!(2026-01-11 00:00 UTC));
        clock.set(datetime!(2026-02-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2026-02-01 00:00 UTC));
    }
}
