//! Ledger records as seen by the comparison.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One transaction from either side of the comparison, keyed by the
/// provider's transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub transaction_id: String,
    /// Amount in the smallest currency unit.
    pub amount_cents: i64,
    pub status: String,
    pub occurred_at: DateTime<Utc>,
}

impl LedgerRecord {
    pub fn new(
        transaction_id: impl Into<String>,
        amount_cents: i64,
        status: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            amount_cents,
            status: status.into(),
            occurred_at,
        }
    }

    /// Status with case and surrounding whitespace ignored.
    pub fn normalized_status(&self) -> String {
        self.status.trim().to_ascii_uppercase()
    }

    pub(crate) fn describe(&self) -> String {
        format!("amount={}, status={}", self.amount_cents, self.status)
    }
}

/// Half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// The whole UTC calendar day.
    pub fn for_date(date: NaiveDate) -> Self {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        let end = date
            .checked_add_days(Days::new(1))
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or(start);
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_range_is_half_open() {
        let r = DateRange::for_date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert!(r.contains(Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()));
        assert!(r.contains(Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap()));
        assert!(!r.contains(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn status_normalization_ignores_case() {
        let r = LedgerRecord::new("t", 1, " success ", Utc::now());
        assert_eq!(r.normalized_status(), "SUCCESS");
    }
}
