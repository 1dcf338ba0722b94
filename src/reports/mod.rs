//! Monthly cost reports built from call records.
//!
//! A report is keyed by `(user, month)` and carries totals plus breakdowns
//! by provider, project, prompt and day. See [`ReportService`] for the
//! cache / snapshot / recompute policy.

mod aggregator;

pub use aggregator::{MonthOutcome, ReportService};

/// Widest `[from, to]` range a single report request may cover.
pub const MAX_REPORT_MONTHS: u32 = 36;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to aggregate {month}: {source}")]
    Aggregation {
        month: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTotals {
    pub cost_cents: f64,
    pub calls: u64,
    pub tokens: u64,
    pub successful: u64,
    pub cached: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownEntry {
    pub id: i64,
    pub name: String,
    pub cost_cents: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyEntry {
    pub date: NaiveDate,
    pub cost_cents: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyCostReport {
    pub user_id: String,
    pub month: String,
    pub totals: ReportTotals,
    pub by_provider: Vec<BreakdownEntry>,
    pub by_project: Vec<BreakdownEntry>,
    pub by_prompt: Vec<BreakdownEntry>,
    pub by_day: Vec<DailyEntry>,
    pub generated_at: DateTime<Utc>,
}

/// A calendar month, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        // Month values are validated on construction.
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Half-open `[start, end)` UTC range covered by this month.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.from_utc_datetime(&self.first_day().and_time(chrono::NaiveTime::MIN));
        let end = Utc.from_utc_datetime(&self.next().first_day().and_time(chrono::NaiveTime::MIN));
        (start, end)
    }

    /// Number of months in `[from, to]`, or 0 when `from` is after `to`.
    pub fn span(from: Month, to: Month) -> u32 {
        let months = (i64::from(to.year) - i64::from(from.year)) * 12
            + i64::from(to.month)
            - i64::from(from.month)
            + 1;
        u32::try_from(months.max(0)).unwrap_or(u32::MAX)
    }

    /// Every month from `from` to `to`, inclusive.
    pub fn range(from: Month, to: Month) -> Vec<Month> {
        let mut months = Vec::new();
        let mut current = from;
        while current <= to {
            months.push(current);
            current = current.next();
        }
        months
    }
}

impl FromStr for Month {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let date = NaiveDate::parse_from_str(&format!("{}-01", s.trim()), "%Y-%m-%d")
            .map_err(|_| ReportError::InvalidArgument(format!("invalid month '{}', expected YYYY-MM", s)))?;
        Ok(Self {
            year: date.year(),
            month: date.month(),
        })
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}
