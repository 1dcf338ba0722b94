use super::{
    BreakdownEntry, DailyEntry, Month, MonthlyCostReport, ReportError, ReportTotals,
    MAX_REPORT_MONTHS,
};
use crate::cache::CacheService;
use crate::storage::{CallRecord, Storage};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const CACHE_PREFIX: &str = "report";
const INLINE_PROVIDER_LABEL: &str = "Inline project provider";

/// Per-month result of [`ReportService::reports_with_status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthOutcome {
    pub month: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<MonthlyCostReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct Bucket {
    cost_cents: f64,
    count: u64,
}

impl Bucket {
    fn add(&mut self, record: &CallRecord) {
        self.cost_cents += record.cost_cents;
        self.count += 1;
    }
}

/// Rolls call records into monthly reports.
///
/// The current month is always recomputed. Earlier months are served from
/// the cache, then from the persisted snapshot, and only recomputed when
/// both miss; a recomputed month is written back to both.
#[derive(Clone)]
pub struct ReportService<S: Storage> {
    storage: S,
    cache: Arc<dyn CacheService>,
    ttl: Duration,
}

impl<S: Storage> ReportService<S> {
    pub fn new(storage: S, cache: Arc<dyn CacheService>, ttl: Duration) -> Self {
        Self {
            storage,
            cache,
            ttl,
        }
    }

    /// Reports for every month in `[from, to]`. Months that fail are logged
    /// and left out. Ranges wider than [`MAX_REPORT_MONTHS`] are rejected.
    pub async fn reports(
        &self,
        user_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<MonthlyCostReport>, ReportError> {
        Ok(self
            .reports_with_status(user_id, from, to)
            .await?
            .into_iter()
            .filter_map(|outcome| outcome.report)
            .collect())
    }

    pub async fn reports_with_status(
        &self,
        user_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<MonthOutcome>, ReportError> {
        self.reports_with_status_at(user_id, from, to, Utc::now()).await
    }

    pub async fn reports_with_status_at(
        &self,
        user_id: &str,
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<MonthOutcome>, ReportError> {
        let from: Month = from.parse()?;
        let to: Month = to.parse()?;
        if from > to {
            return Err(ReportError::InvalidArgument(format!(
                "range start {} is after end {}",
                from, to
            )));
        }
        if Month::span(from, to) > MAX_REPORT_MONTHS {
            return Err(ReportError::InvalidArgument(format!(
                "range {} to {} spans more than {} months",
                from, to, MAX_REPORT_MONTHS
            )));
        }

        let current = Month::containing(now);
        let mut outcomes = Vec::new();
        for month in Month::range(from, to) {
            let outcome = match self.month_report(user_id, month, current, now).await {
                Ok(report) => MonthOutcome {
                    month: month.to_string(),
                    report: Some(report),
                    error: None,
                },
                Err(source) => {
                    let error = ReportError::Aggregation {
                        month: month.to_string(),
                        source,
                    };
                    tracing::error!(user_id, month = %month, "Cost report failed: {}", error);
                    MonthOutcome {
                        month: month.to_string(),
                        report: None,
                        error: Some(error.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn month_report(
        &self,
        user_id: &str,
        month: Month,
        current: Month,
        now: DateTime<Utc>,
    ) -> Result<MonthlyCostReport> {
        // Only closed months are stable enough to keep.
        if month >= current {
            return self.aggregate(user_id, month, now).await;
        }

        let key = format!("{}:{}:{}", CACHE_PREFIX, user_id, month);
        match self.cache.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<MonthlyCostReport>(value) {
                Ok(report) => return Ok(report),
                Err(e) => {
                    tracing::warn!("Discarding undecodable cached report {}: {}", key, e);
                    if let Err(e) = self.cache.delete(&key).await {
                        tracing::warn!("Failed to drop cached report {}: {:#}", key, e);
                    }
                }
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Report cache read failed for {}: {:#}", key, e),
        }

        match self.storage.get_cost_report(user_id, &month.to_string()).await {
            Ok(Some(report)) => {
                self.cache_report(&key, &report).await;
                return Ok(report);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Report snapshot read failed for {}: {:#}", key, e),
        }

        let report = self.aggregate(user_id, month, now).await?;
        self.cache_report(&key, &report).await;
        if let Err(e) = self.storage.upsert_cost_report(&report).await {
            tracing::warn!("Failed to persist cost report {}: {:#}", key, e);
        }
        Ok(report)
    }

    async fn cache_report(&self, key: &str, report: &MonthlyCostReport) {
        let value = match serde_json::to_value(report) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to encode report {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.cache.set(key, value, self.ttl).await {
            tracing::warn!("Report cache write failed for {}: {:#}", key, e);
        }
    }

    /// Compute a month's report from call records.
    pub async fn aggregate(
        &self,
        user_id: &str,
        month: Month,
        now: DateTime<Utc>,
    ) -> Result<MonthlyCostReport> {
        let (start, end) = month.bounds();
        let records = self.storage.list_call_records(user_id, start, end).await?;
        tracing::debug!(
            user_id,
            month = %month,
            records = records.len(),
            "Aggregating cost report"
        );

        let mut totals = ReportTotals::default();
        let mut providers: BTreeMap<i64, Bucket> = BTreeMap::new();
        let mut projects: BTreeMap<i64, Bucket> = BTreeMap::new();
        let mut prompts: BTreeMap<i64, Bucket> = BTreeMap::new();
        let mut days: BTreeMap<NaiveDate, Bucket> = BTreeMap::new();

        for record in &records {
            totals.cost_cents += record.cost_cents;
            totals.calls += 1;
            totals.tokens += u64::from(record.total_tokens);
            if record.result.is_success() {
                totals.successful += 1;
            }
            if record.cached {
                totals.cached += 1;
            }

            providers
                .entry(record.provider_id.unwrap_or(0))
                .or_default()
                .add(record);
            projects.entry(record.project_id).or_default().add(record);
            prompts.entry(record.prompt_id).or_default().add(record);
            days.entry(record.created_at.date_naive()).or_default().add(record);
        }

        let mut by_provider = Vec::with_capacity(providers.len());
        for (id, bucket) in providers {
            by_provider.push(entry(id, self.provider_name(id).await, bucket));
        }
        let mut by_project = Vec::with_capacity(projects.len());
        for (id, bucket) in projects {
            by_project.push(entry(id, self.project_name(id).await, bucket));
        }
        let mut by_prompt = Vec::with_capacity(prompts.len());
        for (id, bucket) in prompts {
            by_prompt.push(entry(id, self.prompt_name(id).await, bucket));
        }
        for list in [&mut by_provider, &mut by_project, &mut by_prompt] {
            list.sort_by(by_cost_desc);
        }

        let by_day = days
            .into_iter()
            .map(|(date, bucket)| DailyEntry {
                date,
                cost_cents: bucket.cost_cents,
                count: bucket.count,
            })
            .collect();

        Ok(MonthlyCostReport {
            user_id: user_id.to_string(),
            month: month.to_string(),
            totals,
            by_provider,
            by_project,
            by_prompt,
            by_day,
            generated_at: now,
        })
    }

    async fn provider_name(&self, id: i64) -> String {
        if id == 0 {
            return INLINE_PROVIDER_LABEL.to_string();
        }
        match self.storage.get_provider(id).await {
            Ok(Some(provider)) => provider.name,
            Ok(None) => format!("Provider {}", id),
            Err(e) => {
                tracing::debug!("Provider lookup failed for {}: {:#}", id, e);
                format!("Provider {}", id)
            }
        }
    }

    async fn project_name(&self, id: i64) -> String {
        match self.storage.get_project(id).await {
            Ok(Some(project)) => project.name,
            Ok(None) => format!("Project {}", id),
            Err(e) => {
                tracing::debug!("Project lookup failed for {}: {:#}", id, e);
                format!("Project {}", id)
            }
        }
    }

    async fn prompt_name(&self, id: i64) -> String {
        match self.storage.get_prompt(id).await {
            Ok(Some(prompt)) => prompt.name,
            Ok(None) => format!("Prompt {}", id),
            Err(e) => {
                tracing::debug!("Prompt lookup failed for {}: {:#}", id, e);
                format!("Prompt {}", id)
            }
        }
    }
}

fn entry(id: i64, name: String, bucket: Bucket) -> BreakdownEntry {
    BreakdownEntry {
        id,
        name,
        cost_cents: bucket.cost_cents,
        count: bucket.count,
    }
}

fn by_cost_desc(a: &BreakdownEntry, b: &BreakdownEntry) -> Ordering {
    b.cost_cents
        .partial_cmp(&a.cost_cents)
        .unwrap_or(Ordering::Equal)
        .then(a.id.cmp(&b.id))
}
