//! Time-versioned per-token pricing.

use super::TokenUsage;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const BUILTIN_TABLE: &str = include_str!("../../config/model_costs.yaml");

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CostError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("no price for model '{model}' effective before {at}")]
    NoApplicableVersion { model: String, at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCostVersion {
    pub effective_from: NaiveDate,
    pub input_cost_per_token_cents: f64,
    pub output_cost_per_token_cents: f64,
}

impl ModelCostVersion {
    fn starts_at(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.effective_from.and_time(NaiveTime::MIN))
    }
}

/// Rates in effect for one model at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostRates {
    pub input: f64,
    pub output: f64,
    pub effective_from: NaiveDate,
}

impl CostRates {
    pub fn total(&self, usage: &TokenUsage) -> f64 {
        usage.prompt as f64 * self.input + usage.completion as f64 * self.output
    }
}

#[derive(Debug, Clone)]
pub struct CostCalculator {
    models: HashMap<String, Vec<ModelCostVersion>>,
}

impl CostCalculator {
    pub fn new(models: HashMap<String, Vec<ModelCostVersion>>) -> Self {
        let models = models
            .into_iter()
            .map(|(name, mut versions)| {
                versions.sort_by_key(|v| v.effective_from);
                (name.to_lowercase(), versions)
            })
            .collect();
        Self { models }
    }

    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_TABLE).context("Built-in cost table is malformed")
    }

    /// Parse a table from YAML (JSON is accepted as a YAML subset).
    pub fn from_yaml(content: &str) -> Result<Self> {
        let models: HashMap<String, Vec<ModelCostVersion>> =
            serde_yaml::from_str(content).context("Failed to parse cost table")?;
        Ok(Self::new(models))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cost table: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Latest rates whose effective date is strictly before `at`.
    pub fn cost(&self, model: &str, at: DateTime<Utc>) -> Result<CostRates, CostError> {
        let versions = self
            .models
            .get(&model.to_lowercase())
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))?;

        versions
            .iter()
            .rev()
            .find(|v| v.starts_at() < at)
            .map(|v| CostRates {
                input: v.input_cost_per_token_cents,
                output: v.output_cost_per_token_cents,
                effective_from: v.effective_from,
            })
            .ok_or_else(|| CostError::NoApplicableVersion {
                model: model.to_string(),
                at,
            })
    }

    /// Total cost of `usage` on `model` at `at`, in fractional cents.
    pub fn total(&self, model: &str, at: DateTime<Utc>, usage: &TokenUsage) -> Result<f64, CostError> {
        Ok(self.cost(model, at)?.total(usage))
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}
