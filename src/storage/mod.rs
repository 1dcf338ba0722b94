pub mod memory;
pub mod sqlite;

use crate::reports::MonthlyCostReport;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The only webhook event the gateway emits.
pub const EVENT_PROMPT_FINISHED: &str = "onPromptFinished";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub public_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<i64>,
    #[serde(default)]
    pub legacy: LegacyProviderFields,
}

/// Inline provider settings that predate stored provider entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyProviderFields {
    #[serde(default)]
    pub openai_base_url: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default)]
    pub openai_model: String,
    #[serde(default)]
    pub gemini_api_key: String,
    #[serde(default)]
    pub gemini_model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: f32,
    #[serde(default)]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntity {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub endpoint: String,
    pub api_key: String,
    pub default_model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentRole {
    System,
    User,
    Assistant,
}

impl SegmentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSegment {
    pub role: SegmentRole,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: i64,
    pub public_id: String,
    pub project_id: i64,
    pub name: String,
    pub prompts: Vec<PromptSegment>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub debug: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl PromptTemplate {
    /// Declared variables that have no binding in `variables`.
    pub fn missing_variables(&self, variables: &BTreeMap<String, String>) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|v| !variables.contains_key(&v.name))
            .map(|v| v.name.as_str())
            .collect()
    }
}

/// Outcome of one invocation. Encoded as 0 (success) / 1 (failure) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    Success,
    Failure,
}

impl ResultCode {
    pub fn code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::Failure
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub prompt_id: i64,
    pub project_id: i64,
    /// `None` when the call ran on a descriptor synthesized from project fields.
    pub provider_id: Option<i64>,
    pub model: String,
    pub user_id: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: i64,
    pub result: ResultCode,
    pub cached: bool,
    pub cost_cents: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: i64,
    pub project_id: i64,
    pub url: String,
    pub event: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryAttempt {
    pub id: String,
    pub webhook_id: i64,
    pub trace_id: String,
    pub url: String,
    pub request_headers: String,
    pub request_body: String,
    pub response_headers: String,
    pub response_body: String,
    pub status_code: Option<u16>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub timed_out: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait Storage: Send + Sync + Clone {
    // Entity lookup
    async fn get_project(&self, id: i64) -> Result<Option<Project>>;
    async fn get_project_by_token(&self, token: &str) -> Result<Option<Project>>;
    async fn get_provider(&self, id: i64) -> Result<Option<ProviderEntity>>;
    async fn get_prompt(&self, id: i64) -> Result<Option<PromptTemplate>>;
    async fn get_prompt_by_public_id(&self, public_id: &str) -> Result<Option<PromptTemplate>>;

    // Metering
    async fn insert_call_record(&self, record: CallRecord) -> Result<()>;
    async fn list_call_records(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>>;

    // Cost report snapshots
    async fn get_cost_report(&self, user_id: &str, month: &str)
        -> Result<Option<MonthlyCostReport>>;
    async fn upsert_cost_report(&self, report: &MonthlyCostReport) -> Result<()>;

    // Webhooks & delivery ledger
    async fn list_enabled_webhooks(
        &self,
        project_id: i64,
        event: &str,
    ) -> Result<Vec<WebhookRegistration>>;
    async fn get_webhook(&self, id: i64) -> Result<Option<WebhookRegistration>>;
    async fn insert_webhook_delivery(&self, attempt: WebhookDeliveryAttempt) -> Result<()>;
    async fn list_webhook_deliveries(&self, webhook_id: i64) -> Result<Vec<WebhookDeliveryAttempt>>;
}
