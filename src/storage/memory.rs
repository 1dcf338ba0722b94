//! In-process storage, used for embedding the gateway without a database and
//! as the fake behind the test suites.

use super::{
    CallRecord, Project, PromptTemplate, ProviderEntity, Storage, WebhookDeliveryAttempt,
    WebhookRegistration,
};
use crate::reports::MonthlyCostReport;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    projects: HashMap<i64, Project>,
    providers: HashMap<i64, ProviderEntity>,
    prompts: HashMap<i64, PromptTemplate>,
    webhooks: Vec<WebhookRegistration>,
    call_records: Vec<CallRecord>,
    reports: HashMap<(String, String), MonthlyCostReport>,
    deliveries: Vec<WebhookDeliveryAttempt>,
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
    record_queries: Arc<AtomicUsize>,
    fail_record_queries: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_project(&self, project: Project) {
        self.tables.write().await.projects.insert(project.id, project);
    }

    pub async fn insert_provider(&self, provider: ProviderEntity) {
        self.tables
            .write()
            .await
            .providers
            .insert(provider.id, provider);
    }

    pub async fn remove_provider(&self, id: i64) {
        self.tables.write().await.providers.remove(&id);
    }

    pub async fn insert_prompt(&self, prompt: PromptTemplate) {
        self.tables.write().await.prompts.insert(prompt.id, prompt);
    }

    pub async fn insert_webhook(&self, webhook: WebhookRegistration) {
        self.tables.write().await.webhooks.push(webhook);
    }

    /// Snapshot of every call record written so far.
    pub async fn call_records(&self) -> Vec<CallRecord> {
        self.tables.read().await.call_records.clone()
    }

    /// Snapshot of the whole delivery ledger.
    pub async fn deliveries(&self) -> Vec<WebhookDeliveryAttempt> {
        self.tables.read().await.deliveries.clone()
    }

    /// Number of times call records were queried (i.e. reports recomputed).
    pub fn record_query_count(&self) -> usize {
        self.record_queries.load(Ordering::SeqCst)
    }

    /// Make `list_call_records` fail, to exercise degraded paths.
    pub fn fail_record_queries(&self, fail: bool) {
        self.fail_record_queries.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        Ok(self.tables.read().await.projects.get(&id).cloned())
    }

    async fn get_project_by_token(&self, token: &str) -> Result<Option<Project>> {
        Ok(self
            .tables
            .read()
            .await
            .projects
            .values()
            .find(|p| p.public_token == token)
            .cloned())
    }

    async fn get_provider(&self, id: i64) -> Result<Option<ProviderEntity>> {
        Ok(self.tables.read().await.providers.get(&id).cloned())
    }

    async fn get_prompt(&self, id: i64) -> Result<Option<PromptTemplate>> {
        Ok(self.tables.read().await.prompts.get(&id).cloned())
    }

    async fn get_prompt_by_public_id(&self, public_id: &str) -> Result<Option<PromptTemplate>> {
        Ok(self
            .tables
            .read()
            .await
            .prompts
            .values()
            .find(|p| p.public_id == public_id)
            .cloned())
    }

    async fn insert_call_record(&self, record: CallRecord) -> Result<()> {
        self.tables.write().await.call_records.push(record);
        Ok(())
    }

    async fn list_call_records(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>> {
        self.record_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_record_queries.load(Ordering::SeqCst) {
            anyhow::bail!("call record store unavailable");
        }

        Ok(self
            .tables
            .read()
            .await
            .call_records
            .iter()
            .filter(|r| r.user_id == user_id && r.created_at >= from && r.created_at < to)
            .cloned()
            .collect())
    }

    async fn get_cost_report(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<Option<MonthlyCostReport>> {
        Ok(self
            .tables
            .read()
            .await
            .reports
            .get(&(user_id.to_string(), month.to_string()))
            .cloned())
    }

    async fn upsert_cost_report(&self, report: &MonthlyCostReport) -> Result<()> {
        self.tables
            .write()
            .await
            .reports
            .insert((report.user_id.clone(), report.month.clone()), report.clone());
        Ok(())
    }

    async fn list_enabled_webhooks(
        &self,
        project_id: i64,
        event: &str,
    ) -> Result<Vec<WebhookRegistration>> {
        Ok(self
            .tables
            .read()
            .await
            .webhooks
            .iter()
            .filter(|w| w.project_id == project_id && w.event == event && w.enabled)
            .cloned()
            .collect())
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<WebhookRegistration>> {
        Ok(self
            .tables
            .read()
            .await
            .webhooks
            .iter()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn insert_webhook_delivery(&self, attempt: WebhookDeliveryAttempt) -> Result<()> {
        self.tables.write().await.deliveries.push(attempt);
        Ok(())
    }

    async fn list_webhook_deliveries(&self, webhook_id: i64) -> Result<Vec<WebhookDeliveryAttempt>> {
        Ok(self
            .tables
            .read()
            .await
            .deliveries
            .iter()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect())
    }
}
