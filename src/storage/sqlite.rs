use super::{
    CallRecord, LegacyProviderFields, Project, PromptTemplate, ProviderEntity, ResultCode, Storage,
    WebhookDeliveryAttempt, WebhookRegistration,
};
use crate::reports::MonthlyCostReport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let in_memory = path.as_os_str() == ":memory:";

        let (database_url, max_connections) = if in_memory {
            // Every connection would get its own empty database otherwise.
            ("sqlite::memory:".to_string(), 1)
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            (format!("sqlite://{}", path.display()), 5)
        };

        let options = SqliteConnectOptions::from_str(&database_url)
            .context("Invalid SQLite database path")?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        sqlx::migrate!("./migrations/sqlite")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    pub async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, public_token, provider_id, legacy) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(&project.public_token)
        .bind(project.provider_id)
        .bind(serde_json::to_string(&project.legacy)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_provider(&self, provider: &ProviderEntity) -> Result<()> {
        sqlx::query(
            "INSERT INTO providers (id, name, source, endpoint, api_key, default_model, temperature, top_p, max_tokens, headers, config)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(provider.id)
        .bind(&provider.name)
        .bind(&provider.source)
        .bind(&provider.endpoint)
        .bind(&provider.api_key)
        .bind(&provider.default_model)
        .bind(provider.temperature)
        .bind(provider.top_p)
        .bind(provider.max_tokens as i64)
        .bind(serde_json::to_string(&provider.headers)?)
        .bind(provider.config.as_ref().map(|c| c.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        sqlx::query(
            "INSERT INTO prompts (id, public_id, project_id, name, prompts, variables, debug, enabled, provider_id, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(prompt.id)
        .bind(&prompt.public_id)
        .bind(prompt.project_id)
        .bind(&prompt.name)
        .bind(serde_json::to_string(&prompt.prompts)?)
        .bind(serde_json::to_string(&prompt.variables)?)
        .bind(prompt.debug)
        .bind(prompt.enabled)
        .bind(prompt.provider_id)
        .bind(prompt.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_webhook(&self, webhook: &WebhookRegistration) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhooks (id, project_id, url, event, enabled) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(webhook.id)
        .bind(webhook.project_id)
        .bind(&webhook.url)
        .bind(&webhook.event)
        .bind(webhook.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn project_from_row(r: &SqliteRow) -> Result<Project> {
    let legacy: String = r.get("legacy");
    let legacy: LegacyProviderFields =
        serde_json::from_str(&legacy).context("Malformed legacy provider fields")?;

    Ok(Project {
        id: r.get("id"),
        name: r.get("name"),
        public_token: r.get("public_token"),
        provider_id: r.get("provider_id"),
        legacy,
    })
}

fn provider_from_row(r: &SqliteRow) -> Result<ProviderEntity> {
    let headers: String = r.get("headers");
    let config: Option<String> = r.get("config");
    let max_tokens: i64 = r.get("max_tokens");

    Ok(ProviderEntity {
        id: r.get("id"),
        name: r.get("name"),
        source: r.get("source"),
        endpoint: r.get("endpoint"),
        api_key: r.get("api_key"),
        default_model: r.get("default_model"),
        temperature: r.get("temperature"),
        top_p: r.get("top_p"),
        max_tokens: max_tokens.max(0) as u32,
        headers: serde_json::from_str(&headers).context("Malformed provider headers")?,
        config: config
            .map(|c| serde_json::from_str(&c))
            .transpose()
            .context("Malformed provider config")?,
    })
}

fn prompt_from_row(r: &SqliteRow) -> Result<PromptTemplate> {
    let prompts: String = r.get("prompts");
    let variables: String = r.get("variables");

    Ok(PromptTemplate {
        id: r.get("id"),
        public_id: r.get("public_id"),
        project_id: r.get("project_id"),
        name: r.get("name"),
        prompts: serde_json::from_str(&prompts).context("Malformed prompt segments")?,
        variables: serde_json::from_str(&variables).context("Malformed variable schema")?,
        debug: r.get("debug"),
        enabled: r.get("enabled"),
        provider_id: r.get("provider_id"),
        updated_at: r.get("updated_at"),
    })
}

fn call_record_from_row(r: &SqliteRow) -> CallRecord {
    let prompt_tokens: i64 = r.get("prompt_tokens");
    let completion_tokens: i64 = r.get("completion_tokens");
    let total_tokens: i64 = r.get("total_tokens");
    let result: i64 = r.get("result");

    CallRecord {
        id: r.get("id"),
        prompt_id: r.get("prompt_id"),
        project_id: r.get("project_id"),
        provider_id: r.get("provider_id"),
        model: r.get("model"),
        user_id: r.get("user_id"),
        prompt_tokens: prompt_tokens.max(0) as u32,
        completion_tokens: completion_tokens.max(0) as u32,
        total_tokens: total_tokens.max(0) as u32,
        duration_ms: r.get("duration_ms"),
        result: ResultCode::from_code(result),
        cached: r.get("cached"),
        cost_cents: r.get("cost_cents"),
        debug_message: r.get("debug_message"),
        created_at: r.get("created_at"),
    }
}

fn webhook_from_row(r: &SqliteRow) -> WebhookRegistration {
    WebhookRegistration {
        id: r.get("id"),
        project_id: r.get("project_id"),
        url: r.get("url"),
        event: r.get("event"),
        enabled: r.get("enabled"),
    }
}

fn delivery_from_row(r: &SqliteRow) -> WebhookDeliveryAttempt {
    let status_code: Option<i64> = r.get("status_code");

    WebhookDeliveryAttempt {
        id: r.get("id"),
        webhook_id: r.get("webhook_id"),
        trace_id: r.get("trace_id"),
        url: r.get("url"),
        request_headers: r.get("request_headers"),
        request_body: r.get("request_body"),
        response_headers: r.get("response_headers"),
        response_body: r.get("response_body"),
        status_code: status_code.map(|c| c as u16),
        started_at: r.get("started_at"),
        finished_at: r.get("finished_at"),
        timed_out: r.get("timed_out"),
        success: r.get("success"),
        error: r.get("error"),
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, public_token, provider_id, legacy FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn get_project_by_token(&self, token: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, public_token, provider_id, legacy FROM projects WHERE public_token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn get_provider(&self, id: i64) -> Result<Option<ProviderEntity>> {
        let row = sqlx::query(
            "SELECT id, name, source, endpoint, api_key, default_model, temperature, top_p, max_tokens, headers, config
             FROM providers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(provider_from_row).transpose()
    }

    async fn get_prompt(&self, id: i64) -> Result<Option<PromptTemplate>> {
        let row = sqlx::query(
            "SELECT id, public_id, project_id, name, prompts, variables, debug, enabled, provider_id, updated_at
             FROM prompts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(prompt_from_row).transpose()
    }

    async fn get_prompt_by_public_id(&self, public_id: &str) -> Result<Option<PromptTemplate>> {
        let row = sqlx::query(
            "SELECT id, public_id, project_id, name, prompts, variables, debug, enabled, provider_id, updated_at
             FROM prompts WHERE public_id = ?",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(prompt_from_row).transpose()
    }

    async fn insert_call_record(&self, record: CallRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_records (id, prompt_id, project_id, provider_id, model, user_id, prompt_tokens,
                completion_tokens, total_tokens, duration_ms, result, cached, cost_cents, debug_message, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.prompt_id)
        .bind(record.project_id)
        .bind(record.provider_id)
        .bind(&record.model)
        .bind(&record.user_id)
        .bind(record.prompt_tokens as i64)
        .bind(record.completion_tokens as i64)
        .bind(record.total_tokens as i64)
        .bind(record.duration_ms)
        .bind(record.result.code() as i64)
        .bind(record.cached)
        .bind(record.cost_cents)
        .bind(&record.debug_message)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_call_records(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query(
            "SELECT id, prompt_id, project_id, provider_id, model, user_id, prompt_tokens, completion_tokens,
                    total_tokens, duration_ms, result, cached, cost_cents, debug_message, created_at
             FROM call_records
             WHERE user_id = ? AND created_at >= ? AND created_at < ?
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(call_record_from_row).collect())
    }

    async fn get_cost_report(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<Option<MonthlyCostReport>> {
        let row = sqlx::query("SELECT report FROM cost_reports WHERE user_id = ? AND month = ?")
            .bind(user_id)
            .bind(month)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let body: String = r.get("report");
                let report = serde_json::from_str(&body).context("Malformed cost report snapshot")?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    async fn upsert_cost_report(&self, report: &MonthlyCostReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO cost_reports (user_id, month, report, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, month) DO UPDATE SET report = excluded.report, updated_at = excluded.updated_at",
        )
        .bind(&report.user_id)
        .bind(&report.month)
        .bind(serde_json::to_string(report)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_enabled_webhooks(
        &self,
        project_id: i64,
        event: &str,
    ) -> Result<Vec<WebhookRegistration>> {
        let rows = sqlx::query(
            "SELECT id, project_id, url, event, enabled FROM webhooks
             WHERE project_id = ? AND event = ? AND enabled = 1
             ORDER BY id ASC",
        )
        .bind(project_id)
        .bind(event)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(webhook_from_row).collect())
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<WebhookRegistration>> {
        let row = sqlx::query("SELECT id, project_id, url, event, enabled FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(webhook_from_row))
    }

    async fn insert_webhook_delivery(&self, attempt: WebhookDeliveryAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_deliveries (id, webhook_id, trace_id, url, request_headers, request_body,
                response_headers, response_body, status_code, started_at, finished_at, timed_out, success, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.id)
        .bind(attempt.webhook_id)
        .bind(&attempt.trace_id)
        .bind(&attempt.url)
        .bind(&attempt.request_headers)
        .bind(&attempt.request_body)
        .bind(&attempt.response_headers)
        .bind(&attempt.response_body)
        .bind(attempt.status_code.map(|c| c as i64))
        .bind(attempt.started_at)
        .bind(attempt.finished_at)
        .bind(attempt.timed_out)
        .bind(attempt.success)
        .bind(&attempt.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_webhook_deliveries(&self, webhook_id: i64) -> Result<Vec<WebhookDeliveryAttempt>> {
        let rows = sqlx::query(
            "SELECT id, webhook_id, trace_id, url, request_headers, request_body, response_headers, response_body,
                    status_code, started_at, finished_at, timed_out, success, error
             FROM webhook_deliveries WHERE webhook_id = ?
             ORDER BY started_at ASC",
        )
        .bind(webhook_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(delivery_from_row).collect())
    }
}
