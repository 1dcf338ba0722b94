use super::{CompletionFacts, WebhookPayload};
use crate::config::WebhookConfig;
use crate::storage::{Storage, WebhookDeliveryAttempt, WebhookRegistration};
use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::header::{HeaderMap, CONTENT_TYPE, USER_AGENT};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Fire-and-forget webhook delivery with a durable ledger.
///
/// Each registration gets its own task on the shared tracker. Deliveries are
/// attempted once; every attempt, including ones whose request could not be
/// built, lands in the ledger.
#[derive(Clone)]
pub struct WebhookDispatcher<S: Storage> {
    storage: S,
    http: reqwest::Client,
    user_agent: String,
    tracker: TaskTracker,
}

impl<S: Storage + 'static> WebhookDispatcher<S> {
    pub fn new(storage: S, config: &WebhookConfig, tracker: TaskTracker) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create webhook HTTP client")?;

        Ok(Self {
            storage,
            http,
            user_agent: format!("{}-Webhook@{}", config.product, env!("CARGO_PKG_VERSION")),
            tracker,
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Notify every enabled registration for `(project_id, event)`.
    ///
    /// Returns the batch trace id, or `None` when nothing was registered.
    pub async fn notify(&self, project_id: i64, event: &str, facts: &CompletionFacts) -> Option<String> {
        let registrations = match self.storage.list_enabled_webhooks(project_id, event).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(project_id, "Failed to load webhook registrations: {:#}", e);
                return None;
            }
        };
        if registrations.is_empty() {
            return None;
        }

        let trace_id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(&WebhookPayload::new(project_id, event, facts))
            .map_err(|e| format!("failed to encode payload: {}", e));

        tracing::debug!(
            project_id,
            trace_id = %trace_id,
            count = registrations.len(),
            "Dispatching webhooks"
        );

        for webhook in registrations {
            let dispatcher = self.clone();
            let trace_id = trace_id.clone();
            let body = body.clone();
            self.tracker.spawn(async move {
                dispatcher.deliver(webhook, trace_id, body).await;
            });
        }

        Some(trace_id)
    }

    async fn deliver(
        &self,
        webhook: WebhookRegistration,
        trace_id: String,
        body: Result<String, String>,
    ) {
        let started_at = Utc::now();
        let mut attempt = WebhookDeliveryAttempt {
            id: Uuid::new_v4().to_string(),
            webhook_id: webhook.id,
            trace_id,
            url: webhook.url.clone(),
            request_headers: "{}".to_string(),
            request_body: String::new(),
            response_headers: "{}".to_string(),
            response_body: String::new(),
            status_code: None,
            started_at,
            finished_at: started_at,
            timed_out: false,
            success: false,
            error: None,
        };

        match body {
            Ok(body) => {
                attempt.request_body = body.clone();
                self.send(&webhook.url, body, &mut attempt).await;
            }
            Err(e) => attempt.error = Some(e),
        }
        attempt.finished_at = Utc::now();

        if attempt.success {
            tracing::debug!(
                webhook_id = webhook.id,
                status = ?attempt.status_code,
                "Webhook delivered"
            );
        } else {
            tracing::error!(
                webhook_id = webhook.id,
                url = %webhook.url,
                timed_out = attempt.timed_out,
                "Webhook delivery failed: {}",
                attempt.error.as_deref().unwrap_or("unknown error")
            );
        }

        if let Err(e) = self.storage.insert_webhook_delivery(attempt).await {
            tracing::error!(webhook_id = webhook.id, "Failed to record webhook delivery: {:#}", e);
        }
    }

    async fn send(&self, url: &str, body: String, attempt: &mut WebhookDeliveryAttempt) {
        let request = match self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.user_agent)
            .body(body)
            .build()
        {
            Ok(request) => request,
            Err(e) => {
                attempt.error = Some(format!("failed to build request: {}", e));
                return;
            }
        };
        attempt.request_headers = snapshot_headers(request.headers());

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                attempt.timed_out = e.is_timeout() || looks_like_timeout(&message);
                attempt.error = Some(message);
                return;
            }
        };

        let status = response.status();
        attempt.status_code = Some(status.as_u16());
        attempt.response_headers = snapshot_headers(response.headers());
        match response.text().await {
            Ok(text) => attempt.response_body = text,
            Err(e) => {
                attempt.timed_out = e.is_timeout();
                attempt.error = Some(format!("failed to read response body: {}", e));
                return;
            }
        }

        if status.is_success() {
            attempt.success = true;
        } else {
            attempt.error = Some(format!("endpoint returned status {}", status.as_u16()));
        }
    }
}

/// Transport errors from some stacks only signal timeouts in their text.
pub fn looks_like_timeout(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timeout") || message.contains("timed out") || message.contains("deadline exceeded")
}

fn snapshot_headers(headers: &HeaderMap) -> String {
    let map: BTreeMap<&str, String> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}
