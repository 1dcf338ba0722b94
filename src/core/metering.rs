use crate::llm::TokenUsage;
use crate::storage::{CallRecord, PromptTemplate, ResultCode, Storage};
use chrono::Utc;
use std::time::Instant;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Per-invocation facts the recorder persists.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub provider_id: Option<i64>,
    pub model: String,
    pub usage: TokenUsage,
    pub result: ResultCode,
    pub cached: bool,
    pub cost_cents: f64,
    pub debug_message: Option<String>,
}

impl CallOutcome {
    /// Zeroed usage for an invocation that produced nothing.
    pub fn failure(provider_id: Option<i64>, model: String, message: impl Into<String>) -> Self {
        Self {
            provider_id,
            model,
            usage: TokenUsage::default(),
            result: ResultCode::Failure,
            cached: false,
            cost_cents: 0.0,
            debug_message: Some(message.into()),
        }
    }
}

/// Durable metering of every invocation. Write failures are logged only.
#[derive(Clone)]
pub struct CallRecorder<S: Storage> {
    storage: S,
    tracker: TaskTracker,
}

impl<S: Storage + 'static> CallRecorder<S> {
    pub fn new(storage: S, tracker: TaskTracker) -> Self {
        Self { storage, tracker }
    }

    pub async fn record(
        &self,
        prompt: &PromptTemplate,
        user_id: &str,
        duration_ms: i64,
        outcome: CallOutcome,
    ) -> CallRecord {
        let record = CallRecord {
            id: Uuid::new_v4().to_string(),
            prompt_id: prompt.id,
            project_id: prompt.project_id,
            provider_id: outcome.provider_id,
            model: outcome.model,
            user_id: user_id.to_string(),
            prompt_tokens: outcome.usage.prompt,
            completion_tokens: outcome.usage.completion,
            total_tokens: outcome.usage.total,
            duration_ms: duration_ms.max(0),
            result: outcome.result,
            cached: outcome.cached,
            cost_cents: outcome.cost_cents.max(0.0),
            debug_message: outcome.debug_message.filter(|_| prompt.debug),
            created_at: Utc::now(),
        };

        if let Err(e) = self.storage.insert_call_record(record.clone()).await {
            tracing::warn!(
                prompt_id = prompt.id,
                user_id,
                "Failed to write call record: {:#}",
                e
            );
        }
        record
    }

    /// Arm a guard that records a failure unless completed explicitly.
    pub fn guard(&self, prompt: PromptTemplate, user_id: String) -> MeteringGuard<S> {
        MeteringGuard {
            recorder: self.clone(),
            prompt,
            user_id,
            started: Instant::now(),
            provider_id: None,
            model: String::new(),
            armed: true,
        }
    }
}

/// Guarantees exactly one call record per invocation.
///
/// Dropping an armed guard (caller cancelled, task aborted, early return)
/// spawns a failure record on the shared tracker.
pub struct MeteringGuard<S: Storage + 'static> {
    recorder: CallRecorder<S>,
    prompt: PromptTemplate,
    user_id: String,
    started: Instant,
    provider_id: Option<i64>,
    model: String,
    armed: bool,
}

impl<S: Storage + 'static> MeteringGuard<S> {
    pub fn set_provider(&mut self, provider_id: Option<i64>, model: &str) {
        self.provider_id = provider_id;
        self.model = model.to_string();
    }

    pub fn provider_id(&self) -> Option<i64> {
        self.provider_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt(&self) -> &PromptTemplate {
        &self.prompt
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    pub async fn complete(mut self, outcome: CallOutcome) -> CallRecord {
        self.armed = false;
        self.recorder
            .record(&self.prompt, &self.user_id, self.elapsed_ms(), outcome)
            .await
    }
}

impl<S: Storage + 'static> Drop for MeteringGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                prompt_id = self.prompt.id,
                "Invocation abandoned outside a runtime, call record lost"
            );
            return;
        };

        let recorder = self.recorder.clone();
        let prompt = self.prompt.clone();
        let user_id = std::mem::take(&mut self.user_id);
        let duration_ms = self.elapsed_ms();
        let outcome = CallOutcome::failure(
            self.provider_id,
            std::mem::take(&mut self.model),
            "invocation cancelled before completion",
        );

        tracing::debug!(prompt_id = prompt.id, "Recording abandoned invocation");
        self.recorder.tracker.spawn_on(
            async move {
                recorder.record(&prompt, &user_id, duration_ms, outcome).await;
            },
            &handle,
        );
    }
}
