use super::metering::{CallOutcome, CallRecorder, MeteringGuard};
use super::resolver::{ProviderResolver, ResolveError};
use crate::cache::CacheService;
use crate::config::Config;
use crate::llm::{
    CachedResult, ChatAdapter, ChatChoice, ChatError, ChatResult, ChatStream, CostCalculator,
    PromptKey, ResponseCache, StreamEvent, TokenUsage,
};
use crate::storage::{CallRecord, PromptTemplate, ResultCode, Storage, EVENT_PROMPT_FINISHED};
use crate::webhooks::{CompletionFacts, WebhookDispatcher};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const TOKEN_KEY_PREFIX: &str = "project-token";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("prompt '{0}' not found")]
    PromptNotFound(String),

    #[error("project token not recognized")]
    UnknownProjectToken,

    #[error("prompt '{0}' is disabled")]
    Disabled(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// How the caller names the template.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptRef {
    Id(i64),
    PublicId(String),
}

impl std::fmt::Display for PromptRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::PublicId(public_id) => write!(f, "{}", public_id),
        }
    }
}

/// Caller details forwarded to webhooks.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: PromptRef,
    pub variables: BTreeMap<String, String>,
    pub user_id: String,
    /// When set, the prompt must belong to this project.
    pub project_id: Option<i64>,
    pub client: ClientInfo,
}

impl ExecuteRequest {
    pub fn new(prompt: PromptRef, user_id: impl Into<String>) -> Self {
        Self {
            prompt,
            variables: BTreeMap::new(),
            user_id: user_id.into(),
            project_id: None,
            client: ClientInfo::default(),
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: TokenUsage,
    pub cost_cents: f64,
    pub cached: bool,
    pub duration_ms: i64,
    #[serde(skip)]
    pub record_id: String,
}

/// Front door for prompt execution.
///
/// Cache lookup, provider resolution, the vendor call, costing, metering and
/// webhook fan-out all happen here. Metering and webhooks run on the shared
/// task tracker and never hold up the caller.
#[derive(Clone)]
pub struct PromptGateway<S: Storage> {
    storage: S,
    resolver: ProviderResolver<S>,
    adapter: Arc<dyn ChatAdapter>,
    pricing: Arc<CostCalculator>,
    responses: ResponseCache,
    cache: Arc<dyn CacheService>,
    token_ttl: Duration,
    recorder: CallRecorder<S>,
    webhooks: WebhookDispatcher<S>,
    tracker: TaskTracker,
}

impl<S: Storage + 'static> PromptGateway<S> {
    pub fn new(
        storage: S,
        adapter: Arc<dyn ChatAdapter>,
        pricing: Arc<CostCalculator>,
        cache: Arc<dyn CacheService>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let tracker = TaskTracker::new();
        Ok(Self {
            resolver: ProviderResolver::new(storage.clone()),
            responses: ResponseCache::new(
                cache.clone(),
                Duration::from_secs(config.cache.response_ttl_secs),
            ),
            token_ttl: Duration::from_secs(config.cache.token_ttl_secs),
            recorder: CallRecorder::new(storage.clone(), tracker.clone()),
            webhooks: WebhookDispatcher::new(storage.clone(), &config.webhooks, tracker.clone())?,
            storage,
            adapter,
            pricing,
            cache,
            tracker,
        })
    }

    /// Wait for every in-flight metering write and webhook delivery.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Drop cached responses for a template after it is edited.
    pub async fn invalidate_prompt(&self, public_id: &str) {
        self.responses.invalidate(public_id).await;
    }

    /// Project id for a public project token, through the lookup cache.
    pub async fn project_for_token(&self, token: &str) -> Result<i64, GatewayError> {
        let key = format!("{}:{}", TOKEN_KEY_PREFIX, token);
        match self.cache.get(&key).await {
            Ok(Some(value)) => {
                if let Some(project_id) = value.as_i64() {
                    return Ok(project_id);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Project token cache read failed: {:#}", e),
        }

        let project = self
            .storage
            .get_project_by_token(token)
            .await?
            .ok_or(GatewayError::UnknownProjectToken)?;

        if let Err(e) = self
            .cache
            .set(&key, serde_json::json!(project.id), self.token_ttl)
            .await
        {
            tracing::warn!("Project token cache write failed: {:#}", e);
        }
        Ok(project.id)
    }

    async fn load_prompt(&self, request: &ExecuteRequest) -> Result<PromptTemplate, GatewayError> {
        let prompt = match &request.prompt {
            PromptRef::Id(id) => self.storage.get_prompt(*id).await?,
            PromptRef::PublicId(public_id) => self.storage.get_prompt_by_public_id(public_id).await?,
        };

        let prompt = prompt
            .filter(|p| request.project_id.map_or(true, |project_id| p.project_id == project_id))
            .ok_or_else(|| GatewayError::PromptNotFound(request.prompt.to_string()))?;

        if !prompt.enabled {
            return Err(GatewayError::Disabled(prompt.public_id));
        }

        let missing = prompt.missing_variables(&request.variables);
        if !missing.is_empty() {
            tracing::debug!(
                prompt_id = prompt.id,
                "Executing with unbound variables: {}",
                missing.join(", ")
            );
        }

        Ok(prompt)
    }

    fn cost_of(&self, model: &str, usage: &TokenUsage) -> f64 {
        match self.pricing.total(model, Utc::now(), usage) {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(model, "Cost unavailable, recording 0: {}", e);
                0.0
            }
        }
    }

    fn spawn_notify(&self, record: &CallRecord, client: &ClientInfo) {
        let facts = CompletionFacts {
            prompt_id: record.prompt_id,
            user_id: record.user_id.clone(),
            result: record.result,
            timestamp: record.created_at,
            duration_ms: record.duration_ms,
            usage: TokenUsage {
                prompt: record.prompt_tokens,
                completion: record.completion_tokens,
                total: record.total_tokens,
            },
            cached: record.cached,
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
        };
        let webhooks = self.webhooks.clone();
        let project_id = record.project_id;
        self.tracker.spawn(async move {
            webhooks.notify(project_id, EVENT_PROMPT_FINISHED, &facts).await;
        });
    }

    async fn finish(
        &self,
        guard: MeteringGuard<S>,
        client: &ClientInfo,
        outcome: CallOutcome,
    ) -> CallRecord {
        let record = guard.complete(outcome).await;
        self.spawn_notify(&record, client);
        record
    }

    async fn fail(&self, guard: MeteringGuard<S>, client: &ClientInfo, message: String) {
        let outcome = CallOutcome::failure(guard.provider_id(), guard.model().to_string(), message);
        self.finish(guard, client, outcome).await;
    }

    async fn record_hit(
        &self,
        guard: MeteringGuard<S>,
        client: &ClientInfo,
        hit: &CachedResult,
    ) -> CallRecord {
        tracing::debug!(prompt_id = guard.prompt().id, "Response cache hit");
        let outcome = CallOutcome {
            provider_id: hit.provider_id,
            model: hit.model.clone(),
            usage: hit.usage,
            result: ResultCode::Success,
            cached: true,
            cost_cents: 0.0,
            debug_message: Some(debug_text(&hit.choices)),
        };
        self.finish(guard, client, outcome).await
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, GatewayError> {
        let prompt = self.load_prompt(&request).await?;
        let key = PromptKey::from(&prompt);
        let mut guard = self.recorder.guard(prompt.clone(), request.user_id.clone());

        if let Some(hit) = self.responses.get(&key, &request.variables).await {
            let record = self.record_hit(guard, &request.client, &hit).await;
            return Ok(ExecuteResponse {
                choices: hit.choices,
                usage: hit.usage,
                cost_cents: record.cost_cents,
                cached: true,
                duration_ms: record.duration_ms,
                record_id: record.id,
            });
        }

        let resolved = match self.resolver.resolve(&prompt).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(guard, &request.client, e.to_string()).await;
                return Err(e.into());
            }
        };
        let descriptor = resolved.descriptor();
        guard.set_provider(resolved.provider_id(), &descriptor.default_model);

        tracing::debug!(
            prompt_id = prompt.id,
            provider_id = ?resolved.provider_id(),
            model = %descriptor.default_model,
            "Executing prompt"
        );

        let result = match self
            .adapter
            .chat(
                descriptor,
                &prompt.prompts,
                &request.variables,
                Some(&request.user_id),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(prompt_id = prompt.id, "Chat execution failed: {}", e);
                self.fail(guard, &request.client, e.to_string()).await;
                return Err(e.into());
            }
        };

        let cost_cents = self.cost_of(&descriptor.default_model, &result.usage);
        self.responses
            .put(
                &key,
                &request.variables,
                &CachedResult::new(&result, resolved.provider_id(), &descriptor.default_model),
                None,
            )
            .await;

        let outcome = CallOutcome {
            provider_id: resolved.provider_id(),
            model: descriptor.default_model.clone(),
            usage: result.usage,
            result: ResultCode::Success,
            cached: false,
            cost_cents,
            debug_message: Some(debug_text(&result.choices)),
        };
        let record = self.finish(guard, &request.client, outcome).await;

        Ok(ExecuteResponse {
            choices: result.choices,
            usage: result.usage,
            cost_cents: record.cost_cents,
            cached: false,
            duration_ms: record.duration_ms,
            record_id: record.id,
        })
    }

    /// Streamed execution. Dropping the returned handle cancels the vendor
    /// stream and records the invocation as failed.
    pub async fn execute_stream(&self, request: ExecuteRequest) -> Result<ChatStream, GatewayError> {
        let prompt = self.load_prompt(&request).await?;
        let key = PromptKey::from(&prompt);
        let mut guard = self.recorder.guard(prompt.clone(), request.user_id.clone());

        if let Some(hit) = self.responses.get(&key, &request.variables).await {
            self.record_hit(guard, &request.client, &hit).await;
            return Ok(ChatStream::from_events(vec![
                StreamEvent::Partial(hit.choices),
                StreamEvent::Usage(hit.usage),
                StreamEvent::Done,
            ]));
        }

        let resolved = match self.resolver.resolve(&prompt).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(guard, &request.client, e.to_string()).await;
                return Err(e.into());
            }
        };
        let descriptor = resolved.descriptor().clone();
        let provider_id = resolved.provider_id();
        guard.set_provider(provider_id, &descriptor.default_model);

        let upstream = match self
            .adapter
            .chat_stream(
                &descriptor,
                &prompt.prompts,
                &request.variables,
                Some(&request.user_id),
                CancellationToken::new(),
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(prompt_id = prompt.id, "Chat stream failed to start: {}", e);
                self.fail(guard, &request.client, e.to_string()).await;
                return Err(e.into());
            }
        };

        let gateway = self.clone();
        let client = request.client.clone();
        let variables = request.variables.clone();
        let model = descriptor.default_model.clone();

        Ok(ChatStream::spawn_tracked(
            &self.tracker,
            CancellationToken::new(),
            move |sink, cancel| async move {
                let mut upstream = upstream;
                let mut collected: Vec<ChatChoice> = Vec::new();
                let mut usage = TokenUsage::default();

                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => {
                            // Dropping `upstream` and `guard` cancels the vendor
                            // stream and records the failure.
                            sink.cancelled();
                            return;
                        }
                        event = upstream.next_event() => event,
                    };

                    match event {
                        Some(StreamEvent::Partial(choices)) => {
                            merge_choices(&mut collected, &choices);
                            if !sink.partial(choices).await {
                                return;
                            }
                        }
                        Some(StreamEvent::Usage(u)) => usage = u,
                        Some(StreamEvent::Done) => break,
                        Some(StreamEvent::Error(e)) => {
                            gateway.fail(guard, &client, e.to_string()).await;
                            sink.fail(e).await;
                            return;
                        }
                        None => {
                            gateway
                                .fail(guard, &client, "stream ended without completion".to_string())
                                .await;
                            sink.fail(ChatError::EmptyResponse).await;
                            return;
                        }
                    }
                }

                let result = ChatResult {
                    choices: collected,
                    usage,
                };
                gateway
                    .responses
                    .put(
                        &key,
                        &variables,
                        &CachedResult::new(&result, provider_id, &model),
                        None,
                    )
                    .await;

                let outcome = CallOutcome {
                    provider_id,
                    model: model.clone(),
                    usage,
                    result: ResultCode::Success,
                    cached: false,
                    cost_cents: gateway.cost_of(&model, &usage),
                    debug_message: Some(debug_text(&result.choices)),
                };
                gateway.finish(guard, &client, outcome).await;
                sink.finish(usage).await;
            },
        ))
    }
}

/// Fold streamed deltas into whole choices, keyed by choice index.
fn merge_choices(collected: &mut Vec<ChatChoice>, delta: &[ChatChoice]) {
    for choice in delta {
        match collected.iter_mut().find(|c| c.index == choice.index) {
            Some(existing) => existing.content.push_str(&choice.content),
            None => collected.push(choice.clone()),
        }
    }
    collected.sort_by_key(|c| c.index);
}

fn debug_text(choices: &[ChatChoice]) -> String {
    choices
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
