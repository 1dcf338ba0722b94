#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use promptgate::cache::{CacheService, MemoryCache};
use promptgate::llm::{
    build_request, ChatAdapter, ChatChoice, ChatError, ChatResult, ChatStream, CostCalculator,
    ProviderDescriptor, TokenUsage,
};
use promptgate::storage::memory::MemoryStorage;
use promptgate::storage::{
    LegacyProviderFields, Project, PromptSegment, PromptTemplate, ProviderEntity, SegmentRole,
    WebhookRegistration, EVENT_PROMPT_FINISHED,
};
use promptgate::{Config, PromptGateway};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const USAGE: TokenUsage = TokenUsage {
    prompt: 10,
    completion: 5,
    total: 15,
};

/// Adapter that echoes the rendered last segment and remembers who it was
/// asked to talk to.
#[derive(Default)]
pub struct FakeAdapter {
    pub seen: Mutex<Vec<ProviderDescriptor>>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub stall: AtomicBool,
    pub stream_cancelled: Arc<AtomicBool>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn models(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.default_model.clone())
            .collect()
    }

    fn reply(
        &self,
        descriptor: &ProviderDescriptor,
        prompts: &[PromptSegment],
        variables: &BTreeMap<String, String>,
        user_id: Option<&str>,
    ) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(descriptor.clone());
        build_request(descriptor, prompts, variables, user_id)
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

fn assistant(text: &str) -> Vec<ChatChoice> {
    vec![ChatChoice {
        index: 0,
        role: "assistant".to_string(),
        content: text.to_string(),
    }]
}

#[async_trait]
impl ChatAdapter for FakeAdapter {
    async fn chat(
        &self,
        descriptor: &ProviderDescriptor,
        prompts: &[PromptSegment],
        variables: &BTreeMap<String, String>,
        user_id: Option<&str>,
    ) -> Result<ChatResult, ChatError> {
        let text = self.reply(descriptor, prompts, variables, user_id);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::Gemini {
                status: 500,
                message: "upstream exploded".to_string(),
            });
        }
        Ok(ChatResult {
            choices: assistant(&text),
            usage: USAGE,
        })
    }

    async fn chat_stream(
        &self,
        descriptor: &ProviderDescriptor,
        prompts: &[PromptSegment],
        variables: &BTreeMap<String, String>,
        user_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ChatError> {
        let text = self.reply(descriptor, prompts, variables, user_id);
        let stall = self.stall.load(Ordering::SeqCst);
        let cancelled = self.stream_cancelled.clone();

        Ok(ChatStream::spawn(cancel, move |sink, cancel| async move {
            if stall {
                cancel.cancelled().await;
                cancelled.store(true, Ordering::SeqCst);
                return;
            }
            let (head, tail) = text.split_at(text.len() / 2);
            sink.partial(assistant(head)).await;
            sink.partial(assistant(tail)).await;
            sink.finish(USAGE).await;
        }))
    }
}

pub fn project(id: i64, token: &str, provider_id: Option<i64>) -> Project {
    Project {
        id,
        name: format!("project-{}", id),
        public_token: token.to_string(),
        provider_id,
        legacy: LegacyProviderFields {
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: "sk-legacy".to_string(),
            openai_model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            ..Default::default()
        },
    }
}

pub fn provider(id: i64, name: &str, model: &str) -> ProviderEntity {
    ProviderEntity {
        id,
        name: name.to_string(),
        source: "openai-compatible".to_string(),
        endpoint: "https://api.openai.com/v1".to_string(),
        api_key: format!("sk-{}", id),
        default_model: model.to_string(),
        temperature: 0.2,
        top_p: 0.0,
        max_tokens: 0,
        headers: HashMap::new(),
        config: None,
    }
}

pub fn prompt(id: i64, public_id: &str, project_id: i64, provider_id: Option<i64>) -> PromptTemplate {
    PromptTemplate {
        id,
        public_id: public_id.to_string(),
        project_id,
        name: format!("prompt-{}", id),
        prompts: vec![
            PromptSegment {
                role: SegmentRole::System,
                text: "You greet people.".to_string(),
            },
            PromptSegment {
                role: SegmentRole::User,
                text: "Hello {{name}}".to_string(),
            },
        ],
        variables: vec![],
        debug: true,
        enabled: true,
        provider_id,
        updated_at: Utc::now(),
    }
}

pub fn webhook(id: i64, project_id: i64, url: &str) -> WebhookRegistration {
    WebhookRegistration {
        id,
        project_id,
        url: url.to_string(),
        event: EVENT_PROMPT_FINISHED.to_string(),
        enabled: true,
    }
}

pub fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn gateway(storage: MemoryStorage, adapter: Arc<FakeAdapter>) -> PromptGateway<MemoryStorage> {
    let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new(1_000));
    let pricing = Arc::new(CostCalculator::builtin().unwrap());
    PromptGateway::new(storage, adapter, pricing, cache, &Config::default()).unwrap()
}

/// Project 1 (token `tok-1`) on provider 2, prompt `pr_hello` on provider 1.
pub async fn seeded() -> MemoryStorage {
    let storage = MemoryStorage::new();
    storage.insert_provider(provider(1, "Primary", "gpt-4o")).await;
    storage.insert_provider(provider(2, "Fallback", "gpt-4o-mini")).await;
    storage.insert_project(project(1, "tok-1", Some(2))).await;
    storage.insert_prompt(prompt(10, "pr_hello", 1, Some(1))).await;
    storage
}

/// Poll `check` until it holds or a couple of seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
