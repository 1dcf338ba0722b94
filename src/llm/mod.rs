mod cache;
mod gemini;
mod openai;
mod pricing;
pub mod render;
mod stream;

pub use cache::{CachedResult, PromptKey, ResponseCache};
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;
pub use pricing::{CostCalculator, CostError, CostRates, ModelCostVersion};
pub use stream::{ChatStream, StreamEvent, StreamSink};

use crate::storage::PromptSegment;
use async_openai::error::OpenAIError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Vendor API family a provider speaks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Vendor {
    OpenAiCompatible,
    Gemini,
    Other(String),
}

impl From<String> for Vendor {
    fn from(tag: String) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "openai-compatible" | "openai" => Self::OpenAiCompatible,
            "gemini" => Self::Gemini,
            _ => Self::Other(tag),
        }
    }
}

impl From<Vendor> for String {
    fn from(vendor: Vendor) -> Self {
        vendor.to_string()
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAiCompatible => write!(f, "openai-compatible"),
            Self::Gemini => write!(f, "gemini"),
            Self::Other(tag) => write!(f, "{}", tag),
        }
    }
}

/// Resolved backend configuration for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub source: Vendor,
    pub endpoint: String,
    pub api_key: String,
    pub default_model: String,
    pub temperature: f32,
    pub top_p: f32,
    /// 0 means unset.
    pub max_tokens: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Vendor-neutral request after rendering.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub user: Option<String>,
}

/// One normalized completion choice.
///
/// `index` is the vendor's choice (OpenAI) or candidate (Gemini) position;
/// streamed deltas with the same index belong to the same choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt.saturating_add(completion),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    pub choices: Vec<ChatChoice>,
    pub usage: TokenUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    OpenAi(#[from] OpenAIError),

    #[error("gemini request failed with status {status}: {message}")]
    Gemini { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("model '{model}' cannot be served by a {vendor} provider")]
    WrongProvider { vendor: String, model: String },

    #[error("provider returned no choices")]
    EmptyResponse,

    #[error("unsupported provider source '{0}'")]
    UnsupportedVendor(String),

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed provider response: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,
}

/// A single vendor's chat API.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResult, ChatError>;

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ChatError>;
}

/// Uniform chat execution over any resolved descriptor.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn chat(
        &self,
        descriptor: &ProviderDescriptor,
        prompts: &[PromptSegment],
        variables: &BTreeMap<String, String>,
        user_id: Option<&str>,
    ) -> Result<ChatResult, ChatError>;

    async fn chat_stream(
        &self,
        descriptor: &ProviderDescriptor,
        prompts: &[PromptSegment],
        variables: &BTreeMap<String, String>,
        user_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ChatError>;
}

/// [`ChatAdapter`] that talks to the real vendor APIs.
#[derive(Clone, Default)]
pub struct VendorAdapter;

impl VendorAdapter {
    pub fn new() -> Self {
        Self
    }

    fn provider_for(descriptor: &ProviderDescriptor) -> Result<Box<dyn ChatProvider>, ChatError> {
        match &descriptor.source {
            Vendor::OpenAiCompatible => Ok(Box::new(OpenAiClient::new(descriptor)?)),
            Vendor::Gemini => Ok(Box::new(GeminiClient::new(descriptor)?)),
            Vendor::Other(tag) => Err(ChatError::UnsupportedVendor(tag.clone())),
        }
    }
}

/// Render every segment and fold the descriptor's settings into a request.
pub fn build_request(
    descriptor: &ProviderDescriptor,
    prompts: &[PromptSegment],
    variables: &BTreeMap<String, String>,
    user_id: Option<&str>,
) -> ChatRequest {
    let messages = prompts
        .iter()
        .map(|segment| ChatMessage {
            role: segment.role.as_str().to_string(),
            content: render::render(&segment.text, variables),
        })
        .collect();

    ChatRequest {
        model: descriptor.default_model.clone(),
        messages,
        temperature: descriptor.temperature,
        top_p: (descriptor.top_p > 0.0).then_some(descriptor.top_p),
        max_tokens: (descriptor.max_tokens > 0).then_some(descriptor.max_tokens),
        user: user_id.filter(|u| !u.is_empty()).map(str::to_string),
    }
}

#[async_trait]
impl ChatAdapter for VendorAdapter {
    async fn chat(
        &self,
        descriptor: &ProviderDescriptor,
        prompts: &[PromptSegment],
        variables: &BTreeMap<String, String>,
        user_id: Option<&str>,
    ) -> Result<ChatResult, ChatError> {
        let provider = Self::provider_for(descriptor)?;
        let request = build_request(descriptor, prompts, variables, user_id);
        tracing::debug!(
            source = %descriptor.source,
            model = %request.model,
            messages = request.messages.len(),
            "Dispatching chat request"
        );
        provider.chat(&request).await
    }

    async fn chat_stream(
        &self,
        descriptor: &ProviderDescriptor,
        prompts: &[PromptSegment],
        variables: &BTreeMap<String, String>,
        user_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ChatError> {
        let provider = Self::provider_for(descriptor)?;
        let request = build_request(descriptor, prompts, variables, user_id);
        tracing::debug!(
            source = %descriptor.source,
            model = %request.model,
            "Dispatching streaming chat request"
        );
        provider.chat_stream(request, cancel).await
    }
}

/// Build the extra-header map shared by both vendor clients.
fn header_map(headers: &HashMap<String, String>) -> Result<reqwest::header::HeaderMap, ChatError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ChatError::InvalidConfig(format!("header '{}': {}", name, e)))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| ChatError::InvalidConfig(format!("header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SegmentRole;

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            source: Vendor::OpenAiCompatible,
            endpoint: "http://localhost:1234/v1".to_string(),
            api_key: "sk-test".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            top_p: 0.0,
            max_tokens: 0,
            headers: HashMap::new(),
            config: None,
        }
    }

    #[test]
    fn test_vendor_tags() {
        assert_eq!(Vendor::from("gemini".to_string()), Vendor::Gemini);
        assert_eq!(Vendor::from("OpenAI".to_string()), Vendor::OpenAiCompatible);
        assert_eq!(
            Vendor::from("openai-compatible".to_string()),
            Vendor::OpenAiCompatible
        );
        assert_eq!(
            Vendor::from("anthropic".to_string()),
            Vendor::Other("anthropic".to_string())
        );
        assert_eq!(Vendor::OpenAiCompatible.to_string(), "openai-compatible");
    }

    #[test]
    fn test_build_request_renders_segments() {
        let prompts = vec![
            PromptSegment {
                role: SegmentRole::System,
                text: "You greet people.".to_string(),
            },
            PromptSegment {
                role: SegmentRole::User,
                text: "Say hi to {{ name }}".to_string(),
            },
        ];
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), "Ada".to_string());

        let request = build_request(&descriptor(), &prompts, &vars, Some("user-1"));

        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[1].content, "Say hi to Ada");
        assert_eq!(request.top_p, None);
        assert_eq!(request.max_tokens, None);
        assert_eq!(request.user.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_build_request_optional_settings() {
        let mut d = descriptor();
        d.top_p = 0.9;
        d.max_tokens = 256;

        let request = build_request(&d, &[], &BTreeMap::new(), Some(""));
        assert_eq!(request.top_p, Some(0.9));
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.user, None);
    }

    #[tokio::test]
    async fn test_unsupported_vendor() {
        let mut d = descriptor();
        d.source = Vendor::Other("anthropic".to_string());

        let err = VendorAdapter::new()
            .chat(&d, &[], &BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::UnsupportedVendor(tag) if tag == "anthropic"));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            header_map(&headers),
            Err(ChatError::InvalidConfig(_))
        ));
    }
}
