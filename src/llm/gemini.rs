use super::{
    header_map, ChatChoice, ChatError, ChatProvider, ChatRequest, ChatResult, ChatStream,
    TokenUsage,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
const API_VERSION: &str = "v1beta";
const MODEL_PREFIX: &str = "gemini";

/// Google Generative Language REST client.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct CountTokensRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    token_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    candidates_token_count: u32,
}

impl GenerateContentResponse {
    /// One choice per text part, tagged with its candidate's index.
    fn choices(&self) -> Vec<ChatChoice> {
        self.candidates
            .iter()
            .enumerate()
            .filter_map(|(position, c)| {
                let index = c.index.unwrap_or(position as u32);
                c.content.as_ref().map(|content| (index, content))
            })
            .flat_map(|(index, content)| {
                content.parts.iter().filter_map(move |part| {
                    part.text.clone().map(|text| ChatChoice {
                        index,
                        role: "assistant".to_string(),
                        content: text,
                    })
                })
            })
            .collect()
    }

    /// Sum of per-candidate counts, falling back to the usage block.
    fn completion_tokens(&self) -> u32 {
        let summed: u32 = self.candidates.iter().map(|c| c.token_count).sum();
        if summed > 0 {
            return summed;
        }
        self.usage_metadata
            .as_ref()
            .map(|u| u.candidates_token_count)
            .unwrap_or(0)
    }
}

impl GeminiClient {
    pub fn new(descriptor: &super::ProviderDescriptor) -> Result<Self, ChatError> {
        let mut headers = header_map(&descriptor.headers)?;
        let key = HeaderValue::from_str(&descriptor.api_key)
            .map_err(|e| ChatError::InvalidConfig(format!("api key: {}", e)))?;
        headers.insert("x-goog-api-key", key);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        let endpoint = descriptor.endpoint.trim();
        let base_url = if endpoint.is_empty() {
            DEFAULT_ENDPOINT
        } else {
            endpoint
        }
        .trim_end_matches('/')
        .to_string();

        Ok(Self { http, base_url })
    }

    fn url(&self, model: &str, operation: &str) -> String {
        format!(
            "{}/{}/models/{}:{}",
            self.base_url, API_VERSION, model, operation
        )
    }

    fn check_model(model: &str) -> Result<(), ChatError> {
        if model.to_lowercase().starts_with(MODEL_PREFIX) {
            Ok(())
        } else {
            Err(ChatError::WrongProvider {
                vendor: "gemini".to_string(),
                model: model.to_string(),
            })
        }
    }

    fn build_body(request: &ChatRequest) -> GenerateContentRequest {
        let mut system = Vec::new();
        let mut contents = Vec::new();

        for message in &request.messages {
            let part = Part {
                text: Some(message.content.clone()),
            };
            match message.role.as_str() {
                "system" => system.push(part),
                "assistant" => contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![part],
                }),
                _ => contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![part],
                }),
            }
        }

        GenerateContentRequest {
            contents,
            system_instruction: (!system.is_empty()).then(|| Content {
                role: None,
                parts: system,
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                max_output_tokens: request.max_tokens,
            },
        }
    }

    /// Token count of every rendered part, system text included.
    async fn count_tokens(&self, request: &ChatRequest) -> Result<u32, ChatError> {
        let body = CountTokensRequest {
            contents: request
                .messages
                .iter()
                .map(|m| Content {
                    role: Some(if m.role == "assistant" { "model" } else { "user" }.to_string()),
                    parts: vec![Part {
                        text: Some(m.content.clone()),
                    }],
                })
                .collect(),
        };

        let response = self
            .http
            .post(self.url(&request.model, "countTokens"))
            .json(&body)
            .send()
            .await?;
        let text = Self::success_body(response).await?;
        let counted: CountTokensResponse =
            serde_json::from_str(&text).map_err(|e| ChatError::Decode(e.to_string()))?;
        Ok(counted.total_tokens)
    }

    async fn success_body(response: reqwest::Response) -> Result<String, ChatError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Self::status_error(status.as_u16(), &text));
        }
        Ok(text)
    }

    fn status_error(status: u16, body: &str) -> ChatError {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.to_string());
        ChatError::Gemini { status, message }
    }
}

/// Pop every complete `data:` payload out of `buffer`.
fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        if let Some(data) = line.trim_end().strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() && data != "[DONE]" {
                payloads.push(data.to_string());
            }
        }
    }
    payloads
}

#[async_trait]
impl ChatProvider for GeminiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResult, ChatError> {
        Self::check_model(&request.model)?;
        let prompt_tokens = self.count_tokens(request).await?;

        let response = self
            .http
            .post(self.url(&request.model, "generateContent"))
            .json(&Self::build_body(request))
            .send()
            .await?;
        let text = Self::success_body(response).await?;
        let body: GenerateContentResponse =
            serde_json::from_str(&text).map_err(|e| ChatError::Decode(e.to_string()))?;

        let choices = body.choices();
        if choices.is_empty() {
            return Err(ChatError::EmptyResponse);
        }

        Ok(ChatResult {
            choices,
            usage: TokenUsage::new(prompt_tokens, body.completion_tokens()),
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ChatError> {
        Self::check_model(&request.model)?;
        let prompt_tokens = self.count_tokens(&request).await?;

        let url = format!("{}?alt=sse", self.url(&request.model, "streamGenerateContent"));
        let response = self
            .http
            .post(url)
            .json(&Self::build_body(&request))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            return Err(Self::status_error(status.as_u16(), &text));
        }

        Ok(ChatStream::spawn(cancel, move |sink, cancel| async move {
            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut completion = 0u32;
            let mut produced = false;

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Gemini stream cancelled by consumer");
                        sink.cancelled();
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };

                let finished = match chunk {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        false
                    }
                    Some(Err(e)) => {
                        sink.fail(ChatError::Http(e)).await;
                        return;
                    }
                    // Flush a trailing line that lacks its newline.
                    None => {
                        buffer.push(b'\n');
                        true
                    }
                };

                for data in drain_sse_data(&mut buffer) {
                    let value: serde_json::Value = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            sink.fail(ChatError::Decode(e.to_string())).await;
                            return;
                        }
                    };
                    if value.get("error").is_some() {
                        sink.fail(GeminiClient::status_error(200, &data)).await;
                        return;
                    }
                    let parsed: GenerateContentResponse = match serde_json::from_value(value) {
                        Ok(p) => p,
                        Err(e) => {
                            sink.fail(ChatError::Decode(e.to_string())).await;
                            return;
                        }
                    };

                    // usageMetadata is cumulative; per-candidate counts are per chunk.
                    match parsed.usage_metadata.as_ref().map(|u| u.candidates_token_count) {
                        Some(n) if n > 0 => completion = n,
                        _ => {
                            completion += parsed.candidates.iter().map(|c| c.token_count).sum::<u32>()
                        }
                    }

                    let choices = parsed.choices();
                    if !choices.is_empty() {
                        produced = true;
                        if !sink.partial(choices).await {
                            return;
                        }
                    }
                }

                if finished {
                    break;
                }
            }

            if produced {
                sink.finish(TokenUsage::new(prompt_tokens, completion)).await;
            } else {
                sink.fail(ChatError::EmptyResponse).await;
            }
        }))
    }
}
