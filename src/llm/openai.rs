use super::{
    header_map, ChatChoice, ChatError, ChatMessage, ChatProvider, ChatRequest, ChatResult,
    ChatStream, ProviderDescriptor, TokenUsage,
};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionStreamOptions, CompletionUsage, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, Role,
    },
    Client as OpenAIClient,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// Client for any OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    client: OpenAIClient<OpenAIConfig>,
}

impl OpenAiClient {
    pub fn new(descriptor: &ProviderDescriptor) -> Result<Self, ChatError> {
        let mut config = OpenAIConfig::new().with_api_key(&descriptor.api_key);
        if !descriptor.endpoint.trim().is_empty() {
            config = config.with_api_base(descriptor.endpoint.trim_end_matches('/'));
        }

        let http = reqwest::Client::builder()
            .default_headers(header_map(&descriptor.headers)?)
            .build()?;
        let client = OpenAIClient::with_config(config).with_http_client(http);

        Ok(Self { client })
    }

    fn build(request: &ChatRequest, stream: bool) -> Result<CreateChatCompletionRequest, ChatError> {
        let messages = request
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&request.model)
            .messages(messages)
            .temperature(request.temperature);

        if let Some(top_p) = request.top_p {
            builder.top_p(top_p);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder.max_tokens(max_tokens);
        }
        if let Some(user) = &request.user {
            builder.user(user.clone());
        }
        if stream {
            builder
                .stream(true)
                .stream_options(ChatCompletionStreamOptions {
                    include_usage: true,
                });
        }

        Ok(builder.build()?)
    }
}

fn convert_message(msg: &ChatMessage) -> Result<ChatCompletionRequestMessage, ChatError> {
    let message = match msg.role.as_str() {
        "system" => ChatCompletionRequestSystemMessageArgs::default()
            .content(msg.content.clone())
            .build()?
            .into(),
        "assistant" => ChatCompletionRequestAssistantMessageArgs::default()
            .content(msg.content.clone())
            .build()?
            .into(),
        _ => ChatCompletionRequestUserMessageArgs::default()
            .content(msg.content.clone())
            .build()?
            .into(),
    };
    Ok(message)
}

fn role_name(role: &Role) -> String {
    serde_json::to_value(role)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "assistant".to_string())
}

fn usage_from(usage: Option<&CompletionUsage>) -> TokenUsage {
    usage
        .map(|u| TokenUsage {
            prompt: u.prompt_tokens,
            completion: u.completion_tokens,
            total: u.total_tokens,
        })
        .unwrap_or_default()
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResult, ChatError> {
        let response = self.client.chat().create(Self::build(request, false)?).await?;

        let choices: Vec<ChatChoice> = response
            .choices
            .iter()
            .map(|choice| ChatChoice {
                index: choice.index,
                role: role_name(&choice.message.role),
                content: choice.message.content.clone().unwrap_or_default(),
            })
            .collect();
        if choices.is_empty() {
            return Err(ChatError::EmptyResponse);
        }

        Ok(ChatResult {
            choices,
            usage: usage_from(response.usage.as_ref()),
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ChatError> {
        let body = Self::build(&request, true)?;
        let client = self.client.clone();

        Ok(ChatStream::spawn(cancel, move |sink, cancel| async move {
            let mut stream = match client.chat().create_stream(body).await {
                Ok(stream) => stream,
                Err(e) => {
                    sink.fail(e.into()).await;
                    return;
                }
            };
            let mut usage = TokenUsage::default();
            let mut produced = false;

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("OpenAI stream cancelled by consumer");
                        sink.cancelled();
                        return;
                    }
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(chunk)) => {
                        if chunk.usage.is_some() {
                            usage = usage_from(chunk.usage.as_ref());
                        }
                        let choices: Vec<ChatChoice> = chunk
                            .choices
                            .iter()
                            .filter_map(|choice| {
                                let content = choice.delta.content.clone()?;
                                Some(ChatChoice {
                                    index: choice.index,
                                    role: choice
                                        .delta
                                        .role
                                        .as_ref()
                                        .map(role_name)
                                        .unwrap_or_else(|| "assistant".to_string()),
                                    content,
                                })
                            })
                            .collect();
                        if !choices.is_empty() {
                            produced = true;
                            if !sink.partial(choices).await {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        sink.fail(e.into()).await;
                        return;
                    }
                    None => break,
                }
            }

            if produced {
                sink.finish(usage).await;
            } else {
                sink.fail(ChatError::EmptyResponse).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{StreamEvent, Vendor};
    use std::collections::HashMap;

    fn descriptor(endpoint: &str) -> ProviderDescriptor {
        let mut headers = HashMap::new();
        headers.insert("x-tenant".to_string(), "acme".to_string());
        ProviderDescriptor {
            source: Vendor::OpenAiCompatible,
            endpoint: endpoint.to_string(),
            api_key: "sk-test".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            temperature: 0.5,
            top_p: 0.0,
            max_tokens: 0,
            headers,
            config: None,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "Hello".to_string(),
            }],
            temperature: 0.5,
            top_p: None,
            max_tokens: Some(64),
            user: Some("user-9".to_string()),
        }
    }

    #[test]
    fn test_stream_request_asks_for_usage() {
        let body = serde_json::to_value(OpenAiClient::build(&request(), true).unwrap()).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["user"], "user-9");
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn test_large_max_tokens_pass_through() {
        let mut request = request();
        request.max_tokens = Some(100_000);
        let body = serde_json::to_value(OpenAiClient::build(&request, false).unwrap()).unwrap();
        assert_eq!(body["max_tokens"], 100_000);
    }

    fn chunk(choices: &str, usage: &str) -> String {
        format!(
            "data: {{\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":{},\"usage\":{}}}\n\n",
            choices, usage
        )
    }

    async fn serve_stream(server: &mut mockito::Server, body: String) -> mockito::Mock {
        server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "stream": true,
                "stream_options": { "include_usage": true },
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_stream_yields_partials_then_usage() {
        let mut server = mockito::Server::new_async().await;
        let body = [
            chunk(r#"[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]"#, "null"),
            chunk(r#"[{"index":0,"delta":{"content":"lo"}}]"#, "null"),
            chunk(r#"[{"index":0,"delta":{},"finish_reason":"stop"}]"#, "null"),
            chunk(
                "[]",
                r#"{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}"#,
            ),
            "data: [DONE]\n\n".to_string(),
        ]
        .concat();
        let mock = serve_stream(&mut server, body).await;

        let client = OpenAiClient::new(&descriptor(&server.url())).unwrap();
        let mut stream = client
            .chat_stream(request(), CancellationToken::new())
            .await
            .unwrap();

        match stream.next_event().await {
            Some(StreamEvent::Partial(choices)) => {
                assert_eq!(choices[0].content, "Hel");
                assert_eq!(choices[0].role, "assistant");
            }
            other => panic!("expected first partial, got {:?}", other),
        }
        match stream.next_event().await {
            Some(StreamEvent::Partial(choices)) => assert_eq!(choices[0].content, "lo"),
            other => panic!("expected second partial, got {:?}", other),
        }
        match stream.next_event().await {
            Some(StreamEvent::Usage(usage)) => assert_eq!(usage, TokenUsage::new(10, 5)),
            other => panic!("expected usage, got {:?}", other),
        }
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Done)));
        assert!(stream.next_event().await.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_without_content_is_empty_response() {
        let mut server = mockito::Server::new_async().await;
        let body = [
            chunk(r#"[{"index":0,"delta":{"role":"assistant"}}]"#, "null"),
            chunk(
                "[]",
                r#"{"prompt_tokens":10,"completion_tokens":0,"total_tokens":10}"#,
            ),
            "data: [DONE]\n\n".to_string(),
        ]
        .concat();
        serve_stream(&mut server, body).await;

        let client = OpenAiClient::new(&descriptor(&server.url())).unwrap();
        let mut stream = client
            .chat_stream(request(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            stream.next_event().await,
            Some(StreamEvent::Error(ChatError::EmptyResponse))
        ));
        assert!(stream.next_event().await.is_none());
    }

    /// Sends one chunk, then keeps the connection open without a terminator.
    async fn stalled_stream_endpoint(first: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut buf).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(first.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            // Drain until the client goes away.
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_with_cancelled() {
        let endpoint =
            stalled_stream_endpoint(chunk(r#"[{"index":0,"delta":{"content":"Hel"}}]"#, "null")).await;
        let client = OpenAiClient::new(&descriptor(&endpoint)).unwrap();
        let cancel = CancellationToken::new();
        let mut stream = client.chat_stream(request(), cancel.clone()).await.unwrap();

        assert!(matches!(stream.next_event().await, Some(StreamEvent::Partial(_))));

        cancel.cancel();
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next_event())
            .await
            .unwrap();
        assert!(matches!(next, Some(StreamEvent::Error(ChatError::Cancelled))));
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_chat_normalizes_choices_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_header("x-tenant", "acme")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"c1","object":"chat.completion","created":1,"model":"gpt-4o-mini",
                    "choices":[{"index":0,"message":{"role":"assistant","content":"Hi!"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            )
            .create_async()
            .await;

        let client = OpenAiClient::new(&descriptor(&server.url())).unwrap();
        let result = client.chat(&request()).await.unwrap();

        assert_eq!(result.choices.len(), 1);
        assert_eq!(result.choices[0].role, "assistant");
        assert_eq!(result.choices[0].content, "Hi!");
        assert_eq!(result.usage, TokenUsage::new(10, 5));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_chat_with_zero_choices_is_empty_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"c1","object":"chat.completion","created":1,"model":"gpt-4o-mini","choices":[]}"#,
            )
            .create_async()
            .await;

        let client = OpenAiClient::new(&descriptor(&server.url())).unwrap();
        let err = client.chat(&request()).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_vendor_error_passes_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"error":{"message":"Incorrect API key","type":"invalid_request_error","param":null,"code":"invalid_api_key"}}"#,
            )
            .create_async()
            .await;

        let client = OpenAiClient::new(&descriptor(&server.url())).unwrap();
        let err = client.chat(&request()).await.unwrap_err();
        assert!(matches!(err, ChatError::OpenAi(_)));
    }
}
