//! Completion-event fan-out to registered third-party endpoints.

mod dispatcher;

pub use dispatcher::{looks_like_timeout, WebhookDispatcher};

use crate::llm::TokenUsage;
use crate::storage::ResultCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened during one invocation, as reported to webhooks.
#[derive(Debug, Clone)]
pub struct CompletionFacts {
    pub prompt_id: i64,
    pub user_id: String,
    pub result: ResultCode,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub usage: TokenUsage,
    pub cached: bool,
    pub ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: String,
    pub project_id: i64,
    pub prompt_id: i64,
    pub user_id: String,
    /// 0 on success, 1 on failure.
    pub result: u8,
    pub timestamp: DateTime<Utc>,
    pub duration: i64,
    pub tokens: TokenUsage,
    pub cached: bool,
    pub ip: String,
    pub user_agent: String,
}

impl WebhookPayload {
    pub fn new(project_id: i64, event: &str, facts: &CompletionFacts) -> Self {
        Self {
            event: event.to_string(),
            project_id,
            prompt_id: facts.prompt_id,
            user_id: facts.user_id.clone(),
            result: facts.result.code(),
            timestamp: facts.timestamp,
            duration: facts.duration_ms,
            tokens: facts.usage,
            cached: facts.cached,
            ip: facts.ip.clone(),
            user_agent: facts.user_agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EVENT_PROMPT_FINISHED;

    #[test]
    fn test_payload_wire_shape() {
        let facts = CompletionFacts {
            prompt_id: 7,
            user_id: "u1".to_string(),
            result: ResultCode::Failure,
            timestamp: DateTime::parse_from_rfc3339("2024-09-13T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            duration_ms: 120,
            usage: TokenUsage::new(10, 5),
            cached: true,
            ip: "10.0.0.1".to_string(),
            user_agent: "curl/8".to_string(),
        };

        let value = serde_json::to_value(WebhookPayload::new(3, EVENT_PROMPT_FINISHED, &facts)).unwrap();
        assert_eq!(value["event"], "onPromptFinished");
        assert_eq!(value["projectId"], 3);
        assert_eq!(value["promptId"], 7);
        assert_eq!(value["result"], 1);
        assert_eq!(value["duration"], 120);
        assert_eq!(value["tokens"]["total"], 15);
        assert_eq!(value["cached"], true);
        assert_eq!(value["userAgent"], "curl/8");
        assert!(value["timestamp"].as_str().unwrap().starts_with("2024-09-13T10:00:00"));
    }
}
