mod common;

use chrono::{DateTime, Utc};
use common::{project, prompt, provider, webhook, FakeAdapter};
use promptgate::cache::MemoryCache;
use promptgate::core::{ExecuteRequest, PromptRef};
use promptgate::llm::CostCalculator;
use promptgate::reports::ReportService;
use promptgate::storage::sqlite::SqliteStorage;
use promptgate::storage::{CallRecord, ResultCode, Storage, EVENT_PROMPT_FINISHED};
use promptgate::{Config, PromptGateway};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn open() -> (TempDir, SqliteStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::new(dir.path().join("data").join("promptgate.db"))
        .await
        .unwrap();
    (dir, storage)
}

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn record(user: &str, cost: f64, when: &str) -> CallRecord {
    CallRecord {
        id: uuid::Uuid::new_v4().to_string(),
        prompt_id: 10,
        project_id: 1,
        provider_id: Some(1),
        model: "gpt-4o".to_string(),
        user_id: user.to_string(),
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
        duration_ms: 42,
        result: ResultCode::Success,
        cached: false,
        cost_cents: cost,
        debug_message: None,
        created_at: at(when),
    }
}

#[tokio::test]
async fn test_entities_round_trip() {
    let (_dir, storage) = open().await;

    let mut entity = provider(1, "Primary", "gpt-4o");
    entity.headers = HashMap::from([("x-tenant".to_string(), "acme".to_string())]);
    entity.config = Some(serde_json::json!({ "region": "eu" }));
    storage.create_provider(&entity).await.unwrap();
    storage.create_project(&project(1, "tok-1", Some(1))).await.unwrap();
    storage.create_prompt(&prompt(10, "pr_hello", 1, None)).await.unwrap();

    let loaded = storage.get_provider(1).await.unwrap().unwrap();
    assert_eq!(loaded.headers["x-tenant"], "acme");
    assert_eq!(loaded.config.unwrap()["region"], "eu");

    let project = storage.get_project_by_token("tok-1").await.unwrap().unwrap();
    assert_eq!(project.id, 1);
    assert_eq!(project.legacy.openai_model, "gpt-3.5-turbo");
    assert!(storage.get_project_by_token("nope").await.unwrap().is_none());

    let prompt = storage.get_prompt_by_public_id("pr_hello").await.unwrap().unwrap();
    assert_eq!(prompt.prompts.len(), 2);
    assert_eq!(prompt.prompts[1].text, "Hello {{name}}");
    assert!(prompt.enabled);
    assert!(storage.get_prompt(99).await.unwrap().is_none());
}

#[tokio::test]
async fn test_call_records_use_half_open_ranges() {
    let (_dir, storage) = open().await;
    for r in [
        record("u1", 1.0, "2024-03-01T00:00:00Z"),
        record("u1", 2.0, "2024-03-31T23:59:59Z"),
        record("u1", 4.0, "2024-04-01T00:00:00Z"),
        record("u2", 8.0, "2024-03-15T00:00:00Z"),
    ] {
        storage.insert_call_record(r).await.unwrap();
    }

    let march = storage
        .list_call_records("u1", at("2024-03-01T00:00:00Z"), at("2024-04-01T00:00:00Z"))
        .await
        .unwrap();
    assert_eq!(march.len(), 2);
    assert_eq!(march[0].total_tokens, 15);
    assert_eq!(march[0].result, ResultCode::Success);
}

#[tokio::test]
async fn test_cost_report_upsert_replaces_snapshot() {
    let (_dir, storage) = open().await;
    let reports = ReportService::new(
        storage.clone(),
        Arc::new(MemoryCache::new(10)),
        Duration::from_secs(60),
    );
    let now = at("2024-06-01T00:00:00Z");

    let empty = reports
        .aggregate("u1", "2024-03".parse().unwrap(), now)
        .await
        .unwrap();
    storage.upsert_cost_report(&empty).await.unwrap();

    storage
        .insert_call_record(record("u1", 3.5, "2024-03-10T12:00:00Z"))
        .await
        .unwrap();
    let full = reports
        .aggregate("u1", "2024-03".parse().unwrap(), now)
        .await
        .unwrap();
    storage.upsert_cost_report(&full).await.unwrap();

    let stored = storage.get_cost_report("u1", "2024-03").await.unwrap().unwrap();
    assert_eq!(stored, full);
    assert_eq!(stored.totals.calls, 1);
    assert!(storage.get_cost_report("u1", "2024-02").await.unwrap().is_none());
}

#[tokio::test]
async fn test_webhook_registrations_filter_by_event_and_enabled() {
    let (_dir, storage) = open().await;
    storage.create_webhook(&webhook(1, 1, "http://a/hook")).await.unwrap();
    let mut disabled = webhook(2, 1, "http://b/hook");
    disabled.enabled = false;
    storage.create_webhook(&disabled).await.unwrap();
    let mut other_event = webhook(3, 1, "http://c/hook");
    other_event.event = "onSomethingElse".to_string();
    storage.create_webhook(&other_event).await.unwrap();

    let enabled = storage
        .list_enabled_webhooks(1, EVENT_PROMPT_FINISHED)
        .await
        .unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].id, 1);

    let loaded = storage.get_webhook(2).await.unwrap().unwrap();
    assert_eq!(loaded.url, "http://b/hook");
    assert!(!loaded.enabled);
    assert!(storage.get_webhook(99).await.unwrap().is_none());
}

#[tokio::test]
async fn test_gateway_over_sqlite_meters_calls() {
    let (_dir, storage) = open().await;
    storage.create_provider(&provider(1, "Primary", "gpt-4o")).await.unwrap();
    storage.create_project(&project(1, "tok-1", None)).await.unwrap();
    storage.create_prompt(&prompt(10, "pr_hello", 1, Some(1))).await.unwrap();

    let gateway = PromptGateway::new(
        storage.clone(),
        FakeAdapter::new(),
        Arc::new(CostCalculator::builtin().unwrap()),
        Arc::new(MemoryCache::new(100)),
        &Config::default(),
    )
    .unwrap();

    let request = ExecuteRequest::new(PromptRef::PublicId("pr_hello".to_string()), "u1")
        .with_variables(common::vars(&[("name", "Ada")]));
    let response = gateway.execute(request).await.unwrap();
    gateway.drain().await;

    let records = storage
        .list_call_records("u1", at("2000-01-01T00:00:00Z"), Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, response.record_id);
    assert_eq!(records[0].provider_id, Some(1));
    assert_eq!(records[0].debug_message.as_deref(), Some("Hello Ada"));
}
