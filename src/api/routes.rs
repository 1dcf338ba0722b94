use crate::api::{ApiError, ApiResponse, AppState, ExecuteBody, HealthResponse, ReportQuery};
use crate::core::{ClientInfo, ExecuteRequest, PromptRef};
use crate::llm::StreamEvent;
use crate::reports::MonthOutcome;
use crate::storage::{Storage, WebhookDeliveryAttempt};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Response,
};
use axum::Json;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;

pub const PROJECT_TOKEN_HEADER: &str = "x-project-token";
pub const USER_ID_HEADER: &str = "x-user-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    header(headers, USER_ID_HEADER)
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("X-User-Id header is required".to_string()))
}

/// Project id for the caller's `X-Project-Token`.
async fn require_project<S: Storage + 'static>(
    state: &AppState<S>,
    headers: &HeaderMap,
) -> Result<i64, ApiError> {
    let token = header(headers, PROJECT_TOKEN_HEADER)
        .ok_or_else(|| ApiError::Unauthorized("X-Project-Token header is required".to_string()))?;
    Ok(state.gateway.project_for_token(token).await?)
}

/// First hop of `X-Forwarded-For`, else the socket peer.
fn client_info(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientInfo {
    let ip = header(headers, FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default();
    let user_agent = header(headers, axum::http::header::USER_AGENT.as_str())
        .unwrap_or_default()
        .to_string();
    ClientInfo { ip, user_agent }
}

/// GET /health
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            gateway: "promptgate".to_string(),
        }),
    )
}

/// POST /api/prompts/:public_id/execute
///
/// Answers with the completion as JSON, or as server-sent events when the
/// body asks for `stream`. Closing the event stream cancels the vendor call.
pub async fn execute_prompt<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(public_id): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> Result<Response, ApiError> {
    let project_id = require_project(&state, &headers).await?;
    let user_id = require_user(&headers)?;

    let mut request = ExecuteRequest::new(PromptRef::PublicId(public_id), user_id)
        .with_variables(body.variables);
    request.project_id = Some(project_id);
    request.client = client_info(&headers, peer.map(|ConnectInfo(addr)| addr));

    if !body.stream {
        let response = state.gateway.execute(request).await?;
        return Ok(Json(response).into_response());
    }

    let stream = state.gateway.execute_stream(request).await?;
    let events = stream.map(|event| match event {
        StreamEvent::Partial(choices) => Event::default().event("partial").json_data(choices),
        StreamEvent::Usage(usage) => Event::default().event("usage").json_data(usage),
        StreamEvent::Done => Ok(Event::default().event("done").data("[DONE]")),
        StreamEvent::Error(e) => Ok(Event::default().event("error").data(e.to_string())),
    });

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// GET /api/reports?from=YYYY-MM&to=YYYY-MM
pub async fn list_reports<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Query(query): Query<ReportQuery>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;

    if query.status {
        let outcomes: Vec<MonthOutcome> = state
            .reports
            .reports_with_status(&user_id, &query.from, &query.to)
            .await?;
        return Ok(Json(ApiResponse::success(outcomes)).into_response());
    }

    let reports = state
        .reports
        .reports(&user_id, &query.from, &query.to)
        .await?;
    Ok(Json(ApiResponse::success(reports)).into_response())
}

/// GET /api/webhooks/:id/deliveries
///
/// Only webhooks registered on the caller's project are visible.
pub async fn list_deliveries<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(webhook_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<WebhookDeliveryAttempt>>>, ApiError> {
    let project_id = require_project(&state, &headers).await?;
    state
        .storage
        .get_webhook(webhook_id)
        .await?
        .filter(|webhook| webhook.project_id == project_id)
        .ok_or_else(|| ApiError::NotFound(format!("webhook {} not found", webhook_id)))?;

    let deliveries = state.storage.list_webhook_deliveries(webhook_id).await?;
    Ok(Json(ApiResponse::success(deliveries)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_info_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let info = client_info(&headers, Some(peer));
        assert_eq!(info.ip, "203.0.113.7");
        assert_eq!(info.user_agent, "curl/8.0");
    }

    #[test]
    fn test_client_info_falls_back_to_peer() {
        let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        let info = client_info(&HeaderMap::new(), Some(peer));
        assert_eq!(info.ip, "192.0.2.1");
        assert_eq!(info.user_agent, "");

        assert_eq!(client_info(&HeaderMap::new(), None).ip, "");
    }

    #[test]
    fn test_require_user() {
        let mut headers = HeaderMap::new();
        assert!(require_user(&headers).is_err());
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" u-42 "));
        assert_eq!(require_user(&headers).unwrap(), "u-42");
    }
}
