use crate::core::{GatewayError, ResolveError};
use crate::reports::ReportError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),

    /// Unauthorized (401)
    Unauthorized(String),

    /// Forbidden (403)
    Forbidden(String),

    /// Not found (404)
    NotFound(String),

    /// Internal server error (500)
    InternalError(String),

    /// Upstream vendor failure (502)
    BadGateway(String),
}

impl ApiError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get error code for JSON response
    pub fn error_code(&self) -> u32 {
        u32::from(self.status_code().as_u16())
    }

    pub fn message(&self) -> String {
        match self {
            Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::InternalError(msg)
            | Self::BadGateway(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message(),
            "error_code": self.error_code(),
        });

        (self.status_code(), axum::Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", err);
        Self::InternalError("Internal server error".to_string())
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::PromptNotFound(_) => Self::NotFound(err.to_string()),
            GatewayError::UnknownProjectToken => Self::Unauthorized(err.to_string()),
            GatewayError::Disabled(_) => Self::Forbidden(err.to_string()),
            GatewayError::Resolve(ResolveError::ProjectNotFound(_)) => {
                Self::NotFound(err.to_string())
            }
            GatewayError::Resolve(ResolveError::Storage(e)) | GatewayError::Storage(e) => e.into(),
            GatewayError::Chat(e) => {
                tracing::warn!("Vendor call failed: {}", e);
                Self::BadGateway(e.to_string())
            }
        }
    }
}

impl From<ReportError> for ApiError {
    fn from(err: ReportError) -> Self {
        match err {
            ReportError::InvalidArgument(msg) => Self::BadRequest(msg),
            ReportError::Aggregation { .. } => {
                tracing::error!("{}", err);
                Self::InternalError(err.to_string())
            }
        }
    }
}
