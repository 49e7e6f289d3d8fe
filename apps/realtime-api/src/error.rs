use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Structured error body returned on the HTTP surface.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Error taxonomy of the fan-out core.
///
/// `Validation` is returned before any side effect. `Persistence` means an
/// external store write failed and the operation was not applied.
/// `BackplaneUnavailable` is retryable: local delivery keeps working while
/// cross-instance delivery is degraded.
#[derive(Debug)]
pub enum FanoutError {
    Validation {
        message: String,
        details: Vec<FieldError>,
    },
    Persistence(String),
    BackplaneUnavailable,
    NotFound(String),
}

impl FanoutError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn fields(details: Vec<FieldError>) -> Self {
        Self::Validation {
            message: "Validation failed".to_string(),
            details,
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            FanoutError::Validation { .. } => "VALIDATION_ERROR",
            FanoutError::Persistence(_) => "PERSISTENCE_ERROR",
            FanoutError::BackplaneUnavailable => "BACKPLANE_UNAVAILABLE",
            FanoutError::NotFound(_) => "NOT_FOUND",
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FanoutError::BackplaneUnavailable)
    }
}

impl std::fmt::Display for FanoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanoutError::Validation { message, .. } => write!(f, "{message}"),
            FanoutError::Persistence(msg) => write!(f, "persistence failure: {msg}"),
            FanoutError::BackplaneUnavailable => {
                write!(f, "backplane unavailable (degraded, retry later)")
            }
            FanoutError::NotFound(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for FanoutError {}

impl IntoResponse for FanoutError {
    fn into_response(self) -> Response {
        let status = match &self {
            FanoutError::Validation { .. } => StatusCode::BAD_REQUEST,
            FanoutError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FanoutError::BackplaneUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            FanoutError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        let (code, message, details) = match self {
            FanoutError::Validation { message, details } => (
                "VALIDATION_ERROR",
                message,
                if details.is_empty() {
                    None
                } else {
                    Some(details)
                },
            ),
            FanoutError::Persistence(err) => {
                tracing::error!(%err, "persistence failure");
                (
                    "PERSISTENCE_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            FanoutError::BackplaneUnavailable => (
                "BACKPLANE_UNAVAILABLE",
                "Service degraded, retry later".to_string(),
                None,
            ),
            FanoutError::NotFound(message) => ("NOT_FOUND", message, None),
        };
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
