use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Internal,
}

impl ErrorCode {
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 409 | 413 | 422 => Self::Validation,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the request/response API. The code is optional on
/// the wire; callers fall back to the HTTP status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct ApiException {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiException {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_response(status: u16, body: Option<ApiError>) -> Self {
        let fallback = ErrorCode::from_http_status(status);
        match body {
            Some(body) => Self {
                code: body.code.unwrap_or(fallback),
                message: if body.message.is_empty() {
                    format!("request failed with status {status}")
                } else {
                    body.message
                },
            },
            None => Self::new(fallback, format!("request failed with status {status}")),
        }
    }
}
