//! Externally visible gateway errors and their OpenAI-style JSON bodies.

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Every failure a caller can observe. Component errors convert into one of
/// these four kinds; the detail behind `Internal` is logged, never returned.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("daily request limit ({limit}) exceeded")]
    RateLimitExceeded { limit: i64 },

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Authentication(_) => 401,
            GatewayError::RateLimitExceeded { .. } => 429,
            GatewayError::BadGateway(_) => 502,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "invalid_api_key",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::BadGateway(_) => "upstream_error",
            GatewayError::Internal(_) => "internal_server_error",
        }
    }

    /// Message safe to show the caller.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Authentication(msg) | GatewayError::BadGateway(msg) => msg.clone(),
            GatewayError::RateLimitExceeded { limit } => {
                format!("Daily request limit ({limit}) exceeded")
            }
            GatewayError::Internal(_) => "Internal server error".to_string(),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.status(),
                message: self.public_message(),
                kind: self.kind(),
            },
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}
