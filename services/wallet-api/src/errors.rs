use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;
use wallet_core::Error as WalletError;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Missing required scope")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        if status_code.is_server_error() {
            tracing::error!(status = status_code.as_u16(), "request failed: {}", self);
        }

        let mut error = json!({
            "code": self.error_code(),
            "status": status_code.as_u16(),
            "message": self.public_message(),
        });
        if let Some(field) = self.field() {
            error["field"] = json!(field);
        }

        let mut response = HttpResponse::build(status_code);
        if let ApiError::Wallet(WalletError::IdempotencyInProgress { retry_after_secs }) = self {
            response.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        response.json(json!({ "error": error }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Wallet(err) => match err {
                WalletError::Validation { .. } | WalletError::IdempotencyKeyReused => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                WalletError::InsufficientBalance { .. } | WalletError::InsufficientTokens { .. } => {
                    StatusCode::PAYMENT_REQUIRED
                }
                WalletError::Conflict(_)
                | WalletError::DuplicateResource { .. }
                | WalletError::IdempotencyInProgress { .. } => StatusCode::CONFLICT,
                WalletError::NotFound(_) => StatusCode::NOT_FOUND,
                WalletError::SignatureInvalid => StatusCode::BAD_REQUEST,
                WalletError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
                WalletError::ReceiptCollision(_)
                | WalletError::Storage(_)
                | WalletError::Config(_)
                | WalletError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Wallet(err) => err.code(),
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn field(&self) -> Option<String> {
        match self {
            ApiError::Wallet(WalletError::Validation { field, .. }) => Some(field.clone()),
            ApiError::Validation(errors) => errors.field_errors().keys().next().map(|f| f.to_string()),
            _ => None,
        }
    }

    /// Storage details stay in the logs outside debug builds
    fn public_message(&self) -> String {
        if self.status_code().is_server_error() && !cfg!(debug_assertions) {
            return "internal error".to_string();
        }
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    async fn body(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.error_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[actix_web::test]
    async fn test_validation_carries_field() {
        let (status, json) = body(WalletError::validation("tokens", "too few").into()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"]["code"], "validation_error");
        assert_eq!(json["error"]["field"], "tokens");
    }

    #[actix_web::test]
    async fn test_insufficient_tokens_is_402() {
        let err: ApiError = WalletError::InsufficientTokens {
            required: 10,
            available: 3,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
    }

    #[actix_web::test]
    async fn test_in_progress_sets_retry_after() {
        let err: ApiError = WalletError::IdempotencyInProgress { retry_after_secs: 2 }.into();
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "2");
    }

    #[actix_web::test]
    async fn test_upstream_and_signature_mapping() {
        let upstream: ApiError = WalletError::UpstreamUnavailable("timeout".into()).into();
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);
        let signature: ApiError = WalletError::SignatureInvalid.into();
        assert_eq!(signature.status_code(), StatusCode::BAD_REQUEST);
    }
}
