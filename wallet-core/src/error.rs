//! Error types for the wallet

use crate::types::TokenType;
use thiserror::Error;
use uuid::Uuid;

/// Result type for wallet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wallet errors
///
/// Every variant maps onto exactly one client-visible error code (see
/// [`Error::code`]). Storage and upstream details stay in the `Display`
/// output and are meant for logs, not for clients.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input shape or range
    #[error("Validation error on `{field}`: {message}")]
    Validation {
        /// Offending field
        field: String,
        /// Human readable reason
        message: String,
    },

    /// A debit would drive a balance negative
    #[error("Insufficient {token_type} balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Token type that ran short (promo-first debits report `regular`)
        token_type: TokenType,
        /// Amount requested
        required: i64,
        /// Amount that could be spent
        available: i64,
    },

    /// A hold does not fit into the spendable balance
    #[error("Insufficient tokens: required {required}, available {available}")]
    InsufficientTokens {
        /// Amount to hold
        required: i64,
        /// Balance minus open holds
        available: i64,
    },

    /// Resource state does not allow the operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A resource key was already consumed by an earlier posting or hold
    #[error("Duplicate resource `{resource_key}` (already recorded as {existing_id})")]
    DuplicateResource {
        /// The replayed resource key
        resource_key: String,
        /// Ledger transaction or authorization that owns the key
        existing_id: Uuid,
    },

    /// Another request with the same idempotency key is still running
    #[error("Request with the same idempotency key is in progress")]
    IdempotencyInProgress {
        /// Suggested client back-off
        retry_after_secs: u64,
    },

    /// Idempotency key reused with a different request body
    #[error("Idempotency key was already used with a different request")]
    IdempotencyKeyReused,

    /// Missing resource, or a resource owned by someone else
    #[error("Not found: {0}")]
    NotFound(String),

    /// Webhook signature did not verify
    #[error("Webhook signature invalid")]
    SignatureInvalid,

    /// Payment provider unreachable or failing
    #[error("Payment provider unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Two receipts raced for the same number; the settlement must be retried
    #[error("Receipt number collision: {0}")]
    ReceiptCollision(String),

    /// Transaction or constraint failure in the store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a field validation failure
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable, client-facing error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::InsufficientTokens { .. } => "insufficient_tokens",
            Error::Conflict(_) => "conflict",
            Error::DuplicateResource { .. } => "duplicate_resource",
            Error::IdempotencyInProgress { .. } => "idempotency_in_progress",
            Error::IdempotencyKeyReused => "idempotency_key_reused",
            Error::NotFound(_) => "not_found",
            Error::SignatureInvalid => "signature_invalid",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::ReceiptCollision(_) | Error::Storage(_) | Error::Serialization(_) => {
                "storage_error"
            }
            Error::Config(_) => "configuration_error",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable(_)
                | Error::Storage(_)
                | Error::ReceiptCollision(_)
                | Error::IdempotencyInProgress { .. }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(format!("migration failed: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::UpstreamUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::validation("tokens", "too small").code(), "validation_error");
        assert_eq!(Error::SignatureInvalid.code(), "signature_invalid");
        assert_eq!(
            Error::InsufficientTokens {
                required: 10,
                available: 0
            }
            .code(),
            "insufficient_tokens"
        );
        assert_eq!(Error::Storage("boom".into()).code(), "storage_error");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::UpstreamUnavailable("timeout".into()).is_retryable());
        assert!(Error::Storage("deadlock".into()).is_retryable());
        assert!(!Error::Conflict("captured".into()).is_retryable());
        assert!(!Error::SignatureInvalid.is_retryable());
    }

    #[test]
    fn test_validation_display_names_field() {
        let err = Error::validation("units", "must be at least 1");
        assert!(err.to_string().contains("`units`"));
    }
}
