//! Request bodies accepted by the HTTP surface
//!
//! Shape checks live here; policy checks (token bounds, hold limits) stay in
//! the core so every caller gets them.

use serde::{Deserialize, Serialize};
use validator::Validate;
use wallet_core::{
    authorization::{CaptureAuthorization, CreateAuthorization, VoidAuthorization},
    purchase::CreatePurchase,
    wallet::{AdminCredit, AdminPromo, DeductRequest},
    Feature, Provider, TokenType,
};

/// Create hold
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateAuthorizationBody {
    pub feature: Feature,
    #[validate(range(min = 1))]
    #[serde(default = "one")]
    pub units: i64,
    #[validate(range(min = 1))]
    pub cost_per_unit: i64,
    #[validate(length(min = 1, max = 200))]
    pub resource_key: String,
    pub token_type: Option<TokenType>,
    pub metadata: Option<serde_json::Value>,
}

fn one() -> i64 {
    1
}

impl From<CreateAuthorizationBody> for CreateAuthorization {
    fn from(body: CreateAuthorizationBody) -> Self {
        Self {
            feature: body.feature,
            units: body.units,
            cost_per_unit: body.cost_per_unit,
            resource_key: body.resource_key,
            token_type: body.token_type,
            metadata: body.metadata,
        }
    }
}

/// Capture hold
#[derive(Debug, Default, Deserialize, Serialize, Validate)]
pub struct CaptureBody {
    #[validate(length(min = 1, max = 200))]
    pub result_id: Option<String>,
    #[validate(length(max = 64))]
    pub status: Option<String>,
}

impl From<CaptureBody> for CaptureAuthorization {
    fn from(body: CaptureBody) -> Self {
        Self {
            result_id: body.result_id,
            status: body.status,
        }
    }
}

/// Void hold
#[derive(Debug, Default, Deserialize, Serialize, Validate)]
pub struct VoidBody {
    #[validate(length(max = 64))]
    pub status: Option<String>,
    #[validate(length(max = 64))]
    pub failure_code: Option<String>,
    #[validate(length(max = 1000))]
    pub failure_msg: Option<String>,
}

impl From<VoidBody> for VoidAuthorization {
    fn from(body: VoidBody) -> Self {
        Self {
            status: body.status,
            failure_code: body.failure_code,
            failure_msg: body.failure_msg,
        }
    }
}

/// Single-shot debit
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct DeductBody {
    pub feature: Feature,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 200))]
    pub resource_key: String,
    pub token_type: Option<TokenType>,
    pub metadata: Option<serde_json::Value>,
}

impl From<DeductBody> for DeductRequest {
    fn from(body: DeductBody) -> Self {
        Self {
            feature: body.feature,
            amount: body.amount,
            resource_key: body.resource_key,
            token_type: body.token_type,
            metadata: body.metadata,
        }
    }
}

/// Token purchase intent
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct PurchaseBody {
    #[validate(range(min = 1))]
    pub tokens: i64,
    pub provider: Provider,
}

impl From<PurchaseBody> for CreatePurchase {
    fn from(body: PurchaseBody) -> Self {
        Self {
            tokens: body.tokens,
            provider: body.provider,
        }
    }
}

/// Admin seed or refund
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct AdminCreditBody {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 200))]
    pub resource_key: Option<String>,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

impl From<AdminCreditBody> for AdminCredit {
    fn from(body: AdminCreditBody) -> Self {
        Self {
            amount: body.amount,
            resource_key: body.resource_key,
            note: body.note,
        }
    }
}

/// Admin promo grant
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct AdminPromoBody {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(range(min = 1, max = 365))]
    pub ttl_days: Option<i64>,
    #[validate(length(min = 1, max = 200))]
    pub resource_key: Option<String>,
}

impl From<AdminPromoBody> for AdminPromo {
    fn from(body: AdminPromoBody) -> Self {
        Self {
            amount: body.amount,
            ttl_days: body.ttl_days,
            resource_key: body.resource_key,
        }
    }
}

/// `?cursor&limit` for ledger history
#[derive(Debug, Default, Deserialize, Validate)]
pub struct HistoryQuery {
    pub cursor: Option<String>,
    #[validate(range(min = 1, max = 200))]
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_default_to_one() {
        let body: CreateAuthorizationBody = serde_json::from_value(serde_json::json!({
            "feature": "chapter_generation",
            "cost_per_unit": 10,
            "resource_key": "chapter-1"
        }))
        .unwrap();
        assert_eq!(body.units, 1);
        assert!(body.validate().is_ok());
    }

    #[test]
    fn test_empty_resource_key_rejected() {
        let body = DeductBody {
            feature: Feature::TestGeneration,
            amount: 5,
            resource_key: String::new(),
            token_type: None,
            metadata: None,
        };
        let errors = body.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("resource_key"));
    }

    #[test]
    fn test_promo_ttl_bounds() {
        let body = AdminPromoBody {
            amount: 10,
            ttl_days: Some(400),
            resource_key: None,
        };
        assert!(body.validate().is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let parsed: Result<PurchaseBody, _> =
            serde_json::from_value(serde_json::json!({"tokens": 100, "provider": "paypal"}));
        assert!(parsed.is_err());
    }
}
