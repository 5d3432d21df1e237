//! Authorization engine (hold → capture / void / expire)
//!
//! A hold reserves tokens without touching the ledger. Capturing it writes a
//! single `authorization_capture` debit; voiding or expiring it releases the
//! reservation. Every transition is a compare-and-set on `held`.

use crate::{
    config::AuthorizationConfig,
    ledger::record_posting,
    metrics,
    store::{CaptureOutcome, CaptureRequest, VoidOutcome, VoidRequest, WalletStore},
    types::{
        Authorization, AuthorizationStatus, BalancesView, Feature, NewAuthorization,
        RequestContext, TokenType,
    },
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hold request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAuthorization {
    /// Gated feature
    pub feature: Feature,
    /// Units to reserve
    pub units: i64,
    /// Tokens per unit
    pub cost_per_unit: i64,
    /// Unit of work the hold is for
    pub resource_key: String,
    /// Optional bucket pin
    #[serde(default)]
    pub token_type: Option<TokenType>,
    /// Caller metadata
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Capture request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureAuthorization {
    /// Produced artefact id
    #[serde(default)]
    pub result_id: Option<String>,
    /// Status reported by the generator
    #[serde(default)]
    pub status: Option<String>,
}

/// Void request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoidAuthorization {
    /// Status reported by the generator
    #[serde(default)]
    pub status: Option<String>,
    /// Failure code
    #[serde(default)]
    pub failure_code: Option<String>,
    /// Failure message
    #[serde(default)]
    pub failure_msg: Option<String>,
}

/// Response of a created hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCreated {
    /// Hold id
    pub authorization_id: Uuid,
    /// Always `held`
    pub status: AuthorizationStatus,
    /// Reserved tokens
    pub held_amount: i64,
    /// Deadline
    pub hold_expires_at: DateTime<Utc>,
}

/// Response of a capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Hold id
    pub authorization_id: Uuid,
    /// Always `captured`
    pub status: AuthorizationStatus,
    /// Tokens debited
    pub debited: i64,
    /// Ledger transaction of the debit
    pub transaction_id: Option<Uuid>,
    /// Produced artefact id
    pub result_id: Option<String>,
    /// True when an earlier capture already happened
    pub already_captured: bool,
    /// Balances after the capture
    pub balances: BalancesView,
}

/// Response of a void
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidResult {
    /// Hold id
    pub authorization_id: Uuid,
    /// Always `voided`
    pub status: AuthorizationStatus,
    /// Reservation released
    pub refunded: i64,
    /// True when the hold was voided before
    pub already_voided: bool,
    /// Balances after the void (unchanged, the reservation was virtual)
    pub balances: BalancesView,
}

/// Hold/capture/void engine
pub struct AuthorizationEngine {
    store: Arc<dyn WalletStore>,
    config: AuthorizationConfig,
}

impl AuthorizationEngine {
    /// Create engine
    pub fn new(store: Arc<dyn WalletStore>, config: AuthorizationConfig) -> Self {
        Self { store, config }
    }

    /// Reserve `units × cost_per_unit` tokens
    pub async fn create(
        &self,
        ctx: &RequestContext,
        request: CreateAuthorization,
    ) -> Result<AuthorizationCreated> {
        self.validate(&request)?;

        let now = Utc::now();
        let new = NewAuthorization {
            user_id: ctx.user_id.clone(),
            feature: request.feature,
            units: request.units,
            cost_per_unit: request.cost_per_unit,
            token_type: request.token_type,
            resource_key: request.resource_key,
            metadata: request
                .metadata
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            hold_expires_at: now + Duration::seconds(self.config.hold_ttl_secs),
        };

        let authorization = match self.store.create_authorization(new, now).await {
            Ok(a) => a,
            Err(e) => {
                if matches!(e, Error::InsufficientTokens { .. }) {
                    metrics::AUTHORIZATIONS_TOTAL
                        .with_label_values(&["rejected"])
                        .inc();
                }
                return Err(e);
            }
        };

        metrics::AUTHORIZATIONS_TOTAL.with_label_values(&["held"]).inc();
        info!(
            request_id = %ctx.request_id,
            user_id = %ctx.user_id,
            authorization_id = %authorization.id,
            feature = %authorization.feature,
            held_amount = authorization.held_amount,
            "tokens held"
        );

        Ok(AuthorizationCreated {
            authorization_id: authorization.id,
            status: authorization.status,
            held_amount: authorization.held_amount,
            hold_expires_at: authorization.hold_expires_at,
        })
    }

    /// Hold owned by the caller
    pub async fn get(&self, ctx: &RequestContext, id: Uuid) -> Result<Authorization> {
        self.store
            .get_authorization(id, &ctx.user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("authorization {}", id)))
    }

    /// Debit the held amount and close the hold
    pub async fn capture(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        request: CaptureAuthorization,
    ) -> Result<CaptureResult> {
        let outcome = self
            .store
            .capture_authorization(CaptureRequest {
                authorization_id: id,
                user_id: ctx.user_id.clone(),
                result_id: request.result_id,
                upstream_status: request.status,
                idempotency_key: ctx.idempotency_key.clone(),
                now: Utc::now(),
            })
            .await?;

        match outcome {
            CaptureOutcome::Captured {
                authorization,
                posted,
            } => {
                record_posting(&posted);
                metrics::AUTHORIZATIONS_TOTAL
                    .with_label_values(&["captured"])
                    .inc();
                info!(
                    request_id = %ctx.request_id,
                    user_id = %ctx.user_id,
                    authorization_id = %id,
                    debited = posted.amount(),
                    "hold captured"
                );
                Ok(CaptureResult {
                    authorization_id: authorization.id,
                    status: authorization.status,
                    debited: posted.amount(),
                    transaction_id: Some(posted.transaction_id),
                    result_id: authorization.result_id,
                    already_captured: false,
                    balances: posted.balances.view(),
                })
            }
            CaptureOutcome::AlreadyCaptured(authorization) => {
                debug!(authorization_id = %id, "capture replayed on captured hold");
                let balances = match authorization.balances_after {
                    Some(balances) => balances,
                    None => self.store.balances(&ctx.user_id).await?.view(),
                };
                Ok(CaptureResult {
                    authorization_id: authorization.id,
                    status: authorization.status,
                    debited: authorization.debited.unwrap_or(authorization.held_amount),
                    transaction_id: authorization.capture_transaction_id,
                    result_id: authorization.result_id,
                    already_captured: true,
                    balances,
                })
            }
            CaptureOutcome::Expired(_) => {
                metrics::AUTHORIZATIONS_TOTAL
                    .with_label_values(&["expired"])
                    .inc();
                warn!(authorization_id = %id, "capture after hold deadline");
                Err(Error::Conflict(format!("authorization {} has expired", id)))
            }
            CaptureOutcome::NotCapturable(authorization) => Err(Error::Conflict(format!(
                "authorization {} is {}",
                id, authorization.status
            ))),
        }
    }

    /// Release the reservation
    pub async fn void(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        request: VoidAuthorization,
    ) -> Result<VoidResult> {
        let outcome = self
            .store
            .void_authorization(VoidRequest {
                authorization_id: id,
                user_id: ctx.user_id.clone(),
                upstream_status: request.status,
                failure_code: request.failure_code,
                failure_msg: request.failure_msg,
                now: Utc::now(),
            })
            .await?;

        let (authorization, already_voided) = match outcome {
            VoidOutcome::Voided(authorization) => {
                metrics::AUTHORIZATIONS_TOTAL.with_label_values(&["voided"]).inc();
                info!(
                    request_id = %ctx.request_id,
                    user_id = %ctx.user_id,
                    authorization_id = %id,
                    failure_code = authorization.failure_code.as_deref().unwrap_or(""),
                    "hold voided"
                );
                (authorization, false)
            }
            VoidOutcome::AlreadyVoided(authorization) => (authorization, true),
            VoidOutcome::NotVoidable(authorization) => {
                return Err(Error::Conflict(format!(
                    "authorization {} is {}",
                    id, authorization.status
                )))
            }
        };

        let balances = self.store.balances(&ctx.user_id).await?;
        Ok(VoidResult {
            authorization_id: authorization.id,
            status: authorization.status,
            refunded: authorization.held_amount,
            already_voided,
            balances: balances.view(),
        })
    }

    /// Expire holds past their deadline
    pub async fn expire_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Authorization>> {
        let expired = self.store.expire_authorizations(now, limit).await?;
        if !expired.is_empty() {
            metrics::AUTHORIZATIONS_TOTAL
                .with_label_values(&["expired"])
                .inc_by(expired.len() as u64);
            info!(count = expired.len(), "expired stale holds");
        }
        Ok(expired)
    }

    fn validate(&self, request: &CreateAuthorization) -> Result<()> {
        if request.units < 1 || request.units > self.config.max_units {
            return Err(Error::validation(
                "units",
                format!("must be between 1 and {}", self.config.max_units),
            ));
        }
        if request.cost_per_unit < 1 || request.cost_per_unit > self.config.max_cost_per_unit {
            return Err(Error::validation(
                "cost_per_unit",
                format!("must be between 1 and {}", self.config.max_cost_per_unit),
            ));
        }
        if request.resource_key.is_empty() || request.resource_key.len() > 255 {
            return Err(Error::validation(
                "resource_key",
                "must be between 1 and 255 characters",
            ));
        }
        if let Some(metadata) = &request.metadata {
            if !metadata.is_object() {
                return Err(Error::validation("metadata", "must be a JSON object"));
            }
        }
        Ok(())
    }
}
