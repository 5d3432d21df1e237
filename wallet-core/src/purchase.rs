//! Token purchases and receipts
//!
//! The price is always computed here from configuration; the client only
//! chooses how many tokens it wants. The provider order is created before the
//! purchase row so that a failing provider leaves nothing behind.

use crate::{
    config::{ReceiptConfig, TokenPolicy},
    gateway::{GatewayRegistry, OrderRequest, CURRENCY},
    ledger::record_posting,
    metrics,
    store::{SettleOutcome, SettleRequest, WalletStore},
    types::{NewPurchase, Provider, Purchase, PurchaseStatus, Receipt, RequestContext, UserId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Purchase request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePurchase {
    /// Tokens to buy
    pub tokens: i64,
    /// Payment provider
    pub provider: Provider,
}

/// Response of a created purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseCreated {
    /// Purchase id
    pub purchase_id: Uuid,
    /// Always `created`
    pub status: PurchaseStatus,
    /// Tokens to be credited
    pub tokens: i64,
    /// Server-computed price in minor units
    pub inr_amount: i64,
    /// Currency code
    pub currency: String,
    /// Provider
    pub provider: Provider,
    /// Provider order id
    pub provider_order_id: String,
    /// What the client checkout needs from the provider
    pub provider_payload: serde_json::Value,
}

/// Purchases, settlement and receipts
pub struct PurchaseService {
    store: Arc<dyn WalletStore>,
    gateways: GatewayRegistry,
    policy: TokenPolicy,
    receipts: ReceiptConfig,
}

impl PurchaseService {
    /// Create service
    pub fn new(
        store: Arc<dyn WalletStore>,
        gateways: GatewayRegistry,
        policy: TokenPolicy,
        receipts: ReceiptConfig,
    ) -> Self {
        Self {
            store,
            gateways,
            policy,
            receipts,
        }
    }

    /// Price for a token count in minor units
    pub fn quote(&self, tokens: i64) -> Result<i64> {
        if tokens < self.policy.min_purchase_tokens || tokens > self.policy.max_purchase_tokens {
            return Err(Error::validation(
                "tokens",
                format!(
                    "must be between {} and {}",
                    self.policy.min_purchase_tokens, self.policy.max_purchase_tokens
                ),
            ));
        }
        tokens
            .checked_mul(self.policy.price_per_token_minor()?)
            .ok_or_else(|| Error::validation("tokens", "price overflows"))
    }

    /// Create the provider order and the purchase
    pub async fn create(
        &self,
        ctx: &RequestContext,
        request: CreatePurchase,
    ) -> Result<PurchaseCreated> {
        let inr_amount = self.quote(request.tokens)?;
        let gateway = self.gateways.get(request.provider)?;

        let purchase_id = Uuid::now_v7();
        let order = gateway
            .create_order(&OrderRequest {
                purchase_id,
                user_id: ctx.user_id.clone(),
                tokens: request.tokens,
                inr_amount,
            })
            .await?;

        let purchase = self
            .store
            .insert_purchase(
                NewPurchase {
                    id: purchase_id,
                    user_id: ctx.user_id.clone(),
                    tokens: request.tokens,
                    inr_amount,
                    provider: request.provider,
                    provider_order_id: order.provider_order_id.clone(),
                    idempotency_key: ctx.idempotency_key.clone(),
                },
                Utc::now(),
            )
            .await?;

        metrics::PURCHASES_CREATED
            .with_label_values(&[request.provider.as_str()])
            .inc();
        info!(
            request_id = %ctx.request_id,
            user_id = %ctx.user_id,
            purchase_id = %purchase.id,
            provider = %purchase.provider,
            tokens = purchase.tokens,
            inr_amount = purchase.inr_amount,
            "purchase created"
        );

        Ok(PurchaseCreated {
            purchase_id: purchase.id,
            status: purchase.status,
            tokens: purchase.tokens,
            inr_amount: purchase.inr_amount,
            currency: CURRENCY.to_string(),
            provider: purchase.provider,
            provider_order_id: purchase.provider_order_id,
            provider_payload: order.client_payload,
        })
    }

    /// Purchase owned by the caller
    pub async fn get(&self, ctx: &RequestContext, id: Uuid) -> Result<Purchase> {
        self.store
            .get_purchase(id)
            .await?
            .filter(|p| p.user_id == ctx.user_id)
            .ok_or_else(|| Error::NotFound(format!("purchase {}", id)))
    }

    /// Any purchase (admin)
    pub async fn get_any(&self, id: Uuid) -> Result<Purchase> {
        self.store
            .get_purchase(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("purchase {}", id)))
    }

    /// Purchase for a provider order
    pub async fn find_by_order(
        &self,
        provider: Provider,
        provider_order_id: &str,
    ) -> Result<Option<Purchase>> {
        self.store
            .find_purchase_by_order(provider, provider_order_id)
            .await
    }

    /// Credit a captured payment exactly once.
    ///
    /// A receipt number collision rolls the whole settlement back; it is then
    /// retried from scratch.
    pub async fn settle(
        &self,
        purchase_id: Uuid,
        provider_payment_id: Option<String>,
    ) -> Result<SettleOutcome> {
        let attempts = self.receipts.max_allocation_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .store
                .settle_purchase(SettleRequest {
                    purchase_id,
                    provider_payment_id: provider_payment_id.clone(),
                    receipt_prefix: self.receipts.prefix.clone(),
                    max_allocation_attempts: attempts,
                    now: Utc::now(),
                })
                .await;

            match result {
                Err(Error::ReceiptCollision(receipt_no)) if attempt < attempts => {
                    metrics::RECEIPT_RETRIES.inc();
                    warn!(%purchase_id, %receipt_no, attempt, "receipt number collision, retrying settlement");
                }
                Err(e) => return Err(e),
                Ok(outcome) => {
                    if let SettleOutcome::Credited { purchase, posted } = &outcome {
                        record_posting(posted);
                        metrics::RECEIPTS_ISSUED.inc();
                        info!(
                            purchase_id = %purchase.id,
                            user_id = %purchase.user_id,
                            receipt_no = purchase.receipt_no.as_deref().unwrap_or(""),
                            tokens = purchase.tokens,
                            "purchase paid"
                        );
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    /// `created -> pending`; None when the purchase moved on already
    pub async fn mark_pending(&self, purchase_id: Uuid) -> Result<Option<Purchase>> {
        self.store
            .transition_purchase(
                purchase_id,
                &[PurchaseStatus::Created],
                PurchaseStatus::Pending,
                None,
                Utc::now(),
            )
            .await
    }

    /// `created | pending -> failed`; None when already paid or closed
    pub async fn mark_failed(&self, purchase_id: Uuid, reason: Option<String>) -> Result<Option<Purchase>> {
        let failed = self
            .store
            .transition_purchase(
                purchase_id,
                &[PurchaseStatus::Created, PurchaseStatus::Pending],
                PurchaseStatus::Failed,
                reason,
                Utc::now(),
            )
            .await?;
        if let Some(purchase) = &failed {
            info!(purchase_id = %purchase.id, reason = purchase.failure_reason.as_deref().unwrap_or(""), "purchase failed");
        }
        Ok(failed)
    }

    /// Expire abandoned purchases
    pub async fn expire_stale(&self, created_before: DateTime<Utc>, limit: i64) -> Result<u64> {
        self.store.expire_stale_purchases(created_before, limit).await
    }

    /// Receipts of a user, newest first
    pub async fn receipts(&self, user_id: &UserId) -> Result<Vec<Receipt>> {
        Ok(self
            .store
            .paid_purchases(user_id)
            .await?
            .iter()
            .filter_map(Receipt::from_purchase)
            .collect())
    }

    /// Receipt by number, scoped to the caller
    pub async fn receipt(&self, ctx: &RequestContext, receipt_no: &str) -> Result<Receipt> {
        self.receipt_any(receipt_no)
            .await
            .ok()
            .filter(|r| r.user_id == ctx.user_id)
            .ok_or_else(|| Error::NotFound(format!("receipt {}", receipt_no)))
    }

    /// Receipt by number (admin)
    pub async fn receipt_any(&self, receipt_no: &str) -> Result<Receipt> {
        self.store
            .purchase_by_receipt(receipt_no)
            .await?
            .as_ref()
            .and_then(Receipt::from_purchase)
            .ok_or_else(|| Error::NotFound(format!("receipt {}", receipt_no)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::store::MemoryStore;

    fn service(gateway: MockGateway) -> (PurchaseService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gateways = GatewayRegistry::new().with(Arc::new(gateway));
        (
            PurchaseService::new(
                store.clone(),
                gateways,
                TokenPolicy::default(),
                ReceiptConfig::default(),
            ),
            store,
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new(UserId::new("buyer")).with_idempotency_key("buy-1")
    }

    fn request(tokens: i64) -> CreatePurchase {
        CreatePurchase {
            tokens,
            provider: Provider::Mock,
        }
    }

    #[tokio::test]
    async fn test_price_computed_server_side() {
        let (service, _) = service(MockGateway::new());
        let created = service.create(&ctx(), request(250)).await.unwrap();
        assert_eq!(created.inr_amount, 75_000);
        assert_eq!(created.status, PurchaseStatus::Created);
        assert_eq!(created.currency, "INR");
    }

    #[tokio::test]
    async fn test_bounds_enforced() {
        let (service, _) = service(MockGateway::new());
        assert_eq!(service.quote(49).unwrap_err().code(), "validation_error");
        assert_eq!(service.quote(100_001).unwrap_err().code(), "validation_error");
        assert_eq!(service.quote(50).unwrap(), 15_000);
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_no_purchase() {
        let (service, store) = service(MockGateway::failing());
        let err = service.create(&ctx(), request(100)).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
        assert!(store.paid_purchases(&UserId::new("buyer")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settle_once_then_already_paid() {
        let (service, store) = service(MockGateway::new());
        let created = service.create(&ctx(), request(250)).await.unwrap();

        let first = service.settle(created.purchase_id, Some("pay_1".into())).await.unwrap();
        let paid = match first {
            SettleOutcome::Credited { purchase, posted } => {
                assert_eq!(posted.balances.regular_balance, 250);
                purchase
            }
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert!(paid.receipt_no.as_deref().unwrap().ends_with("-000001"));

        let second = service.settle(created.purchase_id, Some("pay_1".into())).await.unwrap();
        assert!(matches!(second, SettleOutcome::AlreadyPaid(_)));
        assert_eq!(store.balances(&UserId::new("buyer")).await.unwrap().regular_balance, 250);

        let receipts = service.receipts(&UserId::new("buyer")).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].inr_amount, 75_000);
    }

    #[tokio::test]
    async fn test_failed_then_captured_still_credits() {
        let (service, _) = service(MockGateway::new());
        let created = service.create(&ctx(), request(100)).await.unwrap();
        service
            .mark_failed(created.purchase_id, Some("card declined".into()))
            .await
            .unwrap()
            .unwrap();

        let outcome = service.settle(created.purchase_id, None).await.unwrap();
        assert!(matches!(outcome, SettleOutcome::Credited { .. }));
        // Paid purchases never go back to failed
        assert!(service.mark_failed(created.purchase_id, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receipt_hidden_from_other_users() {
        let (service, _) = service(MockGateway::new());
        let created = service.create(&ctx(), request(100)).await.unwrap();
        let receipt_no = match service.settle(created.purchase_id, None).await.unwrap() {
            SettleOutcome::Credited { purchase, .. } => purchase.receipt_no.unwrap(),
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert!(service.receipt(&ctx(), &receipt_no).await.is_ok());
        let stranger = RequestContext::new(UserId::new("stranger"));
        assert_eq!(
            service.receipt(&stranger, &receipt_no).await.unwrap_err().code(),
            "not_found"
        );
    }
}
