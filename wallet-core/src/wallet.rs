//! Wallet facade
//!
//! Composes the ledger, the authorization engine, the purchase and webhook
//! pipeline and the sweeper over one store. Every mutating entry point runs
//! under the [`IdempotencyGuard`]; reads and provider webhooks do not.

use crate::{
    authorization::{
        AuthorizationEngine, CaptureAuthorization, CreateAuthorization, VoidAuthorization,
    },
    config::WalletConfig,
    gateway::GatewayRegistry,
    idempotency::{fingerprint, scope, Guarded, IdempotencyGuard},
    ledger::{BalanceCheck, HistoryPage, Ledger},
    purchase::{CreatePurchase, PurchaseService},
    store::{MemoryStore, WalletStore},
    sweeper::{SweepReport, Sweeper},
    types::{
        Authorization, BalancesView, EntryReason, Feature, Posted, PromoGrant, Provider,
        Purchase, Receipt, RequestContext, TokenSelector, TokenType, UserId,
    },
    webhook::{WebhookHeaders, WebhookPipeline, WebhookResult, WebhookVerifiers},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Single-shot debit for a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductRequest {
    /// Feature being paid for
    pub feature: Feature,
    /// Tokens to debit
    pub amount: i64,
    /// Unit of work (deduplicates the debit)
    pub resource_key: String,
    /// Optional bucket pin
    #[serde(default)]
    pub token_type: Option<TokenType>,
    /// Caller metadata
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Admin credit (seed or refund)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminCredit {
    /// Tokens to credit
    pub amount: i64,
    /// Optional dedupe anchor
    #[serde(default)]
    pub resource_key: Option<String>,
    /// Free-form note kept in the entry metadata
    #[serde(default)]
    pub note: Option<String>,
}

/// Admin promo grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminPromo {
    /// Tokens to grant
    pub amount: i64,
    /// Days until decay (policy default when absent)
    #[serde(default)]
    pub ttl_days: Option<i64>,
    /// Optional dedupe anchor
    #[serde(default)]
    pub resource_key: Option<String>,
}

/// Balances of one wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletView {
    /// Owner
    pub user_id: UserId,
    /// Balances
    pub balances: BalancesView,
    /// Last change
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of an admin credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingResult {
    /// Ledger transaction
    pub transaction_id: Uuid,
    /// Tokens credited
    pub amount: i64,
    /// Per-bucket split
    pub token_types: Vec<TokenType>,
    /// Balances afterwards
    pub balances: BalancesView,
}

impl From<&Posted> for PostingResult {
    fn from(posted: &Posted) -> Self {
        Self {
            transaction_id: posted.transaction_id,
            amount: posted.amount(),
            token_types: posted.entries.iter().map(|e| e.token_type).collect(),
            balances: posted.balances.view(),
        }
    }
}

/// Result of a direct deduction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductResult {
    /// Ledger transaction
    pub transaction_id: Uuid,
    /// Tokens debited
    pub debited: i64,
    /// Buckets touched, promo first
    pub token_types: Vec<TokenType>,
    /// Balances afterwards
    pub balances: BalancesView,
}

impl From<&Posted> for DeductResult {
    fn from(posted: &Posted) -> Self {
        Self {
            transaction_id: posted.transaction_id,
            debited: posted.amount(),
            token_types: posted.entries.iter().map(|e| e.token_type).collect(),
            balances: posted.balances.view(),
        }
    }
}

/// Result of a promo grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoResult {
    /// Ledger transaction
    pub transaction_id: Uuid,
    /// Decay schedule
    pub grant_id: Uuid,
    /// Tokens granted
    pub amount: i64,
    /// Decay deadline
    pub expires_at: DateTime<Utc>,
    /// Balances afterwards
    pub balances: BalancesView,
}

impl PromoResult {
    fn new(posted: &Posted, grant: &PromoGrant) -> Self {
        Self {
            transaction_id: posted.transaction_id,
            grant_id: grant.id,
            amount: grant.amount,
            expires_at: grant.expires_at,
            balances: posted.balances.view(),
        }
    }
}

/// Caller resource key, or one derived from the idempotency key so a
/// credit lands at most once even if its idempotency record is lost
fn credit_resource_key(ctx: &RequestContext, resource_key: Option<String>) -> Option<String> {
    resource_key.or_else(|| {
        ctx.idempotency_key
            .as_ref()
            .map(|key| format!("idempotency:{}", key))
    })
}

fn note_metadata(note: Option<&str>) -> Option<serde_json::Value> {
    note.map(|note| serde_json::json!({ "note": note }))
}

/// Token wallet
pub struct Wallet {
    store: Arc<dyn WalletStore>,
    config: WalletConfig,
    guard: IdempotencyGuard,
    ledger: Ledger,
    authorizations: Arc<AuthorizationEngine>,
    purchases: Arc<PurchaseService>,
    webhooks: WebhookPipeline,
    sweeper: Arc<Sweeper>,
}

impl Wallet {
    /// Wallet over `store` with explicit gateways and verifiers
    pub fn new(
        store: Arc<dyn WalletStore>,
        gateways: GatewayRegistry,
        verifiers: WebhookVerifiers,
        config: WalletConfig,
    ) -> Result<Self> {
        config.validate()?;

        let authorizations = Arc::new(AuthorizationEngine::new(
            store.clone(),
            config.authorization.clone(),
        ));
        let purchases = Arc::new(PurchaseService::new(
            store.clone(),
            gateways,
            config.tokens.clone(),
            config.receipts.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            authorizations.clone(),
            purchases.clone(),
            config.tokens.clone(),
            config.sweeper.clone(),
        ));

        Ok(Self {
            guard: IdempotencyGuard::new(store.clone(), config.idempotency.clone()),
            ledger: Ledger::new(store.clone(), config.tokens.clone()),
            webhooks: WebhookPipeline::new(store.clone(), purchases.clone(), verifiers),
            authorizations,
            purchases,
            sweeper,
            store,
            config,
        })
    }

    /// Wallet with gateways and verifiers built from `config.providers`
    pub fn from_config(store: Arc<dyn WalletStore>, config: WalletConfig) -> Result<Self> {
        let gateways = GatewayRegistry::from_config(&config.providers)?;
        let verifiers = WebhookVerifiers::from_config(&config.providers);
        Self::new(store, gateways, verifiers, config)
    }

    /// In-memory wallet with the mock provider enabled
    pub fn in_memory(mut config: WalletConfig) -> Result<Self> {
        config.providers.mock_enabled = true;
        let verifiers = WebhookVerifiers::from_config(&config.providers);
        let gateways = GatewayRegistry::from_config(&config.providers)?;
        Self::new(Arc::new(MemoryStore::new()), gateways, verifiers, config)
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn WalletStore> {
        &self.store
    }

    /// Active configuration
    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Sweeper, for the background loop
    pub fn sweeper(&self) -> Arc<Sweeper> {
        self.sweeper.clone()
    }

    /// Webhook pipeline
    pub fn webhooks(&self) -> &WebhookPipeline {
        &self.webhooks
    }

    // Reads

    /// Balances of the caller
    pub async fn balances(&self, user_id: &UserId) -> Result<WalletView> {
        let cache = self.ledger.balances(user_id).await?;
        Ok(WalletView {
            balances: cache.view(),
            updated_at: cache.updated_at,
            user_id: cache.user_id,
        })
    }

    /// Ledger history
    pub async fn history(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<HistoryPage> {
        self.ledger.history(user_id, cursor, limit).await
    }

    /// Cache vs ledger
    pub async fn verify(&self, user_id: &UserId) -> Result<BalanceCheck> {
        self.ledger.verify(user_id).await
    }

    /// Hold owned by the caller
    pub async fn authorization(&self, ctx: &RequestContext, id: Uuid) -> Result<Authorization> {
        self.authorizations.get(ctx, id).await
    }

    /// Purchase owned by the caller
    pub async fn purchase(&self, ctx: &RequestContext, id: Uuid) -> Result<Purchase> {
        self.purchases.get(ctx, id).await
    }

    /// Any purchase
    pub async fn purchase_admin(&self, id: Uuid) -> Result<Purchase> {
        self.purchases.get_any(id).await
    }

    /// Receipts of the caller
    pub async fn receipts(&self, user_id: &UserId) -> Result<Vec<Receipt>> {
        self.purchases.receipts(user_id).await
    }

    /// Receipt owned by the caller
    pub async fn receipt(&self, ctx: &RequestContext, receipt_no: &str) -> Result<Receipt> {
        self.purchases.receipt(ctx, receipt_no).await
    }

    /// Any receipt
    pub async fn receipt_admin(&self, receipt_no: &str) -> Result<Receipt> {
        self.purchases.receipt_any(receipt_no).await
    }

    // Guarded mutations

    /// One-time registration bonus
    pub async fn registration_bonus(&self, ctx: &RequestContext) -> Result<Guarded> {
        let scope = scope("registration_bonus", &ctx.user_id, None);
        self.guard
            .run(ctx, &scope, fingerprint(&serde_json::json!({}))?, 201, || async {
                let (posted, grant) = self.ledger.grant_registration_bonus(ctx).await?;
                Ok(PromoResult::new(&posted, &grant))
            })
            .await
    }

    /// Place a hold
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        request: CreateAuthorization,
    ) -> Result<Guarded> {
        let scope = scope("authorize", &ctx.user_id, None);
        let fingerprint = fingerprint(&request)?;
        self.guard
            .run(ctx, &scope, fingerprint, 201, || {
                self.authorizations.create(ctx, request)
            })
            .await
    }

    /// Capture a hold
    pub async fn capture(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        request: CaptureAuthorization,
    ) -> Result<Guarded> {
        let scope = scope("capture", &ctx.user_id, Some(&id.to_string()));
        let fingerprint = fingerprint(&request)?;
        self.guard
            .run(ctx, &scope, fingerprint, 200, || {
                self.authorizations.capture(ctx, id, request)
            })
            .await
    }

    /// Void a hold
    pub async fn void(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        request: VoidAuthorization,
    ) -> Result<Guarded> {
        let scope = scope("void", &ctx.user_id, Some(&id.to_string()));
        let fingerprint = fingerprint(&request)?;
        self.guard
            .run(ctx, &scope, fingerprint, 200, || {
                self.authorizations.void(ctx, id, request)
            })
            .await
    }

    /// Debit without a hold
    pub async fn deduct(&self, ctx: &RequestContext, request: DeductRequest) -> Result<Guarded> {
        let scope = scope("deduct", &ctx.user_id, None);
        let fingerprint = fingerprint(&request)?;
        self.guard
            .run(ctx, &scope, fingerprint, 200, move || async move {
                let mut metadata = match request.metadata {
                    Some(serde_json::Value::Object(map)) => map,
                    Some(_) => return Err(Error::validation("metadata", "must be a JSON object")),
                    None => serde_json::Map::new(),
                };
                metadata.insert(
                    "feature".to_string(),
                    serde_json::Value::String(request.feature.as_str().to_string()),
                );

                let posted = self
                    .ledger
                    .debit(
                        ctx,
                        TokenSelector::from(request.token_type),
                        request.amount,
                        request.feature.deduction_reason(),
                        Some(request.resource_key),
                        Some(serde_json::Value::Object(metadata)),
                    )
                    .await?;
                Ok(DeductResult::from(&posted))
            })
            .await
    }

    /// Create a purchase intent
    pub async fn create_purchase(
        &self,
        ctx: &RequestContext,
        request: CreatePurchase,
    ) -> Result<Guarded> {
        let scope = scope("purchase", &ctx.user_id, None);
        let fingerprint = fingerprint(&request)?;
        self.guard
            .run(ctx, &scope, fingerprint, 201, || {
                self.purchases.create(ctx, request)
            })
            .await
    }

    /// Admin top-up of `regular` tokens
    pub async fn admin_seed(&self, ctx: &RequestContext, request: AdminCredit) -> Result<Guarded> {
        self.admin_credit(ctx, "admin_seed", EntryReason::AdminSeed, request)
            .await
    }

    /// Manual refund credit of `regular` tokens
    pub async fn admin_refund(&self, ctx: &RequestContext, request: AdminCredit) -> Result<Guarded> {
        if request.resource_key.is_none() {
            return Err(Error::validation(
                "resource_key",
                "refunds must name what they refund",
            ));
        }
        self.admin_credit(ctx, "admin_refund", EntryReason::Refund, request)
            .await
    }

    async fn admin_credit(
        &self,
        ctx: &RequestContext,
        operation: &str,
        reason: EntryReason,
        request: AdminCredit,
    ) -> Result<Guarded> {
        let scope = scope(operation, &ctx.user_id, None);
        let fingerprint = fingerprint(&request)?;
        self.guard
            .run(ctx, &scope, fingerprint, 201, move || async move {
                let posted = self
                    .ledger
                    .credit(
                        ctx,
                        TokenType::Regular,
                        request.amount,
                        reason,
                        credit_resource_key(ctx, request.resource_key),
                        note_metadata(request.note.as_deref()),
                    )
                    .await?;
                Ok(PostingResult::from(&posted))
            })
            .await
    }

    /// Admin promo grant
    pub async fn admin_promo(&self, ctx: &RequestContext, request: AdminPromo) -> Result<Guarded> {
        let scope = scope("admin_promo", &ctx.user_id, None);
        let fingerprint = fingerprint(&request)?;
        self.guard
            .run(ctx, &scope, fingerprint, 201, move || async move {
                let (posted, grant) = self
                    .ledger
                    .grant_promo(
                        ctx,
                        request.amount,
                        EntryReason::PromoGrant,
                        credit_resource_key(ctx, request.resource_key),
                        request.ttl_days,
                    )
                    .await?;
                Ok(PromoResult::new(&posted, &grant))
            })
            .await
    }

    // Unguarded

    /// Provider webhook (deduplicated by event id instead)
    pub async fn handle_webhook(
        &self,
        provider: Provider,
        raw: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<WebhookResult> {
        self.webhooks.handle(provider, raw, headers).await
    }

    /// One sweeper pass
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        self.sweeper.run_once(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> Wallet {
        Wallet::in_memory(WalletConfig::default()).unwrap()
    }

    fn ctx(key: &str) -> RequestContext {
        RequestContext::new(UserId::new("writer")).with_idempotency_key(key)
    }

    fn seed(amount: i64) -> AdminCredit {
        AdminCredit {
            amount,
            resource_key: None,
            note: Some("test".into()),
        }
    }

    #[tokio::test]
    async fn test_deduct_replay_returns_same_body() {
        let wallet = wallet();
        wallet.admin_seed(&ctx("seed"), seed(100)).await.unwrap();

        let request = DeductRequest {
            feature: Feature::TestGeneration,
            amount: 30,
            resource_key: "test-1".into(),
            token_type: None,
            metadata: None,
        };
        let first = wallet.deduct(&ctx("d1"), request.clone()).await.unwrap();
        assert_eq!(first.body["debited"], 30);
        let second = wallet.deduct(&ctx("d1"), request).await.unwrap();

        assert!(second.replayed);
        assert_eq!(first.body, second.body);
        assert_eq!(wallet.balances(&UserId::new("writer")).await.unwrap().balances.total, 70);
    }

    #[tokio::test]
    async fn test_deduct_same_resource_new_key_is_duplicate() {
        let wallet = wallet();
        wallet.admin_seed(&ctx("seed"), seed(100)).await.unwrap();
        let request = DeductRequest {
            feature: Feature::ChapterGeneration,
            amount: 10,
            resource_key: "chapter-1".into(),
            token_type: None,
            metadata: Some(serde_json::json!({"book": "b1"})),
        };
        wallet.deduct(&ctx("d1"), request.clone()).await.unwrap();

        let err = wallet.deduct(&ctx("d2"), request).await.unwrap_err();
        assert_eq!(err.code(), "duplicate_resource");
        assert_eq!(wallet.balances(&UserId::new("writer")).await.unwrap().balances.total, 90);
    }

    #[tokio::test]
    async fn test_registration_bonus_once() {
        let wallet = wallet();
        let first = wallet.registration_bonus(&ctx("reg-1")).await.unwrap();
        assert_eq!(first.status_code, 201);
        assert_eq!(first.body["amount"], 100);

        let err = wallet.registration_bonus(&ctx("reg-2")).await.unwrap_err();
        assert_eq!(err.code(), "duplicate_resource");
        let view = wallet.balances(&UserId::new("writer")).await.unwrap();
        assert_eq!(view.balances.promo, 100);
    }

    #[tokio::test]
    async fn test_refund_requires_resource_key() {
        let wallet = wallet();
        let err = wallet.admin_refund(&ctx("r1"), seed(5)).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn test_seed_lands_once_when_snapshot_is_lost() {
        let store = Arc::new(MemoryStore::new());
        let mut config = WalletConfig::default();
        config.providers.mock_enabled = true;
        config.idempotency.wait_for_in_progress_ms = 20;
        config.idempotency.poll_interval_ms = 5;
        let wallet = Wallet::from_config(store.clone(), config).unwrap();

        store.fail_completions(3);
        let first = wallet.admin_seed(&ctx("seed"), seed(100)).await.unwrap();
        assert_eq!(first.body["amount"], 100);

        let err = wallet.admin_seed(&ctx("seed"), seed(100)).await.unwrap_err();
        assert_eq!(err.code(), "idempotency_in_progress");

        // Even with the claim gone, the derived resource key blocks a re-run
        store.release_idempotency("seed", "admin_seed:writer").await.unwrap();
        let err = wallet.admin_seed(&ctx("seed"), seed(100)).await.unwrap_err();
        assert_eq!(err.code(), "duplicate_resource");

        let view = wallet.balances(&UserId::new("writer")).await.unwrap();
        assert_eq!(view.balances.regular, 100);
        assert_eq!(wallet.history(&UserId::new("writer"), None, None).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_deduct_cannot_spend_held_tokens() {
        let wallet = wallet();
        wallet.admin_seed(&ctx("seed"), seed(100)).await.unwrap();
        let held = wallet
            .authorize(
                &ctx("h1"),
                CreateAuthorization {
                    feature: Feature::ChapterGeneration,
                    units: 1,
                    cost_per_unit: 100,
                    resource_key: "chapter-1".into(),
                    token_type: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        let id: Uuid = serde_json::from_value(held.body["authorization_id"].clone()).unwrap();

        let err = wallet
            .deduct(
                &ctx("d1"),
                DeductRequest {
                    feature: Feature::TestGeneration,
                    amount: 100,
                    resource_key: "test-1".into(),
                    token_type: None,
                    metadata: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "insufficient_tokens");

        let captured = wallet
            .capture(&ctx("c1"), id, CaptureAuthorization::default())
            .await
            .unwrap();
        assert_eq!(captured.body["debited"], 100);
        assert_eq!(captured.body["balances"]["total"], 0);
    }

    #[tokio::test]
    async fn test_hold_capture_through_facade() {
        let wallet = wallet();
        wallet.admin_seed(&ctx("seed"), seed(250)).await.unwrap();
        let held = wallet
            .authorize(
                &ctx("h1"),
                CreateAuthorization {
                    feature: Feature::ChapterGeneration,
                    units: 1,
                    cost_per_unit: 10,
                    resource_key: "chapter-7".into(),
                    token_type: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        let id: Uuid = serde_json::from_value(held.body["authorization_id"].clone()).unwrap();

        let captured = wallet
            .capture(&ctx("c1"), id, CaptureAuthorization::default())
            .await
            .unwrap();
        assert_eq!(captured.body["balances"]["total"], 240);
    }
}
