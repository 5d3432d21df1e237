//! Transactional storage for the wallet
//!
//! Every method of [`WalletStore`] is one atomic unit: it either commits all
//! of its writes or none of them. Read-then-write sequences on per-user state
//! (balance row, hold status, receipt counter, idempotency record) run under a
//! row lock or a compare-and-set on status inside that unit.
//!
//! Two implementations:
//!
//! - [`PgStore`] - Postgres via `sqlx`, `SELECT ... FOR UPDATE` and unique
//!   constraints
//! - [`MemoryStore`] - a single mutex over in-process maps, for tests and
//!   local runs

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::{
    types::{
        Authorization, BalanceCache, EntryReason, IdempotencyRecord, LedgerEntry,
        NewAuthorization, NewPurchase, Posted, Posting, PromoGrant, Provider, Purchase,
        PurchaseStatus, TokenSelector, TokenType, UserId, WebhookEvent, WebhookEventStatus,
    },
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Capture request handed to the store
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Hold id
    pub authorization_id: Uuid,
    /// Owner (ownership is part of the lookup)
    pub user_id: UserId,
    /// Produced artefact id
    pub result_id: Option<String>,
    /// Status reported by the generator
    pub upstream_status: Option<String>,
    /// Originating idempotency key
    pub idempotency_key: Option<String>,
    /// Transaction time
    pub now: DateTime<Utc>,
}

/// What a capture did
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    /// Hold was `held`; ledger debit written
    Captured {
        /// Updated hold
        authorization: Authorization,
        /// Debit posting
        posted: Posted,
    },
    /// Hold was already captured; nothing written
    AlreadyCaptured(Authorization),
    /// Hold was past its deadline and has now been expired
    Expired(Authorization),
    /// Hold is voided or expired
    NotCapturable(Authorization),
}

/// Void request handed to the store
#[derive(Debug, Clone)]
pub struct VoidRequest {
    /// Hold id
    pub authorization_id: Uuid,
    /// Owner
    pub user_id: UserId,
    /// Status reported by the generator
    pub upstream_status: Option<String>,
    /// Failure code
    pub failure_code: Option<String>,
    /// Failure message
    pub failure_msg: Option<String>,
    /// Transaction time
    pub now: DateTime<Utc>,
}

/// What a void did
#[derive(Debug, Clone)]
pub enum VoidOutcome {
    /// `held -> voided`
    Voided(Authorization),
    /// Already voided; nothing written
    AlreadyVoided(Authorization),
    /// Captured or expired
    NotVoidable(Authorization),
}

/// Settlement of a captured payment
#[derive(Debug, Clone)]
pub struct SettleRequest {
    /// Purchase to credit
    pub purchase_id: Uuid,
    /// Provider payment id
    pub provider_payment_id: Option<String>,
    /// Receipt prefix
    pub receipt_prefix: String,
    /// Counter steps tried before giving up on a free number
    pub max_allocation_attempts: u32,
    /// Transaction time (its year selects the counter)
    pub now: DateTime<Utc>,
}

/// What a settlement did
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// Ledger credited, receipt issued, purchase paid
    Credited {
        /// Paid purchase
        purchase: Purchase,
        /// Credit posting
        posted: Posted,
    },
    /// Purchase was already paid; nothing written
    AlreadyPaid(Purchase),
    /// Purchase is expired or refunded
    NotCreditable(Purchase),
}

/// Result of recording an inbound webhook
#[derive(Debug, Clone)]
pub enum WebhookRecord {
    /// First delivery
    Inserted(WebhookEvent),
    /// The (provider, event_id) pair was seen before
    Duplicate(WebhookEvent),
}

/// Idempotency claim
#[derive(Debug, Clone)]
pub struct IdempotencyClaim {
    /// Client key
    pub key: String,
    /// Operation scope
    pub scope: String,
    /// Requesting user
    pub user_id: UserId,
    /// Request body hash
    pub fingerprint: String,
    /// Claim time
    pub now: DateTime<Utc>,
    /// Record expiry
    pub expires_at: DateTime<Utc>,
}

/// Result of an idempotency claim
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// No live record existed; an `in_progress` record now exists
    Claimed,
    /// A live record exists
    Existing(IdempotencyRecord),
}

/// Result of a promo grant decay
#[derive(Debug, Clone)]
pub struct PromoDecay {
    /// Expired grant
    pub grant: PromoGrant,
    /// Debit posting, when anything was left to remove
    pub posted: Option<Posted>,
}

/// Transactional wallet storage
#[async_trait]
pub trait WalletStore: Send + Sync {
    // Ledger

    /// Write a posting and apply it to the balance cache
    async fn post(&self, posting: Posting) -> Result<Posted>;

    /// Promo credit plus its decay schedule
    async fn grant_promo(
        &self,
        posting: Posting,
        expires_at: DateTime<Utc>,
    ) -> Result<(Posted, PromoGrant)>;

    /// Cached balances (zeros for an unknown user)
    async fn balances(&self, user_id: &UserId) -> Result<BalanceCache>;

    /// Balances re-derived from the ledger rows
    async fn ledger_totals(&self, user_id: &UserId) -> Result<BalanceCache>;

    /// Entries newest-first, strictly older than `before` when given
    async fn ledger_page(
        &self,
        user_id: &UserId,
        before: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>>;

    // Authorizations

    /// Insert a hold if it fits into balance minus open holds
    async fn create_authorization(
        &self,
        new: NewAuthorization,
        now: DateTime<Utc>,
    ) -> Result<Authorization>;

    /// Hold owned by `user_id`
    async fn get_authorization(&self, id: Uuid, user_id: &UserId)
        -> Result<Option<Authorization>>;

    /// CAS `held -> captured` plus the ledger debit
    async fn capture_authorization(&self, request: CaptureRequest) -> Result<CaptureOutcome>;

    /// CAS `held -> voided`
    async fn void_authorization(&self, request: VoidRequest) -> Result<VoidOutcome>;

    /// CAS every `held` row past its deadline to `expired`
    async fn expire_authorizations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Authorization>>;

    // Purchases

    /// Insert a purchase in `created`
    async fn insert_purchase(&self, new: NewPurchase, now: DateTime<Utc>) -> Result<Purchase>;

    /// Purchase by id
    async fn get_purchase(&self, id: Uuid) -> Result<Option<Purchase>>;

    /// Purchase by provider order id
    async fn find_purchase_by_order(
        &self,
        provider: Provider,
        provider_order_id: &str,
    ) -> Result<Option<Purchase>>;

    /// Credit, receipt and `paid` in one transaction
    async fn settle_purchase(&self, request: SettleRequest) -> Result<SettleOutcome>;

    /// CAS the status from one of `from` to `to`; None when not in `from`
    async fn transition_purchase(
        &self,
        id: Uuid,
        from: &[PurchaseStatus],
        to: PurchaseStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Purchase>>;

    /// Expire created/pending purchases older than `created_before`
    async fn expire_stale_purchases(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64>;

    /// Paid purchases of a user, newest first
    async fn paid_purchases(&self, user_id: &UserId) -> Result<Vec<Purchase>>;

    /// Purchase holding a receipt number
    async fn purchase_by_receipt(&self, receipt_no: &str) -> Result<Option<Purchase>>;

    // Webhooks

    /// Insert the event unless (provider, event_id) exists
    async fn record_webhook_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookRecord>;

    /// Final processing state of an event
    async fn finish_webhook_event(
        &self,
        id: Uuid,
        status: WebhookEventStatus,
        error_msg: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // Idempotency

    /// Claim (key, scope) unless a record exists. Only a `completed` record
    /// past its expiry is replaced; an `in_progress` one never lapses.
    async fn claim_idempotency(&self, claim: IdempotencyClaim) -> Result<ClaimOutcome>;

    /// Current record
    async fn get_idempotency(&self, key: &str, scope: &str) -> Result<Option<IdempotencyRecord>>;

    /// Store the response and mark the record completed
    async fn complete_idempotency(
        &self,
        key: &str,
        scope: &str,
        snapshot: serde_json::Value,
        status_code: u16,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Drop an `in_progress` claim after a failed execution
    async fn release_idempotency(&self, key: &str, scope: &str) -> Result<()>;

    /// Delete expired `completed` records
    async fn purge_idempotency(&self, now: DateTime<Utc>) -> Result<u64>;

    // Promo decay

    /// Active grants past their deadline
    async fn promo_grants_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<PromoGrant>>;

    /// Expire one grant, debiting its unused remainder; None if not active
    async fn decay_promo_grant(&self, grant_id: Uuid, now: DateTime<Utc>)
        -> Result<Option<PromoDecay>>;

    /// Mark and return active, unwarned grants expiring before `warn_before`
    async fn take_promo_warnings(
        &self,
        warn_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromoGrant>>;
}

/// Debit written when a hold is captured
pub(crate) fn capture_posting(hold: &Authorization, idempotency_key: Option<String>) -> Posting {
    Posting::debit(
        hold.user_id.clone(),
        TokenSelector::from(hold.token_type),
        hold.held_amount,
        EntryReason::AuthorizationCapture,
    )
    .with_resource_key(hold.id.to_string())
    .with_metadata(serde_json::json!({
        "authorization_id": hold.id,
        "feature": hold.feature,
        "units": hold.units,
        "cost_per_unit": hold.cost_per_unit,
    }))
    .with_idempotency_key(idempotency_key)
}

/// Credit written when a purchase is settled
pub(crate) fn purchase_posting(purchase: &Purchase) -> Posting {
    Posting::credit(
        purchase.user_id.clone(),
        TokenType::Regular,
        purchase.tokens,
        EntryReason::TokenPurchase,
    )
    .with_resource_key(format!("purchase:{}", purchase.id))
    .with_metadata(serde_json::json!({
        "purchase_id": purchase.id,
        "provider": purchase.provider,
        "provider_order_id": purchase.provider_order_id,
        "inr_amount": purchase.inr_amount,
    }))
    .with_idempotency_key(purchase.idempotency_key.clone())
}

/// Debit written when a promo grant decays
pub(crate) fn decay_posting(grant: &PromoGrant, remainder: i64) -> Posting {
    Posting::debit(
        grant.user_id.clone(),
        TokenSelector::Pinned(TokenType::Promo),
        remainder,
        EntryReason::PromoExpiry,
    )
    .with_resource_key(format!("promo_grant:{}", grant.id))
    .with_metadata(serde_json::json!({
        "grant_id": grant.id,
        "granted": grant.amount,
    }))
}

/// Unused remainder of an expiring grant.
///
/// Spending is attributed to the earliest-expiring grant first, so whatever
/// the later grants could still cover is not part of this grant's remainder.
/// Never more than the current promo balance, never negative.
pub fn promo_remainder(grant_amount: i64, promo_balance: i64, later_grants_total: i64) -> i64 {
    grant_amount
        .min(promo_balance - later_grants_total)
        .min(promo_balance)
        .max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promo_remainder_untouched_grant() {
        assert_eq!(promo_remainder(100, 150, 50), 100);
    }

    #[test]
    fn test_promo_remainder_partially_spent() {
        // 30 of 150 spent, attributed to the expiring grant
        assert_eq!(promo_remainder(100, 120, 50), 70);
    }

    #[test]
    fn test_promo_remainder_fully_spent() {
        assert_eq!(promo_remainder(100, 30, 50), 0);
    }

    #[test]
    fn test_promo_remainder_capped_by_balance() {
        assert_eq!(promo_remainder(100, 40, 0), 40);
        assert_eq!(promo_remainder(100, 0, 0), 0);
    }
}
