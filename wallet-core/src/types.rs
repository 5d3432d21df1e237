//! Core types for the wallet
//!
//! Token amounts are whole token units held in `i64`; INR amounts are minor
//! units (paise). Row ids are UUIDv7 so that ids sort by creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Error;

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// serde representation is the same snake_case string.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form (also used as the database value)
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::validation(
                        stringify!($name),
                        format!("unknown value `{}`", other),
                    )),
                }
            }
        }
    };
}

/// Identity of a wallet owner, as supplied by the identity layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Balance bucket a ledger entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Purchased or seeded tokens, never expire
    Regular,
    /// Promotional tokens, decay on schedule
    Promo,
}

string_enum!(TokenType { Regular => "regular", Promo => "promo" });

/// Direction of a ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Adds to the balance
    Credit,
    /// Subtracts from the balance
    Debit,
}

string_enum!(Direction { Credit => "credit", Debit => "debit" });

impl Direction {
    /// Apply the direction's sign to an unsigned amount
    pub fn signed(&self, amount: i64) -> i64 {
        match self {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        }
    }
}

/// Why a ledger entry exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// One-time sign-up bonus
    RegistrationBonus,
    /// Tokens bought with real money
    TokenPurchase,
    /// Direct debit for a generated chapter
    ChapterGeneration,
    /// Direct debit for a generated mock test
    TestGeneration,
    /// Promotional grant
    PromoGrant,
    /// Unused promotional tokens removed at expiry
    PromoExpiry,
    /// Manual refund credit
    Refund,
    /// Admin top-up
    AdminSeed,
    /// Debit created by capturing a hold
    AuthorizationCapture,
}

string_enum!(EntryReason {
    RegistrationBonus => "registration_bonus",
    TokenPurchase => "token_purchase",
    ChapterGeneration => "chapter_generation",
    TestGeneration => "test_generation",
    PromoGrant => "promo_grant",
    PromoExpiry => "promo_expiry",
    Refund => "refund",
    AdminSeed => "admin_seed",
    AuthorizationCapture => "authorization_capture",
});

/// Immutable ledger row. Never updated or deleted after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Sortable unique id (UUIDv7)
    pub id: Uuid,
    /// Posting this row belongs to
    pub transaction_id: Uuid,
    /// Owner
    pub user_id: UserId,
    /// Credit or debit
    pub direction: Direction,
    /// Balance bucket
    pub token_type: TokenType,
    /// Positive token units
    pub amount: i64,
    /// Reason code
    pub reason: EntryReason,
    /// Dedupe anchor for a unit of work
    pub resource_key: Option<String>,
    /// Balance of `token_type` right after this row
    pub balance_after: i64,
    /// When the row was written
    pub occurred_at: DateTime<Utc>,
    /// Opaque caller metadata
    pub metadata: serde_json::Value,
    /// Idempotency key of the request that caused the row
    pub idempotency_key: Option<String>,
}

impl LedgerEntry {
    /// Signed effect on the balance
    pub fn signed_amount(&self) -> i64 {
        self.direction.signed(self.amount)
    }
}

/// Materialized per-user balance, kept in step with the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCache {
    /// Owner
    pub user_id: UserId,
    /// Σ signed regular entries
    pub regular_balance: i64,
    /// Σ signed promo entries
    pub promo_balance: i64,
    /// Last change (None for a wallet that never moved)
    pub updated_at: Option<DateTime<Utc>>,
}

impl BalanceCache {
    /// Empty wallet
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            regular_balance: 0,
            promo_balance: 0,
            updated_at: None,
        }
    }

    /// Balance of one bucket
    pub fn get(&self, token_type: TokenType) -> i64 {
        match token_type {
            TokenType::Regular => self.regular_balance,
            TokenType::Promo => self.promo_balance,
        }
    }

    /// Mutable balance of one bucket
    pub fn get_mut(&mut self, token_type: TokenType) -> &mut i64 {
        match token_type {
            TokenType::Regular => &mut self.regular_balance,
            TokenType::Promo => &mut self.promo_balance,
        }
    }

    /// Regular + promo
    pub fn total(&self) -> i64 {
        self.regular_balance + self.promo_balance
    }

    /// Client-facing view
    pub fn view(&self) -> BalancesView {
        BalancesView {
            regular: self.regular_balance,
            promo: self.promo_balance,
            total: self.total(),
        }
    }
}

/// `balances` object returned by the HTTP surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancesView {
    /// Regular tokens
    pub regular: i64,
    /// Promo tokens
    pub promo: i64,
    /// Sum of both
    pub total: i64,
}

/// Which bucket(s) a debit may draw from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSelector {
    /// Only this bucket
    Pinned(TokenType),
    /// Promo first, the remainder from regular
    PromoFirst,
}

impl From<Option<TokenType>> for TokenSelector {
    fn from(pin: Option<TokenType>) -> Self {
        match pin {
            Some(token_type) => TokenSelector::Pinned(token_type),
            None => TokenSelector::PromoFirst,
        }
    }
}

/// A requested ledger movement, before it is written
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    /// Owner
    pub user_id: UserId,
    /// Credit or debit
    pub direction: Direction,
    /// Bucket selection (credits are always pinned)
    pub selector: TokenSelector,
    /// Positive token units
    pub amount: i64,
    /// Reason code
    pub reason: EntryReason,
    /// Dedupe anchor
    pub resource_key: Option<String>,
    /// Opaque metadata
    pub metadata: serde_json::Value,
    /// Originating idempotency key
    pub idempotency_key: Option<String>,
    /// Debit only from balance not reserved by open holds
    pub honor_holds: bool,
}

impl Posting {
    /// Credit into a bucket
    pub fn credit(user_id: UserId, token_type: TokenType, amount: i64, reason: EntryReason) -> Self {
        Self {
            user_id,
            direction: Direction::Credit,
            selector: TokenSelector::Pinned(token_type),
            amount,
            reason,
            resource_key: None,
            metadata: serde_json::Value::Object(Default::default()),
            idempotency_key: None,
            honor_holds: false,
        }
    }

    /// Debit, promo-first unless pinned
    pub fn debit(user_id: UserId, selector: TokenSelector, amount: i64, reason: EntryReason) -> Self {
        Self {
            user_id,
            direction: Direction::Debit,
            selector,
            amount,
            reason,
            resource_key: None,
            metadata: serde_json::Value::Object(Default::default()),
            idempotency_key: None,
            honor_holds: false,
        }
    }

    /// Attach a resource key
    pub fn with_resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach the originating idempotency key
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Leave the amounts of open holds untouched
    pub fn honoring_holds(mut self) -> Self {
        self.honor_holds = true;
        self
    }
}

/// Result of a committed posting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posted {
    /// Shared id of the rows written
    pub transaction_id: Uuid,
    /// Rows written (one, or two for a split promo-first debit)
    pub entries: Vec<LedgerEntry>,
    /// Balance after the posting
    pub balances: BalanceCache,
}

impl Posted {
    /// Sum of entry amounts
    pub fn amount(&self) -> i64 {
        self.entries.iter().map(|e| e.amount).sum()
    }
}

/// Paid feature gated by a hold or direct deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Book chapter
    ChapterGeneration,
    /// Mock test
    TestGeneration,
    /// Course outline
    OutlineGeneration,
    /// Single section rewrite
    SectionGeneration,
}

string_enum!(Feature {
    ChapterGeneration => "chapter_generation",
    TestGeneration => "test_generation",
    OutlineGeneration => "outline_generation",
    SectionGeneration => "section_generation",
});

impl Feature {
    /// Ledger reason used for a direct deduction of this feature
    pub fn deduction_reason(&self) -> EntryReason {
        match self {
            Feature::TestGeneration => EntryReason::TestGeneration,
            _ => EntryReason::ChapterGeneration,
        }
    }
}

/// Hold lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    /// Tokens virtually reserved
    Held,
    /// Debited (terminal)
    Captured,
    /// Released (terminal)
    Voided,
    /// Timed out (terminal)
    Expired,
}

string_enum!(AuthorizationStatus {
    Held => "held",
    Captured => "captured",
    Voided => "voided",
    Expired => "expired",
});

impl AuthorizationStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthorizationStatus::Held)
    }
}

/// Token hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    /// Hold id
    pub id: Uuid,
    /// Owner
    pub user_id: UserId,
    /// Gated feature
    pub feature: Feature,
    /// Number of units requested
    pub units: i64,
    /// Tokens per unit
    pub cost_per_unit: i64,
    /// units × cost_per_unit
    pub held_amount: i64,
    /// Optional bucket pin; None captures promo-first
    pub token_type: Option<TokenType>,
    /// Unique per user + feature
    pub resource_key: String,
    /// Lifecycle state
    pub status: AuthorizationStatus,
    /// Caller metadata
    pub metadata: serde_json::Value,
    /// Deadline after which the hold expires
    pub hold_expires_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Capture time
    pub captured_at: Option<DateTime<Utc>>,
    /// Void time
    pub voided_at: Option<DateTime<Utc>>,
    /// Expiry time
    pub expired_at: Option<DateTime<Utc>>,
    /// Id of the produced artefact, set on capture
    pub result_id: Option<String>,
    /// Ledger transaction written on capture
    pub capture_transaction_id: Option<Uuid>,
    /// Amount debited on capture
    pub debited: Option<i64>,
    /// Balances right after the capture posting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balances_after: Option<BalancesView>,
    /// Status reported by the upstream generator
    pub upstream_status: Option<String>,
    /// Failure code reported on void
    pub failure_code: Option<String>,
    /// Failure message reported on void
    pub failure_msg: Option<String>,
}

/// Hold to be created
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuthorization {
    /// Owner
    pub user_id: UserId,
    /// Gated feature
    pub feature: Feature,
    /// Units
    pub units: i64,
    /// Tokens per unit
    pub cost_per_unit: i64,
    /// Bucket pin
    pub token_type: Option<TokenType>,
    /// Dedupe anchor
    pub resource_key: String,
    /// Caller metadata
    pub metadata: serde_json::Value,
    /// Deadline
    pub hold_expires_at: DateTime<Utc>,
}

impl NewAuthorization {
    /// units × cost_per_unit, None on overflow
    pub fn held_amount(&self) -> Option<i64> {
        self.units.checked_mul(self.cost_per_unit)
    }
}

/// Purchase lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    /// Provider order created
    Created,
    /// Payment authorized, awaiting capture
    Pending,
    /// Credited (terminal)
    Paid,
    /// Payment failed
    Failed,
    /// Abandoned
    Expired,
    /// Refunded by the provider
    Refunded,
}

string_enum!(PurchaseStatus {
    Created => "created",
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
    Expired => "expired",
    Refunded => "refunded",
});

impl PurchaseStatus {
    /// States from which a captured payment may still be credited
    pub fn is_creditable(&self) -> bool {
        matches!(
            self,
            PurchaseStatus::Created
                | PurchaseStatus::Pending
                | PurchaseStatus::Failed
                | PurchaseStatus::Expired
        )
    }
}

/// Payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Razorpay orders + webhooks
    Razorpay,
    /// Stripe payment intents + webhooks
    Stripe,
    /// In-process gateway for tests and local runs
    Mock,
}

string_enum!(Provider {
    Razorpay => "razorpay",
    Stripe => "stripe",
    Mock => "mock",
});

/// Token purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    /// Purchase id
    pub id: Uuid,
    /// Buyer
    pub user_id: UserId,
    /// Lifecycle state
    pub status: PurchaseStatus,
    /// Tokens to credit
    pub tokens: i64,
    /// Price in INR minor units
    pub inr_amount: i64,
    /// Provider
    pub provider: Provider,
    /// Provider order id (unique per provider)
    pub provider_order_id: String,
    /// Provider payment id, once paid
    pub provider_payment_id: Option<String>,
    /// Receipt number, once paid
    pub receipt_no: Option<String>,
    /// Idempotency key of the creating request
    pub idempotency_key: Option<String>,
    /// Credit transaction, once paid
    pub ledger_transaction_id: Option<Uuid>,
    /// Reason recorded on failure
    pub failure_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
    /// Credit time
    pub paid_at: Option<DateTime<Utc>>,
}

/// Purchase to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewPurchase {
    /// Pre-generated id (also sent to the provider as receipt reference)
    pub id: Uuid,
    /// Buyer
    pub user_id: UserId,
    /// Tokens
    pub tokens: i64,
    /// Price in minor units
    pub inr_amount: i64,
    /// Provider
    pub provider: Provider,
    /// Provider order id
    pub provider_order_id: String,
    /// Creating idempotency key
    pub idempotency_key: Option<String>,
}

/// Receipt derived from a paid purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// `PREFIX-YYYY-NNNNNN`
    pub receipt_no: String,
    /// Purchase
    pub purchase_id: Uuid,
    /// Buyer
    pub user_id: UserId,
    /// Tokens credited
    pub tokens: i64,
    /// Minor units paid
    pub inr_amount: i64,
    /// Rupees, for display
    pub inr_display: rust_decimal::Decimal,
    /// Provider
    pub provider: Provider,
    /// Provider payment id
    pub provider_payment_id: Option<String>,
    /// Credit time
    pub paid_at: DateTime<Utc>,
}

impl Receipt {
    /// Receipt view of a paid purchase
    pub fn from_purchase(purchase: &Purchase) -> Option<Self> {
        Some(Self {
            receipt_no: purchase.receipt_no.clone()?,
            purchase_id: purchase.id,
            user_id: purchase.user_id.clone(),
            tokens: purchase.tokens,
            inr_amount: purchase.inr_amount,
            inr_display: rust_decimal::Decimal::new(purchase.inr_amount, 2),
            provider: purchase.provider,
            provider_payment_id: purchase.provider_payment_id.clone(),
            paid_at: purchase.paid_at?,
        })
    }
}

/// Webhook event processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    /// Recorded, processing not finished
    Received,
    /// Applied
    Processed,
    /// Deliberately ignored
    Skipped,
    /// Processing failed
    Error,
}

string_enum!(WebhookEventStatus {
    Received => "received",
    Processed => "processed",
    Skipped => "skipped",
    Error => "error",
});

impl WebhookEventStatus {
    /// Final states short-circuit redeliveries
    pub fn is_final(&self) -> bool {
        matches!(self, WebhookEventStatus::Processed | WebhookEventStatus::Skipped)
    }
}

/// Inbound provider webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Row id
    pub id: Uuid,
    /// Provider
    pub provider: Provider,
    /// Provider delivery id (unique per provider)
    pub event_id: String,
    /// Provider event type string
    pub event_type: String,
    /// Raw payload
    pub payload: serde_json::Value,
    /// Processing state
    pub status: WebhookEventStatus,
    /// First receipt
    pub received_at: DateTime<Utc>,
    /// Finished processing
    pub processed_at: Option<DateTime<Utc>>,
    /// Failure detail
    pub error_msg: Option<String>,
}

/// Idempotency record state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// Claimed by a running request
    InProgress,
    /// Snapshot stored
    Completed,
}

string_enum!(IdempotencyStatus {
    InProgress => "in_progress",
    Completed => "completed",
});

/// Exactly-once record for a (key, scope) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client key
    pub key: String,
    /// Operation + resource identity
    pub scope: String,
    /// Requesting user
    pub user_id: UserId,
    /// SHA-256 of the request body
    pub request_fingerprint: String,
    /// State
    pub status: IdempotencyStatus,
    /// Stored response body
    pub response_snapshot: Option<serde_json::Value>,
    /// Stored response status
    pub status_code: Option<u16>,
    /// Claim time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
    /// After this the record may be reclaimed or purged
    pub expires_at: DateTime<Utc>,
}

/// Promo grant lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoGrantStatus {
    /// Still spendable
    Active,
    /// Decayed (terminal)
    Expired,
}

string_enum!(PromoGrantStatus { Active => "active", Expired => "expired" });

/// Scheduled promotional grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoGrant {
    /// Grant id
    pub id: Uuid,
    /// Owner
    pub user_id: UserId,
    /// Tokens granted
    pub amount: i64,
    /// Credit transaction
    pub granted_transaction_id: Uuid,
    /// Grant time
    pub granted_at: DateTime<Utc>,
    /// Decay deadline
    pub expires_at: DateTime<Utc>,
    /// Lifecycle
    pub status: PromoGrantStatus,
    /// Warning emitted
    pub warned_at: Option<DateTime<Utc>>,
    /// Decay time
    pub expired_at: Option<DateTime<Utc>>,
    /// Tokens removed at decay
    pub decayed_amount: Option<i64>,
}

/// Explicit per-request context handed to every core operation
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Authenticated user the request acts on
    pub user_id: UserId,
    /// Client idempotency key, required for mutations
    pub idempotency_key: Option<String>,
    /// Correlation id for logs
    pub request_id: Uuid,
}

impl RequestContext {
    /// Context for a user with a fresh request id
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            idempotency_key: None,
            request_id: Uuid::new_v4(),
        }
    }

    /// Attach the idempotency key header value
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Same request, acting on another user's wallet (admin routes)
    pub fn acting_on(&self, user_id: UserId) -> Self {
        Self {
            user_id,
            idempotency_key: self.idempotency_key.clone(),
            request_id: self.request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_enum_strings_round_trip_with_serde() {
        assert_eq!(EntryReason::AuthorizationCapture.as_str(), "authorization_capture");
        assert_eq!(
            serde_json::to_string(&EntryReason::PromoExpiry).unwrap(),
            "\"promo_expiry\""
        );
        assert_eq!(
            AuthorizationStatus::from_str("voided").unwrap(),
            AuthorizationStatus::Voided
        );
        assert!(Provider::from_str("paypal").is_err());
    }

    #[test]
    fn test_balance_cache_total_and_view() {
        let mut cache = BalanceCache::empty(UserId::new("u1"));
        *cache.get_mut(TokenType::Regular) += 240;
        *cache.get_mut(TokenType::Promo) += 10;
        assert_eq!(cache.total(), 250);
        assert_eq!(
            cache.view(),
            BalancesView {
                regular: 240,
                promo: 10,
                total: 250
            }
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!AuthorizationStatus::Held.is_terminal());
        assert!(AuthorizationStatus::Captured.is_terminal());
        assert!(AuthorizationStatus::Expired.is_terminal());
        assert!(PurchaseStatus::Failed.is_creditable());
        assert!(PurchaseStatus::Expired.is_creditable());
        assert!(!PurchaseStatus::Refunded.is_creditable());
        assert!(!PurchaseStatus::Paid.is_creditable());
        assert!(WebhookEventStatus::Skipped.is_final());
        assert!(!WebhookEventStatus::Error.is_final());
    }

    #[test]
    fn test_receipt_display_amount() {
        let now = Utc::now();
        let purchase = Purchase {
            id: Uuid::now_v7(),
            user_id: UserId::new("u1"),
            status: PurchaseStatus::Paid,
            tokens: 250,
            inr_amount: 75_000,
            provider: Provider::Razorpay,
            provider_order_id: "order_1".into(),
            provider_payment_id: Some("pay_1".into()),
            receipt_no: Some("BG-2026-000001".into()),
            idempotency_key: None,
            ledger_transaction_id: Some(Uuid::now_v7()),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            paid_at: Some(now),
        };
        let receipt = Receipt::from_purchase(&purchase).unwrap();
        assert_eq!(receipt.inr_display.to_string(), "750.00");
    }

    #[test]
    fn test_feature_deduction_reason() {
        assert_eq!(
            Feature::TestGeneration.deduction_reason(),
            EntryReason::TestGeneration
        );
        assert_eq!(
            Feature::OutlineGeneration.deduction_reason(),
            EntryReason::ChapterGeneration
        );
    }
}
