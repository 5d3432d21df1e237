//! Ledger & balance cache
//!
//! The ledger is the source of truth for balances. Every posting is written
//! together with the balance cache update in one store transaction, so
//! `regular_balance`/`promo_balance` always equal the signed sum of the
//! user's ledger rows per token type.
//!
//! Debits that do not pin a token type draw from promo first and from regular
//! for the rest ([`DEBIT_ORDER`]).

use crate::{
    config::TokenPolicy,
    metrics,
    store::WalletStore,
    types::{
        BalanceCache, Direction, EntryReason, LedgerEntry, Posted, Posting, PromoGrant,
        RequestContext, TokenSelector, TokenType, UserId,
    },
    Error, Result,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Order in which an unpinned debit consumes buckets
pub const DEBIT_ORDER: [TokenType; 2] = [TokenType::Promo, TokenType::Regular];

/// Resource key that makes the registration bonus a one-off
pub const REGISTRATION_RESOURCE_KEY: &str = "registration";

/// Default and maximum page size for history queries
pub const DEFAULT_PAGE_SIZE: i64 = 50;
/// Largest page a client may ask for
pub const MAX_PAGE_SIZE: i64 = 200;

/// Split a posting into per-bucket amounts against the locked balances.
///
/// Credits must be pinned. Debits fail with `InsufficientBalance` when the
/// selected bucket(s) cannot cover the amount; nothing is ever allowed to go
/// negative.
pub fn plan_posting(balances: &BalanceCache, posting: &Posting) -> Result<Vec<(TokenType, i64)>> {
    match (posting.direction, posting.selector) {
        (Direction::Credit, TokenSelector::Pinned(token_type)) => {
            Ok(vec![(token_type, posting.amount)])
        }
        (Direction::Credit, TokenSelector::PromoFirst) => Err(Error::validation(
            "token_type",
            "credits must name a token type",
        )),
        (Direction::Debit, TokenSelector::Pinned(token_type)) => {
            let available = balances.get(token_type);
            if available < posting.amount {
                return Err(Error::InsufficientBalance {
                    token_type,
                    required: posting.amount,
                    available,
                });
            }
            Ok(vec![(token_type, posting.amount)])
        }
        (Direction::Debit, TokenSelector::PromoFirst) => {
            let available = balances.total();
            if available < posting.amount {
                return Err(Error::InsufficientBalance {
                    token_type: TokenType::Regular,
                    required: posting.amount,
                    available,
                });
            }

            let mut remaining = posting.amount;
            let mut parts = Vec::with_capacity(DEBIT_ORDER.len());
            for token_type in DEBIT_ORDER {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(balances.get(token_type));
                if take > 0 {
                    parts.push((token_type, take));
                    remaining -= take;
                }
            }
            Ok(parts)
        }
    }
}

/// Reject a hold-honoring debit that would eat into tokens reserved by
/// open holds. `open_holds` must be read under the same lock as `balances`.
pub fn check_open_holds(balances: &BalanceCache, posting: &Posting, open_holds: i64) -> Result<()> {
    if !posting.honor_holds || posting.direction != Direction::Debit || open_holds <= 0 {
        return Ok(());
    }
    let spendable = match posting.selector {
        TokenSelector::Pinned(token_type) => balances.get(token_type),
        TokenSelector::PromoFirst => balances.total(),
    };
    let available = spendable - open_holds;
    if available < posting.amount {
        return Err(Error::InsufficientTokens {
            required: posting.amount,
            available: available.max(0),
        });
    }
    Ok(())
}

/// One page of ledger history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Entries, newest first
    pub items: Vec<LedgerEntry>,
    /// Pass back as `cursor` for the next page
    pub next_cursor: Option<String>,
}

/// Cache vs ledger comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCheck {
    /// Owner
    pub user_id: UserId,
    /// What the cache says
    pub cached: crate::types::BalancesView,
    /// What the ledger rows add up to
    pub derived: crate::types::BalancesView,
    /// cached == derived
    pub consistent: bool,
}

/// Ledger service
pub struct Ledger {
    store: Arc<dyn WalletStore>,
    policy: TokenPolicy,
}

impl Ledger {
    /// Create ledger over a store
    pub fn new(store: Arc<dyn WalletStore>, policy: TokenPolicy) -> Self {
        Self { store, policy }
    }

    /// Credit a bucket
    pub async fn credit(
        &self,
        ctx: &RequestContext,
        token_type: TokenType,
        amount: i64,
        reason: EntryReason,
        resource_key: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Posted> {
        let mut posting = Posting::credit(ctx.user_id.clone(), token_type, amount, reason)
            .with_idempotency_key(ctx.idempotency_key.clone());
        posting.resource_key = resource_key;
        if let Some(metadata) = metadata {
            posting.metadata = metadata;
        }
        self.post(posting).await
    }

    /// Debit; promo-first unless `selector` pins a bucket
    pub async fn debit(
        &self,
        ctx: &RequestContext,
        selector: TokenSelector,
        amount: i64,
        reason: EntryReason,
        resource_key: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Posted> {
        let mut posting = Posting::debit(ctx.user_id.clone(), selector, amount, reason)
            .with_idempotency_key(ctx.idempotency_key.clone())
            .honoring_holds();
        posting.resource_key = resource_key;
        if let Some(metadata) = metadata {
            posting.metadata = metadata;
        }
        self.post(posting).await
    }

    /// Validate and write a posting
    pub async fn post(&self, posting: Posting) -> Result<Posted> {
        self.validate(&posting)?;

        let posted = self.store.post(posting.clone()).await.map_err(|e| {
            if let Error::InsufficientBalance { .. } = e {
                debug!(user_id = %posting.user_id, amount = posting.amount, "debit rejected: {}", e);
            }
            e
        })?;

        record_posting(&posted);
        info!(
            user_id = %posting.user_id,
            transaction_id = %posted.transaction_id,
            direction = %posting.direction,
            reason = %posting.reason,
            amount = posting.amount,
            regular = posted.balances.regular_balance,
            promo = posted.balances.promo_balance,
            "ledger posting committed"
        );

        Ok(posted)
    }

    /// Credit promo tokens that decay after `ttl_days` (policy default if None)
    pub async fn grant_promo(
        &self,
        ctx: &RequestContext,
        amount: i64,
        reason: EntryReason,
        resource_key: Option<String>,
        ttl_days: Option<i64>,
    ) -> Result<(Posted, PromoGrant)> {
        let ttl_days = ttl_days.unwrap_or(self.policy.promo_ttl_days);
        if ttl_days < 1 {
            return Err(Error::validation("ttl_days", "must be at least 1"));
        }

        let mut posting = Posting::credit(ctx.user_id.clone(), TokenType::Promo, amount, reason)
            .with_idempotency_key(ctx.idempotency_key.clone())
            .with_metadata(serde_json::json!({ "ttl_days": ttl_days }));
        posting.resource_key = resource_key;
        self.validate(&posting)?;

        let expires_at = Utc::now() + Duration::days(ttl_days);
        let (posted, grant) = self.store.grant_promo(posting, expires_at).await?;

        record_posting(&posted);
        info!(
            user_id = %ctx.user_id,
            grant_id = %grant.id,
            amount,
            expires_at = %grant.expires_at,
            "promo tokens granted"
        );

        Ok((posted, grant))
    }

    /// One-time sign-up bonus
    pub async fn grant_registration_bonus(&self, ctx: &RequestContext) -> Result<(Posted, PromoGrant)> {
        if self.policy.registration_bonus == 0 {
            return Err(Error::Conflict("registration bonus is disabled".into()));
        }
        self.grant_promo(
            ctx,
            self.policy.registration_bonus,
            EntryReason::RegistrationBonus,
            Some(REGISTRATION_RESOURCE_KEY.to_string()),
            None,
        )
        .await
    }

    /// Cached balances
    pub async fn balances(&self, user_id: &UserId) -> Result<BalanceCache> {
        self.store.balances(user_id).await
    }

    /// Ledger history, newest first
    pub async fn history(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<HistoryPage> {
        let before = cursor
            .map(|c| {
                Uuid::parse_str(c).map_err(|_| Error::validation("cursor", "malformed cursor"))
            })
            .transpose()?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(Error::validation(
                "limit",
                format!("must be between 1 and {}", MAX_PAGE_SIZE),
            ));
        }

        // One extra row tells us whether another page exists
        let mut items = self.store.ledger_page(user_id, before, limit + 1).await?;
        let next_cursor = if items.len() as i64 > limit {
            items.truncate(limit as usize);
            items.last().map(|e| e.id.to_string())
        } else {
            None
        };

        Ok(HistoryPage { items, next_cursor })
    }

    /// Compare the cache with balances re-derived from the ledger
    pub async fn verify(&self, user_id: &UserId) -> Result<BalanceCheck> {
        let cached = self.store.balances(user_id).await?;
        let derived = self.store.ledger_totals(user_id).await?;
        let consistent = cached.regular_balance == derived.regular_balance
            && cached.promo_balance == derived.promo_balance;

        if !consistent {
            warn!(
                user_id = %user_id,
                cached_regular = cached.regular_balance,
                cached_promo = cached.promo_balance,
                derived_regular = derived.regular_balance,
                derived_promo = derived.promo_balance,
                "balance cache diverged from ledger"
            );
        }

        Ok(BalanceCheck {
            user_id: user_id.clone(),
            cached: cached.view(),
            derived: derived.view(),
            consistent,
        })
    }

    fn validate(&self, posting: &Posting) -> Result<()> {
        if posting.amount <= 0 {
            return Err(Error::validation("amount", "must be positive"));
        }
        if posting.amount > self.policy.max_posting_amount {
            return Err(Error::validation(
                "amount",
                format!("must not exceed {}", self.policy.max_posting_amount),
            ));
        }
        if let Some(key) = &posting.resource_key {
            if key.is_empty() || key.len() > 255 {
                return Err(Error::validation(
                    "resource_key",
                    "must be between 1 and 255 characters",
                ));
            }
        }
        if !posting.metadata.is_object() {
            return Err(Error::validation("metadata", "must be a JSON object"));
        }
        Ok(())
    }
}

/// Count a committed posting
pub(crate) fn record_posting(posted: &Posted) {
    if let Some(first) = posted.entries.first() {
        metrics::POSTINGS_TOTAL
            .with_label_values(&[first.direction.as_str(), first.reason.as_str()])
            .inc();
    }
    for entry in &posted.entries {
        metrics::TOKENS_TOTAL
            .with_label_values(&[entry.direction.as_str(), entry.token_type.as_str()])
            .inc_by(entry.amount as u64);
    }
}
