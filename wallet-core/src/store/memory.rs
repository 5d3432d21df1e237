//! In-process store
//!
//! One mutex guards all maps, so each trait method is atomic and serialized
//! against every other. Every check runs before the first mutation; an error
//! therefore leaves the state untouched. The lock is never held across an
//! await point.

use super::{
    capture_posting, decay_posting, promo_remainder, purchase_posting, CaptureOutcome,
    CaptureRequest, ClaimOutcome, IdempotencyClaim, PromoDecay, SettleOutcome, SettleRequest,
    VoidOutcome, VoidRequest, WalletStore, WebhookRecord,
};
use crate::{
    error::{Error, Result},
    ledger::{check_open_holds, plan_posting},
    metrics,
    receipt::{format_receipt_no, receipt_year},
    types::{
        Authorization, AuthorizationStatus, BalanceCache, EntryReason, IdempotencyRecord,
        IdempotencyStatus, LedgerEntry, NewAuthorization, NewPurchase, Posted, Posting,
        PromoGrant, PromoGrantStatus, Provider, Purchase, PurchaseStatus, UserId, WebhookEvent,
        WebhookEventStatus,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct State {
    balances: HashMap<UserId, BalanceCache>,
    // Insertion order is ledger order
    entries: Vec<LedgerEntry>,
    resource_keys: HashMap<(UserId, EntryReason, String), Uuid>,
    authorizations: HashMap<Uuid, Authorization>,
    purchases: HashMap<Uuid, Purchase>,
    receipt_counters: HashMap<i32, i64>,
    webhook_events: HashMap<Uuid, WebhookEvent>,
    webhook_index: HashMap<(Provider, String), Uuid>,
    idempotency: HashMap<(String, String), IdempotencyRecord>,
    promo_grants: HashMap<Uuid, PromoGrant>,
}

impl State {
    fn balance(&self, user_id: &UserId) -> BalanceCache {
        self.balances
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| BalanceCache::empty(user_id.clone()))
    }

    /// Validate, plan and write a posting
    fn apply(&mut self, posting: Posting, now: DateTime<Utc>) -> Result<Posted> {
        let key = posting
            .resource_key
            .as_ref()
            .map(|k| (posting.user_id.clone(), posting.reason, k.clone()));
        if let Some(key) = &key {
            if let Some(existing) = self.resource_keys.get(key) {
                return Err(Error::DuplicateResource {
                    resource_key: key.2.clone(),
                    existing_id: *existing,
                });
            }
        }

        let mut balances = self.balance(&posting.user_id);
        if posting.honor_holds {
            check_open_holds(&balances, &posting, self.open_holds(&posting.user_id, now))?;
        }
        let parts = plan_posting(&balances, &posting)?;

        let transaction_id = Uuid::now_v7();
        let mut entries = Vec::with_capacity(parts.len());
        for (token_type, amount) in parts {
            let bucket = balances.get_mut(token_type);
            *bucket += posting.direction.signed(amount);
            entries.push(LedgerEntry {
                id: Uuid::now_v7(),
                transaction_id,
                user_id: posting.user_id.clone(),
                direction: posting.direction,
                token_type,
                amount,
                reason: posting.reason,
                resource_key: posting.resource_key.clone(),
                balance_after: *bucket,
                occurred_at: now,
                metadata: posting.metadata.clone(),
                idempotency_key: posting.idempotency_key.clone(),
            });
        }
        balances.updated_at = Some(now);

        if let Some(key) = key {
            self.resource_keys.insert(key, transaction_id);
        }
        self.entries.extend(entries.iter().cloned());
        self.balances
            .insert(posting.user_id.clone(), balances.clone());

        Ok(Posted {
            transaction_id,
            entries,
            balances,
        })
    }

    fn open_holds(&self, user_id: &UserId, now: DateTime<Utc>) -> i64 {
        self.authorizations
            .values()
            .filter(|a| {
                &a.user_id == user_id
                    && a.status == AuthorizationStatus::Held
                    && a.hold_expires_at > now
            })
            .map(|a| a.held_amount)
            .sum()
    }

    fn next_receipt_no(&mut self, prefix: &str, now: DateTime<Utc>, attempts: u32) -> Result<String> {
        let year = receipt_year(now);
        let mut sequence = self.receipt_counters.get(&year).copied().unwrap_or(0);
        for _ in 0..attempts.max(1) {
            sequence += 1;
            let candidate = format_receipt_no(prefix, year, sequence);
            let taken = self
                .purchases
                .values()
                .any(|p| p.receipt_no.as_deref() == Some(candidate.as_str()));
            if !taken {
                self.receipt_counters.insert(year, sequence);
                return Ok(candidate);
            }
            metrics::RECEIPT_RETRIES.inc();
        }
        Err(Error::ReceiptCollision(format!(
            "no free receipt number for {} after {} attempts",
            year, attempts
        )))
    }
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    #[cfg(test)]
    failing_completions: std::sync::atomic::AtomicU32,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` snapshot writes fail
    #[cfg(test)]
    pub(crate) fn fail_completions(&self, n: u32) {
        self.failing_completions
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn post(&self, posting: Posting) -> Result<Posted> {
        self.state.lock().apply(posting, Utc::now())
    }

    async fn grant_promo(
        &self,
        posting: Posting,
        expires_at: DateTime<Utc>,
    ) -> Result<(Posted, PromoGrant)> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let posted = state.apply(posting.clone(), now)?;
        let grant = PromoGrant {
            id: Uuid::now_v7(),
            user_id: posting.user_id,
            amount: posting.amount,
            granted_transaction_id: posted.transaction_id,
            granted_at: now,
            expires_at,
            status: PromoGrantStatus::Active,
            warned_at: None,
            expired_at: None,
            decayed_amount: None,
        };
        state.promo_grants.insert(grant.id, grant.clone());
        Ok((posted, grant))
    }

    async fn balances(&self, user_id: &UserId) -> Result<BalanceCache> {
        Ok(self.state.lock().balance(user_id))
    }

    async fn ledger_totals(&self, user_id: &UserId) -> Result<BalanceCache> {
        let state = self.state.lock();
        let mut totals = BalanceCache::empty(user_id.clone());
        for entry in state.entries.iter().filter(|e| &e.user_id == user_id) {
            *totals.get_mut(entry.token_type) += entry.signed_amount();
            totals.updated_at = Some(entry.occurred_at);
        }
        Ok(totals)
    }

    async fn ledger_page(
        &self,
        user_id: &UserId,
        before: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock();
        let end = match before {
            Some(cursor) => state
                .entries
                .iter()
                .position(|e| e.id == cursor && &e.user_id == user_id)
                .ok_or_else(|| Error::validation("cursor", "unknown cursor"))?,
            None => state.entries.len(),
        };

        Ok(state.entries[..end]
            .iter()
            .rev()
            .filter(|e| &e.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn create_authorization(
        &self,
        new: NewAuthorization,
        now: DateTime<Utc>,
    ) -> Result<Authorization> {
        let held_amount = new
            .held_amount()
            .ok_or_else(|| Error::validation("units", "held amount overflows"))?;

        let mut state = self.state.lock();

        let conflicting = state
            .authorizations
            .values()
            .find(|a| {
                a.user_id == new.user_id
                    && a.feature == new.feature
                    && a.resource_key == new.resource_key
                    && matches!(
                        a.status,
                        AuthorizationStatus::Held | AuthorizationStatus::Captured
                    )
            })
            .map(|a| (a.id, a.status, a.hold_expires_at));

        let mut lapsed = None;
        if let Some((id, status, deadline)) = conflicting {
            if status == AuthorizationStatus::Held && deadline <= now {
                lapsed = Some(id);
            } else {
                return Err(Error::DuplicateResource {
                    resource_key: new.resource_key,
                    existing_id: id,
                });
            }
        }

        let balances = state.balance(&new.user_id);
        let spendable = match new.token_type {
            Some(token_type) => balances.get(token_type),
            None => balances.total(),
        };
        let available = spendable - state.open_holds(&new.user_id, now);
        if available < held_amount {
            return Err(Error::InsufficientTokens {
                required: held_amount,
                available: available.max(0),
            });
        }

        // A hold past its deadline no longer owns the resource key
        if let Some(id) = lapsed {
            if let Some(old) = state.authorizations.get_mut(&id) {
                old.status = AuthorizationStatus::Expired;
                old.expired_at = Some(now);
            }
        }

        let authorization = Authorization {
            id: Uuid::now_v7(),
            user_id: new.user_id,
            feature: new.feature,
            units: new.units,
            cost_per_unit: new.cost_per_unit,
            held_amount,
            token_type: new.token_type,
            resource_key: new.resource_key,
            status: AuthorizationStatus::Held,
            metadata: new.metadata,
            hold_expires_at: new.hold_expires_at,
            created_at: now,
            captured_at: None,
            voided_at: None,
            expired_at: None,
            result_id: None,
            capture_transaction_id: None,
            debited: None,
            balances_after: None,
            upstream_status: None,
            failure_code: None,
            failure_msg: None,
        };
        state
            .authorizations
            .insert(authorization.id, authorization.clone());
        Ok(authorization)
    }

    async fn get_authorization(
        &self,
        id: Uuid,
        user_id: &UserId,
    ) -> Result<Option<Authorization>> {
        Ok(self
            .state
            .lock()
            .authorizations
            .get(&id)
            .filter(|a| &a.user_id == user_id)
            .cloned())
    }

    async fn capture_authorization(&self, request: CaptureRequest) -> Result<CaptureOutcome> {
        let mut state = self.state.lock();
        let hold = state
            .authorizations
            .get(&request.authorization_id)
            .filter(|a| a.user_id == request.user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("authorization {}", request.authorization_id)))?;

        match hold.status {
            AuthorizationStatus::Captured => return Ok(CaptureOutcome::AlreadyCaptured(hold)),
            AuthorizationStatus::Voided | AuthorizationStatus::Expired => {
                return Ok(CaptureOutcome::NotCapturable(hold))
            }
            AuthorizationStatus::Held => {}
        }

        if request.now >= hold.hold_expires_at {
            let mut expired = hold;
            expired.status = AuthorizationStatus::Expired;
            expired.expired_at = Some(request.now);
            state.authorizations.insert(expired.id, expired.clone());
            return Ok(CaptureOutcome::Expired(expired));
        }

        let posting = capture_posting(&hold, request.idempotency_key.clone());
        let posted = state.apply(posting, request.now)?;

        let mut captured = hold;
        captured.status = AuthorizationStatus::Captured;
        captured.captured_at = Some(request.now);
        captured.result_id = request.result_id;
        captured.upstream_status = request.upstream_status;
        captured.capture_transaction_id = Some(posted.transaction_id);
        captured.debited = Some(posted.amount());
        captured.balances_after = Some(posted.balances.view());
        state.authorizations.insert(captured.id, captured.clone());

        Ok(CaptureOutcome::Captured {
            authorization: captured,
            posted,
        })
    }

    async fn void_authorization(&self, request: VoidRequest) -> Result<VoidOutcome> {
        let mut state = self.state.lock();
        let hold = state
            .authorizations
            .get_mut(&request.authorization_id)
            .filter(|a| a.user_id == request.user_id)
            .ok_or_else(|| Error::NotFound(format!("authorization {}", request.authorization_id)))?;

        match hold.status {
            AuthorizationStatus::Voided => Ok(VoidOutcome::AlreadyVoided(hold.clone())),
            AuthorizationStatus::Captured | AuthorizationStatus::Expired => {
                Ok(VoidOutcome::NotVoidable(hold.clone()))
            }
            AuthorizationStatus::Held => {
                hold.status = AuthorizationStatus::Voided;
                hold.voided_at = Some(request.now);
                hold.upstream_status = request.upstream_status;
                hold.failure_code = request.failure_code;
                hold.failure_msg = request.failure_msg;
                Ok(VoidOutcome::Voided(hold.clone()))
            }
        }
    }

    async fn expire_authorizations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Authorization>> {
        let mut state = self.state.lock();
        let mut due: Vec<&mut Authorization> = state
            .authorizations
            .values_mut()
            .filter(|a| a.status == AuthorizationStatus::Held && a.hold_expires_at <= now)
            .collect();
        due.sort_by_key(|a| a.hold_expires_at);

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|a| {
                a.status = AuthorizationStatus::Expired;
                a.expired_at = Some(now);
                a.clone()
            })
            .collect())
    }

    async fn insert_purchase(&self, new: NewPurchase, now: DateTime<Utc>) -> Result<Purchase> {
        let mut state = self.state.lock();
        let duplicate_order = state.purchases.values().any(|p| {
            p.provider == new.provider && p.provider_order_id == new.provider_order_id
        });
        if duplicate_order || state.purchases.contains_key(&new.id) {
            return Err(Error::Conflict(format!(
                "purchase for order {} already exists",
                new.provider_order_id
            )));
        }

        let purchase = Purchase {
            id: new.id,
            user_id: new.user_id,
            status: PurchaseStatus::Created,
            tokens: new.tokens,
            inr_amount: new.inr_amount,
            provider: new.provider,
            provider_order_id: new.provider_order_id,
            provider_payment_id: None,
            receipt_no: None,
            idempotency_key: new.idempotency_key,
            ledger_transaction_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        };
        state.purchases.insert(purchase.id, purchase.clone());
        Ok(purchase)
    }

    async fn get_purchase(&self, id: Uuid) -> Result<Option<Purchase>> {
        Ok(self.state.lock().purchases.get(&id).cloned())
    }

    async fn find_purchase_by_order(
        &self,
        provider: Provider,
        provider_order_id: &str,
    ) -> Result<Option<Purchase>> {
        Ok(self
            .state
            .lock()
            .purchases
            .values()
            .find(|p| p.provider == provider && p.provider_order_id == provider_order_id)
            .cloned())
    }

    async fn settle_purchase(&self, request: SettleRequest) -> Result<SettleOutcome> {
        let mut state = self.state.lock();
        let purchase = state
            .purchases
            .get(&request.purchase_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("purchase {}", request.purchase_id)))?;

        if purchase.status == PurchaseStatus::Paid {
            return Ok(SettleOutcome::AlreadyPaid(purchase));
        }
        if !purchase.status.is_creditable() {
            return Ok(SettleOutcome::NotCreditable(purchase));
        }

        // Counter changes must not survive a failed credit
        let counters = state.receipt_counters.clone();
        let receipt_no = state.next_receipt_no(
            &request.receipt_prefix,
            request.now,
            request.max_allocation_attempts,
        )?;

        let posting = purchase_posting(&purchase);
        let posted = match state.apply(posting, request.now) {
            Ok(posted) => posted,
            Err(e) => {
                state.receipt_counters = counters;
                return Err(e);
            }
        };

        let mut paid = purchase;
        paid.status = PurchaseStatus::Paid;
        paid.provider_payment_id = request.provider_payment_id.or(paid.provider_payment_id);
        paid.receipt_no = Some(receipt_no);
        paid.ledger_transaction_id = Some(posted.transaction_id);
        paid.failure_reason = None;
        paid.paid_at = Some(request.now);
        paid.updated_at = request.now;
        state.purchases.insert(paid.id, paid.clone());

        Ok(SettleOutcome::Credited {
            purchase: paid,
            posted,
        })
    }

    async fn transition_purchase(
        &self,
        id: Uuid,
        from: &[PurchaseStatus],
        to: PurchaseStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Purchase>> {
        let mut state = self.state.lock();
        let purchase = state
            .purchases
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("purchase {}", id)))?;

        if !from.contains(&purchase.status) {
            return Ok(None);
        }
        purchase.status = to;
        purchase.failure_reason = reason;
        purchase.updated_at = now;
        Ok(Some(purchase.clone()))
    }

    async fn expire_stale_purchases(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut expired = 0u64;
        for purchase in state.purchases.values_mut() {
            if expired >= limit.max(0) as u64 {
                break;
            }
            if matches!(purchase.status, PurchaseStatus::Created | PurchaseStatus::Pending)
                && purchase.created_at < created_before
            {
                purchase.status = PurchaseStatus::Expired;
                purchase.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn paid_purchases(&self, user_id: &UserId) -> Result<Vec<Purchase>> {
        let state = self.state.lock();
        let mut paid: Vec<Purchase> = state
            .purchases
            .values()
            .filter(|p| &p.user_id == user_id && p.status == PurchaseStatus::Paid)
            .cloned()
            .collect();
        paid.sort_by(|a, b| b.paid_at.cmp(&a.paid_at).then(b.id.cmp(&a.id)));
        Ok(paid)
    }

    async fn purchase_by_receipt(&self, receipt_no: &str) -> Result<Option<Purchase>> {
        Ok(self
            .state
            .lock()
            .purchases
            .values()
            .find(|p| p.receipt_no.as_deref() == Some(receipt_no))
            .cloned())
    }

    async fn record_webhook_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookRecord> {
        let mut state = self.state.lock();
        let index_key = (provider, event_id.to_string());
        if let Some(existing) = state
            .webhook_index
            .get(&index_key)
            .and_then(|id| state.webhook_events.get(id))
        {
            return Ok(WebhookRecord::Duplicate(existing.clone()));
        }

        let event = WebhookEvent {
            id: Uuid::now_v7(),
            provider,
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            status: WebhookEventStatus::Received,
            received_at: now,
            processed_at: None,
            error_msg: None,
        };
        state.webhook_index.insert(index_key, event.id);
        state.webhook_events.insert(event.id, event.clone());
        Ok(WebhookRecord::Inserted(event))
    }

    async fn finish_webhook_event(
        &self,
        id: Uuid,
        status: WebhookEventStatus,
        error_msg: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let event = state
            .webhook_events
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("webhook event {}", id)))?;
        event.status = status;
        event.error_msg = error_msg;
        event.processed_at = Some(now);
        Ok(())
    }

    async fn claim_idempotency(&self, claim: IdempotencyClaim) -> Result<ClaimOutcome> {
        let mut state = self.state.lock();
        let key = (claim.key.clone(), claim.scope.clone());
        if let Some(existing) = state.idempotency.get(&key) {
            // An in-progress record may front a committed effect; only a
            // finished one is released by its TTL.
            if existing.expires_at > claim.now || existing.status == IdempotencyStatus::InProgress {
                return Ok(ClaimOutcome::Existing(existing.clone()));
            }
        }

        state.idempotency.insert(
            key,
            IdempotencyRecord {
                key: claim.key,
                scope: claim.scope,
                user_id: claim.user_id,
                request_fingerprint: claim.fingerprint,
                status: IdempotencyStatus::InProgress,
                response_snapshot: None,
                status_code: None,
                created_at: claim.now,
                completed_at: None,
                expires_at: claim.expires_at,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn get_idempotency(&self, key: &str, scope: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .state
            .lock()
            .idempotency
            .get(&(key.to_string(), scope.to_string()))
            .cloned())
    }

    async fn complete_idempotency(
        &self,
        key: &str,
        scope: &str,
        snapshot: serde_json::Value,
        status_code: u16,
        now: DateTime<Utc>,
    ) -> Result<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .failing_completions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Storage("snapshot write failed".into()));
            }
        }

        let mut state = self.state.lock();
        let record = state
            .idempotency
            .get_mut(&(key.to_string(), scope.to_string()))
            .ok_or_else(|| Error::NotFound(format!("idempotency record {}", key)))?;
        record.status = IdempotencyStatus::Completed;
        record.response_snapshot = Some(snapshot);
        record.status_code = Some(status_code);
        record.completed_at = Some(now);
        Ok(())
    }

    async fn release_idempotency(&self, key: &str, scope: &str) -> Result<()> {
        let mut state = self.state.lock();
        let key = (key.to_string(), scope.to_string());
        if state
            .idempotency
            .get(&key)
            .is_some_and(|r| r.status == IdempotencyStatus::InProgress)
        {
            state.idempotency.remove(&key);
        }
        Ok(())
    }

    async fn purge_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.idempotency.len();
        state
            .idempotency
            .retain(|_, r| r.status == IdempotencyStatus::InProgress || r.expires_at > now);
        Ok((before - state.idempotency.len()) as u64)
    }

    async fn promo_grants_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<PromoGrant>> {
        let state = self.state.lock();
        let mut due: Vec<PromoGrant> = state
            .promo_grants
            .values()
            .filter(|g| g.status == PromoGrantStatus::Active && g.expires_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn decay_promo_grant(
        &self,
        grant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PromoDecay>> {
        let mut state = self.state.lock();
        let grant = match state.promo_grants.get(&grant_id) {
            Some(g) if g.status == PromoGrantStatus::Active => g.clone(),
            _ => return Ok(None),
        };

        let later_total: i64 = state
            .promo_grants
            .values()
            .filter(|g| {
                g.user_id == grant.user_id
                    && g.status == PromoGrantStatus::Active
                    && (g.expires_at, g.id) > (grant.expires_at, grant.id)
            })
            .map(|g| g.amount)
            .sum();
        let promo_balance = state.balance(&grant.user_id).promo_balance;
        let remainder = promo_remainder(grant.amount, promo_balance, later_total);

        let posted = if remainder > 0 {
            let posting = decay_posting(&grant, remainder);
            Some(state.apply(posting, now)?)
        } else {
            None
        };

        let expired = state
            .promo_grants
            .get_mut(&grant_id)
            .map(|g| {
                g.status = PromoGrantStatus::Expired;
                g.expired_at = Some(now);
                g.decayed_amount = Some(remainder);
                g.clone()
            })
            .ok_or_else(|| Error::NotFound(format!("promo grant {}", grant_id)))?;

        Ok(Some(PromoDecay {
            grant: expired,
            posted,
        }))
    }

    async fn take_promo_warnings(
        &self,
        warn_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PromoGrant>> {
        let mut state = self.state.lock();
        let mut warned = Vec::new();
        for grant in state.promo_grants.values_mut() {
            if warned.len() as i64 >= limit {
                break;
            }
            if grant.status == PromoGrantStatus::Active
                && grant.warned_at.is_none()
                && grant.expires_at > now
                && grant.expires_at <= warn_before
            {
                grant.warned_at = Some(now);
                warned.push(grant.clone());
            }
        }
        Ok(warned)
    }
}
