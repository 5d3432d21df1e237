//! Expiry sweepers
//!
//! One pass expires lapsed holds, decays promo grants past their deadline,
//! flags grants about to decay, purges stale idempotency records and expires
//! abandoned purchases. Every step is a compare-and-set in the store, so two
//! sweepers running at once (or a pass repeated after a crash) never apply a
//! row twice.

use crate::{
    authorization::AuthorizationEngine,
    config::{SweeperConfig, TokenPolicy},
    ledger::record_posting,
    metrics,
    purchase::PurchaseService,
    store::WalletStore,
    Result,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{error, info, warn};

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Holds moved to `expired`
    pub holds_expired: u64,
    /// Promo grants moved to `expired`
    pub promo_grants_decayed: u64,
    /// Promo tokens debited by decay
    pub promo_tokens_decayed: i64,
    /// Grants flagged as expiring soon
    pub promo_warnings: u64,
    /// Idempotency records deleted
    pub idempotency_purged: u64,
    /// Purchases moved to `expired`
    pub purchases_expired: u64,
    /// Grants whose decay failed (retried next pass)
    pub errors: u64,
}

/// Background expiry jobs
pub struct Sweeper {
    store: Arc<dyn WalletStore>,
    authorizations: Arc<AuthorizationEngine>,
    purchases: Arc<PurchaseService>,
    policy: TokenPolicy,
    config: SweeperConfig,
}

impl Sweeper {
    /// Create sweeper
    pub fn new(
        store: Arc<dyn WalletStore>,
        authorizations: Arc<AuthorizationEngine>,
        purchases: Arc<PurchaseService>,
        policy: TokenPolicy,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            authorizations,
            purchases,
            policy,
            config,
        }
    }

    /// One pass at `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let batch = self.config.batch_size.max(1);
        let mut report = SweepReport::default();

        report.holds_expired = self.authorizations.expire_due(now, batch).await?.len() as u64;
        self.decay_promos(now, batch, &mut report).await?;

        let warn_before = now + Duration::days(self.policy.promo_warning_days);
        for grant in self.store.take_promo_warnings(warn_before, now, batch).await? {
            info!(
                user_id = %grant.user_id,
                grant_id = %grant.id,
                amount = grant.amount,
                expires_at = %grant.expires_at,
                "promo tokens expiring soon"
            );
            report.promo_warnings += 1;
        }
        metrics::PROMO_WARNINGS.inc_by(report.promo_warnings);

        report.idempotency_purged = self.store.purge_idempotency(now).await?;
        report.purchases_expired = self
            .purchases
            .expire_stale(now - Duration::hours(self.config.purchase_ttl_hours), batch)
            .await?;

        for (kind, rows) in [
            ("holds", report.holds_expired),
            ("promo_grants", report.promo_grants_decayed),
            ("idempotency", report.idempotency_purged),
            ("purchases", report.purchases_expired),
        ] {
            metrics::SWEEP_ROWS_TOTAL.with_label_values(&[kind]).inc_by(rows);
        }

        info!(
            holds_expired = report.holds_expired,
            promo_grants_decayed = report.promo_grants_decayed,
            promo_tokens_decayed = report.promo_tokens_decayed,
            promo_warnings = report.promo_warnings,
            idempotency_purged = report.idempotency_purged,
            purchases_expired = report.purchases_expired,
            errors = report.errors,
            "sweep complete"
        );
        Ok(report)
    }

    async fn decay_promos(
        &self,
        now: DateTime<Utc>,
        batch: i64,
        report: &mut SweepReport,
    ) -> Result<()> {
        for grant in self.store.promo_grants_due(now, batch).await? {
            match self.store.decay_promo_grant(grant.id, now).await {
                Ok(Some(decay)) => {
                    report.promo_grants_decayed += 1;
                    if let Some(posted) = &decay.posted {
                        record_posting(posted);
                        report.promo_tokens_decayed += posted.amount();
                    }
                    info!(
                        user_id = %decay.grant.user_id,
                        grant_id = %decay.grant.id,
                        decayed = decay.grant.decayed_amount.unwrap_or(0),
                        "promo grant expired"
                    );
                }
                // Taken by a concurrent sweeper
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(grant_id = %grant.id, "promo decay failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Run passes forever at the configured interval
    pub async fn start_loop(self: Arc<Self>) {
        let mut ticker = interval(std::time::Duration::from_secs(
            self.config.interval_secs.max(1),
        ));

        info!(
            "Starting expiry sweeper with {} second interval",
            self.config.interval_secs
        );

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                error!("Sweep failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::CreateAuthorization;
    use crate::config::{AuthorizationConfig, ReceiptConfig};
    use crate::gateway::GatewayRegistry;
    use crate::ledger::Ledger;
    use crate::store::MemoryStore;
    use crate::types::{
        AuthorizationStatus, EntryReason, Feature, PromoGrantStatus, RequestContext, TokenSelector,
        TokenType, UserId,
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: Ledger,
        authorizations: Arc<AuthorizationEngine>,
        sweeper: Sweeper,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let authorizations = Arc::new(AuthorizationEngine::new(
            store.clone(),
            AuthorizationConfig::default(),
        ));
        let purchases = Arc::new(PurchaseService::new(
            store.clone(),
            GatewayRegistry::new(),
            TokenPolicy::default(),
            ReceiptConfig::default(),
        ));
        let sweeper = Sweeper::new(
            store.clone(),
            authorizations.clone(),
            purchases,
            TokenPolicy::default(),
            SweeperConfig::default(),
        );
        Fixture {
            ledger: Ledger::new(store.clone(), TokenPolicy::default()),
            store,
            authorizations,
            sweeper,
        }
    }

    fn ctx(key: &str) -> RequestContext {
        RequestContext::new(UserId::new("u1")).with_idempotency_key(key)
    }

    #[tokio::test]
    async fn test_lapsed_hold_expired_without_ledger_row() {
        let f = fixture();
        f.ledger
            .credit(&ctx("seed"), TokenType::Regular, 50, EntryReason::AdminSeed, Some("seed:1".into()), None)
            .await
            .unwrap();
        let hold = f
            .authorizations
            .create(
                &ctx("hold"),
                CreateAuthorization {
                    feature: Feature::ChapterGeneration,
                    units: 1,
                    cost_per_unit: 10,
                    resource_key: "chapter-1".into(),
                    token_type: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();

        let later = Utc::now() + Duration::hours(1);
        let report = f.sweeper.run_once(later).await.unwrap();
        assert_eq!(report.holds_expired, 1);

        let expired = f.authorizations.get(&ctx("get"), hold.authorization_id).await.unwrap();
        assert_eq!(expired.status, AuthorizationStatus::Expired);
        let page = f.ledger.history(&UserId::new("u1"), None, None).await.unwrap();
        assert_eq!(page.items.len(), 1);

        // Re-running finds nothing left to do
        assert_eq!(f.sweeper.run_once(later).await.unwrap().holds_expired, 0);
    }

    #[tokio::test]
    async fn test_promo_decay_removes_unspent_remainder() {
        let f = fixture();
        let (_, grant) = f
            .ledger
            .grant_promo(&ctx("promo"), 100, EntryReason::PromoGrant, Some("promo:1".into()), Some(1))
            .await
            .unwrap();
        f.ledger
            .debit(
                &ctx("spend"),
                TokenSelector::PromoFirst,
                30,
                EntryReason::ChapterGeneration,
                Some("chapter-9".into()),
                None,
            )
            .await
            .unwrap();

        let report = f.sweeper.run_once(grant.expires_at).await.unwrap();
        assert_eq!(report.promo_grants_decayed, 1);
        assert_eq!(report.promo_tokens_decayed, 70);
        assert_eq!(f.store.balances(&UserId::new("u1")).await.unwrap().promo_balance, 0);

        let again = f.sweeper.run_once(grant.expires_at).await.unwrap();
        assert_eq!(again.promo_grants_decayed, 0);
    }

    #[tokio::test]
    async fn test_warning_emitted_once() {
        let f = fixture();
        let (_, grant) = f
            .ledger
            .grant_promo(&ctx("promo"), 40, EntryReason::PromoGrant, Some("promo:2".into()), Some(2))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(f.sweeper.run_once(now).await.unwrap().promo_warnings, 1);
        assert_eq!(f.sweeper.run_once(now).await.unwrap().promo_warnings, 0);

        let due = f.store.promo_grants_due(grant.expires_at, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, PromoGrantStatus::Active);
        assert!(due[0].warned_at.is_some());
    }
}
