//! Idempotency guard
//!
//! Wraps a mutating operation so that a (key, scope) pair executes at most
//! once. The first call claims an `in_progress` record, runs the operation
//! and stores the serialized result; later calls with the same key and body
//! get that stored result back, byte for byte. A call that arrives while the
//! original is still running waits for a bounded time and then fails with
//! [`Error::IdempotencyInProgress`]; it never runs the operation itself.
//!
//! Failed executions are not recorded: the claim is released and a retry
//! runs the operation again. A successful execution whose snapshot cannot be
//! written keeps its `in_progress` record, which never lapses or gets purged,
//! so the key is refused from then on instead of re-running the operation.
//! Ledger writes behind the guard also carry resource keys, which stop a
//! second effect even if the record is lost.

use crate::{
    config::IdempotencyConfig,
    metrics,
    store::{ClaimOutcome, IdempotencyClaim, WalletStore},
    types::{IdempotencyRecord, IdempotencyStatus, RequestContext, UserId},
    Error, Result,
};
use chrono::{Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Longest accepted idempotency key
pub const MAX_KEY_LEN: usize = 255;

const SNAPSHOT_ATTEMPTS: u32 = 3;

/// Response produced through the guard
#[derive(Debug, Clone, PartialEq)]
pub struct Guarded {
    /// Response body (the stored snapshot on replays)
    pub body: serde_json::Value,
    /// Response status
    pub status_code: u16,
    /// True when served from a stored snapshot
    pub replayed: bool,
}

/// `operation:user[:resource]`
pub fn scope(operation: &str, user_id: &UserId, resource: Option<&str>) -> String {
    match resource {
        Some(resource) => format!("{}:{}:{}", operation, user_id, resource),
        None => format!("{}:{}", operation, user_id),
    }
}

/// SHA-256 (hex) of the canonical JSON form of a request body.
///
/// Going through `serde_json::Value` sorts object keys, so field order in the
/// client's JSON does not matter.
pub fn fingerprint<T: Serialize>(request: &T) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(request)?)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Check the client-supplied key
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::validation(
            "Idempotency-Key",
            format!("must be 1 to {} characters", MAX_KEY_LEN),
        ));
    }
    if !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(Error::validation(
            "Idempotency-Key",
            "must contain visible ASCII characters only",
        ));
    }
    Ok(())
}

/// Exactly-once wrapper for mutating operations
pub struct IdempotencyGuard {
    store: Arc<dyn WalletStore>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    /// Create guard
    pub fn new(store: Arc<dyn WalletStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    /// Run `operation` at most once for `(ctx.idempotency_key, scope)`
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        scope: &str,
        fingerprint: String,
        status_code: u16,
        operation: F,
    ) -> Result<Guarded>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = ctx
            .idempotency_key
            .as_deref()
            .ok_or_else(|| Error::validation("Idempotency-Key", "header is required"))?;
        validate_key(key)?;

        let deadline =
            Instant::now() + std::time::Duration::from_millis(self.config.wait_for_in_progress_ms);

        loop {
            let now = Utc::now();
            let claim = IdempotencyClaim {
                key: key.to_string(),
                scope: scope.to_string(),
                user_id: ctx.user_id.clone(),
                fingerprint: fingerprint.clone(),
                now,
                expires_at: now + Duration::hours(self.config.ttl_hours),
            };

            match self.store.claim_idempotency(claim).await? {
                ClaimOutcome::Claimed => {
                    return self.execute(ctx, key, scope, status_code, operation).await;
                }
                ClaimOutcome::Existing(record) => {
                    if record.request_fingerprint != fingerprint || record.user_id != ctx.user_id {
                        metrics::IDEMPOTENCY_TOTAL
                            .with_label_values(&["key_reused"])
                            .inc();
                        return Err(Error::IdempotencyKeyReused);
                    }

                    if let Some(replay) = replay(&record) {
                        metrics::IDEMPOTENCY_TOTAL.with_label_values(&["replayed"]).inc();
                        debug!(
                            request_id = %ctx.request_id,
                            key,
                            scope,
                            "replaying stored response"
                        );
                        return Ok(replay);
                    }

                    if Instant::now() >= deadline {
                        metrics::IDEMPOTENCY_TOTAL
                            .with_label_values(&["in_progress"])
                            .inc();
                        return Err(Error::IdempotencyInProgress {
                            retry_after_secs: self.config.retry_after_secs,
                        });
                    }
                    tokio::time::sleep(self.poll_interval()).await;
                }
            }
        }
    }

    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    async fn execute<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        key: &str,
        scope: &str,
        status_code: u16,
        operation: F,
    ) -> Result<Guarded>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = match operation().await {
            Ok(value) => serde_json::to_value(value).map_err(Error::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(body) => {
                if let Err(e) = self.store_snapshot(key, scope, &body, status_code).await {
                    // The effect is committed; answer with it and leave the
                    // claim in place.
                    error!(
                        request_id = %ctx.request_id,
                        key,
                        scope,
                        "failed to store idempotent response: {}",
                        e
                    );
                    metrics::IDEMPOTENCY_TOTAL
                        .with_label_values(&["snapshot_failed"])
                        .inc();
                } else {
                    metrics::IDEMPOTENCY_TOTAL.with_label_values(&["executed"]).inc();
                }
                Ok(Guarded {
                    body,
                    status_code,
                    replayed: false,
                })
            }
            Err(e) => {
                if let Err(release_err) = self.store.release_idempotency(key, scope).await {
                    warn!(
                        request_id = %ctx.request_id,
                        key,
                        scope,
                        "failed to release idempotency claim: {}",
                        release_err
                    );
                }
                metrics::IDEMPOTENCY_TOTAL.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    async fn store_snapshot(
        &self,
        key: &str,
        scope: &str,
        body: &serde_json::Value,
        status_code: u16,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .complete_idempotency(key, scope, body.clone(), status_code, Utc::now())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < SNAPSHOT_ATTEMPTS => {
                    warn!(key, scope, attempt, "retrying idempotent response write: {}", e);
                    attempt += 1;
                    tokio::time::sleep(self.poll_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn replay(record: &IdempotencyRecord) -> Option<Guarded> {
    if record.status != IdempotencyStatus::Completed {
        return None;
    }
    Some(Guarded {
        body: record.response_snapshot.clone()?,
        status_code: record.status_code.unwrap_or(200),
        replayed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard() -> (IdempotencyGuard, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = IdempotencyConfig {
            wait_for_in_progress_ms: 50,
            poll_interval_ms: 10,
            ..IdempotencyConfig::default()
        };
        (IdempotencyGuard::new(store.clone(), config), store)
    }

    fn ctx(key: &str) -> RequestContext {
        RequestContext::new(UserId::new("u1")).with_idempotency_key(key)
    }

    #[test]
    fn test_fingerprint_ignores_field_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_ne!(
            fingerprint(&a).unwrap(),
            fingerprint(&serde_json::json!({"a": 2, "b": 2})).unwrap()
        );
    }

    #[test]
    fn test_scope_format() {
        let user = UserId::new("u1");
        assert_eq!(scope("deduct", &user, None), "deduct:u1");
        assert_eq!(scope("capture", &user, Some("abc")), "capture:u1:abc");
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("order-1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key(&"k".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn test_second_call_replays_snapshot() {
        let (guard, _) = guard();
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        let op = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(serde_json::json!({"balance": 240}))
        };

        let first = guard.run(&ctx("k1"), "deduct:u1", "fp".into(), 200, op).await.unwrap();
        let second = guard.run(&ctx("k1"), "deduct:u1", "fp".into(), 200, op).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn test_different_body_rejected() {
        let (guard, _) = guard();
        guard
            .run(&ctx("k1"), "deduct:u1", "fp-a".into(), 200, || async {
                Ok::<_, Error>(1)
            })
            .await
            .unwrap();

        let err = guard
            .run(&ctx("k1"), "deduct:u1", "fp-b".into(), 200, || async {
                Ok::<_, Error>(2)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdempotencyKeyReused));
    }

    #[tokio::test]
    async fn test_failure_releases_claim() {
        let (guard, store) = guard();
        let err = guard
            .run(&ctx("k1"), "deduct:u1", "fp".into(), 200, || async {
                Err::<i32, _>(Error::Conflict("nope".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert!(store.get_idempotency("k1", "deduct:u1").await.unwrap().is_none());

        let ok = guard
            .run(&ctx("k1"), "deduct:u1", "fp".into(), 200, || async { Ok::<_, Error>(7) })
            .await
            .unwrap();
        assert_eq!(ok.body, serde_json::json!(7));
    }

    #[tokio::test]
    async fn test_in_flight_duplicate_gets_retry_after() {
        let (guard, store) = guard();
        let now = Utc::now();
        store
            .claim_idempotency(IdempotencyClaim {
                key: "k1".into(),
                scope: "deduct:u1".into(),
                user_id: UserId::new("u1"),
                fingerprint: "fp".into(),
                now,
                expires_at: now + Duration::hours(1),
            })
            .await
            .unwrap();

        let err = guard
            .run(&ctx("k1"), "deduct:u1", "fp".into(), 200, || async {
                Ok::<_, Error>(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdempotencyInProgress { retry_after_secs: 2 }));
    }

    #[tokio::test]
    async fn test_snapshot_write_is_retried() {
        let (guard, store) = guard();
        store.fail_completions(1);

        let first = guard
            .run(&ctx("k1"), "deduct:u1", "fp".into(), 200, || async { Ok::<_, Error>(5) })
            .await
            .unwrap();
        assert!(!first.replayed);

        let record = store.get_idempotency("k1", "deduct:u1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.response_snapshot, Some(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn test_lost_snapshot_keeps_key_blocked() {
        let (guard, store) = guard();
        store.fail_completions(3);
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let op = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(serde_json::json!({"credited": 100}))
        };

        let first = guard.run(&ctx("k1"), "seed:u1", "fp".into(), 201, op).await.unwrap();
        assert_eq!(first.body["credited"], 100);

        let err = guard
            .run(&ctx("k1"), "seed:u1", "fp".into(), 201, op)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdempotencyInProgress { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Neither expiry nor the purge frees the stuck claim
        let later = Utc::now() + Duration::days(2);
        let reclaim = store
            .claim_idempotency(IdempotencyClaim {
                key: "k1".into(),
                scope: "seed:u1".into(),
                user_id: UserId::new("u1"),
                fingerprint: "fp".into(),
                now: later,
                expires_at: later + Duration::hours(24),
            })
            .await
            .unwrap();
        assert!(matches!(reclaim, ClaimOutcome::Existing(_)));
        assert_eq!(store.purge_idempotency(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_rejected() {
        let (guard, _) = guard();
        let ctx = RequestContext::new(UserId::new("u1"));
        let err = guard
            .run(&ctx, "deduct:u1", "fp".into(), 200, || async { Ok::<_, Error>(1) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
