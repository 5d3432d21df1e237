//! End-to-end wallet scenarios over the in-memory store

use chrono::{Datelike, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use wallet_core::{
    authorization::{CaptureAuthorization, CreateAuthorization, VoidAuthorization},
    gateway::GatewayRegistry,
    purchase::CreatePurchase,
    types::{NewPurchase, WebhookEventStatus},
    wallet::AdminCredit,
    webhook::{WebhookHeaders, WebhookVerifier, WebhookVerifiers},
    Feature, MemoryStore, Provider, PurchaseStatus, RequestContext, UserId, Wallet, WalletConfig,
    WalletStore,
};

fn wallet() -> Arc<Wallet> {
    Arc::new(Wallet::in_memory(WalletConfig::default()).unwrap())
}

fn ctx(user: &str, key: &str) -> RequestContext {
    RequestContext::new(UserId::new(user)).with_idempotency_key(key)
}

async fn seed(wallet: &Wallet, user: &str, amount: i64) {
    wallet
        .admin_seed(
            &ctx(user, &format!("seed-{}", Uuid::new_v4())),
            AdminCredit {
                amount,
                resource_key: None,
                note: None,
            },
        )
        .await
        .unwrap();
}

fn hold_request(resource_key: &str, cost: i64) -> CreateAuthorization {
    CreateAuthorization {
        feature: Feature::ChapterGeneration,
        units: 1,
        cost_per_unit: cost,
        resource_key: resource_key.into(),
        token_type: None,
        metadata: None,
    }
}

async fn hold(wallet: &Wallet, user: &str, resource_key: &str, cost: i64) -> Uuid {
    let created = wallet
        .authorize(&ctx(user, &format!("hold-{}", resource_key)), hold_request(resource_key, cost))
        .await
        .unwrap();
    serde_json::from_value(created.body["authorization_id"].clone()).unwrap()
}

async fn total(wallet: &Wallet, user: &str) -> i64 {
    wallet.balances(&UserId::new(user)).await.unwrap().balances.total
}

async fn ledger_rows(wallet: &Wallet, user: &str) -> usize {
    wallet
        .history(&UserId::new(user), None, Some(200))
        .await
        .unwrap()
        .items
        .len()
}

/// Create a purchase and return (purchase_id, provider_order_id)
async fn purchase(wallet: &Wallet, user: &str, tokens: i64) -> (Uuid, String) {
    let created = wallet
        .create_purchase(
            &ctx(user, &format!("buy-{}", Uuid::new_v4())),
            CreatePurchase {
                tokens,
                provider: Provider::Mock,
            },
        )
        .await
        .unwrap();
    (
        serde_json::from_value(created.body["purchase_id"].clone()).unwrap(),
        created.body["provider_order_id"].as_str().unwrap().to_string(),
    )
}

fn captured_webhook(wallet: &Wallet, order_id: &str, amount: i64, event_id: &str) -> (Vec<u8>, WebhookHeaders) {
    let body = serde_json::to_vec(&serde_json::json!({
        "event": "payment.captured",
        "payload": {
            "payment": {"entity": {
                "id": format!("pay_{}", event_id),
                "order_id": order_id,
                "amount": amount
            }}
        }
    }))
    .unwrap();
    let signature = wallet
        .webhooks()
        .verifier(Provider::Mock)
        .unwrap()
        .sign(&body, Utc::now())
        .unwrap();
    (
        body,
        WebhookHeaders {
            signature: Some(signature),
            event_id: Some(event_id.to_string()),
        },
    )
}

#[tokio::test]
async fn test_hold_then_capture_debits_once() {
    let wallet = wallet();
    seed(&wallet, "alice", 250).await;
    let id = hold(&wallet, "alice", "chapter-1", 10).await;

    // A hold reserves but does not debit
    assert_eq!(total(&wallet, "alice").await, 250);

    let first = wallet
        .capture(&ctx("alice", "cap-1"), id, CaptureAuthorization::default())
        .await
        .unwrap();
    assert_eq!(first.body["debited"], 10);
    assert_eq!(total(&wallet, "alice").await, 240);

    // Same key: stored response
    let replay = wallet
        .capture(&ctx("alice", "cap-1"), id, CaptureAuthorization::default())
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.body, first.body);

    // New key: the hold reports the earlier capture
    let again = wallet
        .capture(&ctx("alice", "cap-2"), id, CaptureAuthorization::default())
        .await
        .unwrap();
    assert_eq!(again.body["already_captured"], true);
    assert_eq!(total(&wallet, "alice").await, 240);
    assert_eq!(ledger_rows(&wallet, "alice").await, 2);
}

#[tokio::test]
async fn test_capture_after_void_is_conflict() {
    let wallet = wallet();
    seed(&wallet, "bob", 100).await;
    let id = hold(&wallet, "bob", "test-1", 20).await;

    wallet
        .void(&ctx("bob", "void-1"), id, VoidAuthorization::default())
        .await
        .unwrap();
    let err = wallet
        .capture(&ctx("bob", "cap-1"), id, CaptureAuthorization::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
    assert_eq!(total(&wallet, "bob").await, 100);
    assert_eq!(ledger_rows(&wallet, "bob").await, 1);
}

#[tokio::test]
async fn test_swept_hold_expires_without_ledger_row() {
    let wallet = wallet();
    seed(&wallet, "carol", 100).await;
    let id = hold(&wallet, "carol", "chapter-2", 30).await;

    let report = wallet
        .sweeper()
        .run_once(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.holds_expired, 1);

    let expired = wallet.authorization(&ctx("carol", "get"), id).await.unwrap();
    assert_eq!(expired.status.as_str(), "expired");

    let err = wallet
        .capture(&ctx("carol", "cap-1"), id, CaptureAuthorization::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
    assert_eq!(ledger_rows(&wallet, "carol").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_holds_create_one() {
    let wallet = wallet();
    seed(&wallet, "dave", 1_000).await;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..10 {
        let wallet = wallet.clone();
        tasks.spawn(async move {
            wallet
                .authorize(&ctx("dave", &format!("hold-{}", i)), hold_request("chapter-9", 50))
                .await
        });
    }

    let mut created = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert_eq!(e.code(), "duplicate_resource"),
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_holds_cannot_oversubscribe_balance() {
    let wallet = wallet();
    seed(&wallet, "erin", 100).await;
    hold(&wallet, "erin", "chapter-1", 70).await;

    let err = wallet
        .authorize(&ctx("erin", "hold-2"), hold_request("chapter-2", 40))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "insufficient_tokens");
}

#[tokio::test]
async fn test_purchase_paid_by_webhook() {
    let wallet = wallet();
    let (purchase_id, order_id) = purchase(&wallet, "frank", 250).await;

    let buyer = ctx("frank", "read");
    let created = wallet.purchase(&buyer, purchase_id).await.unwrap();
    assert_eq!(created.inr_amount, 75_000);
    assert_eq!(created.status, PurchaseStatus::Created);

    let (body, headers) = captured_webhook(&wallet, &order_id, 75_000, "evt_1");
    let result = wallet.handle_webhook(Provider::Mock, &body, &headers).await.unwrap();
    assert!(result.success);
    assert_eq!(result.status, WebhookEventStatus::Processed);

    let paid = wallet.purchase(&buyer, purchase_id).await.unwrap();
    assert_eq!(paid.status, PurchaseStatus::Paid);
    assert_eq!(
        paid.receipt_no.as_deref(),
        Some(format!("BG-{}-000001", Utc::now().year()).as_str())
    );
    assert_eq!(wallet.balances(&UserId::new("frank")).await.unwrap().balances.regular, 250);

    let receipts = wallet.receipts(&UserId::new("frank")).await.unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].inr_display.to_string(), "750.00");

    // Redelivery
    let replay = wallet.handle_webhook(Provider::Mock, &body, &headers).await.unwrap();
    assert!(replay.already_processed);
    assert_eq!(total(&wallet, "frank").await, 250);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_webhooks_issue_unique_increasing_receipts() {
    let wallet = wallet();
    let n = 12;

    let mut deliveries = Vec::new();
    for i in 0..n {
        let user = format!("buyer-{}", i);
        let (_, order_id) = purchase(&wallet, &user, 100).await;
        deliveries.push(captured_webhook(&wallet, &order_id, 30_000, &format!("evt_{}", i)));
    }

    let mut tasks = tokio::task::JoinSet::new();
    for (body, headers) in deliveries {
        let wallet = wallet.clone();
        tasks.spawn(async move { wallet.handle_webhook(Provider::Mock, &body, &headers).await });
    }

    let mut numbers = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap().unwrap();
        let receipt_no = result.result.unwrap().receipt_no.unwrap();
        numbers.push(receipt_no);
    }

    let unique: HashSet<&String> = numbers.iter().collect();
    assert_eq!(unique.len(), n);

    let mut sequences: Vec<i64> = numbers
        .iter()
        .map(|no| no.rsplit('-').next().unwrap().parse().unwrap())
        .collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=n as i64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_webhook_then_capture_flow() {
    let wallet = wallet();
    let (_, order_id) = purchase(&wallet, "gina", 250).await;
    let (body, headers) = captured_webhook(&wallet, &order_id, 75_000, "evt_g");
    wallet.handle_webhook(Provider::Mock, &body, &headers).await.unwrap();

    let id = hold(&wallet, "gina", "chapter-1", 10).await;
    wallet
        .capture(&ctx("gina", "cap"), id, CaptureAuthorization::default())
        .await
        .unwrap();
    assert_eq!(total(&wallet, "gina").await, 240);
    assert!(wallet.verify(&UserId::new("gina")).await.unwrap().consistent);
}

#[tokio::test]
async fn test_purchase_invisible_to_other_users() {
    let wallet = wallet();
    let (purchase_id, _) = purchase(&wallet, "hank", 100).await;
    let err = wallet
        .purchase(&ctx("intruder", "read"), purchase_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_expired_purchase_still_credited_by_late_capture() {
    let wallet = wallet();
    let (purchase_id, order_id) = purchase(&wallet, "ivan", 250).await;

    let report = wallet
        .sweeper()
        .run_once(Utc::now() + Duration::hours(49))
        .await
        .unwrap();
    assert_eq!(report.purchases_expired, 1);
    let buyer = ctx("ivan", "read");
    assert_eq!(
        wallet.purchase(&buyer, purchase_id).await.unwrap().status,
        PurchaseStatus::Expired
    );

    let (body, headers) = captured_webhook(&wallet, &order_id, 75_000, "evt_late");
    let result = wallet.handle_webhook(Provider::Mock, &body, &headers).await.unwrap();
    assert_eq!(result.status, WebhookEventStatus::Processed);
    assert_eq!(result.result.unwrap().tokens_credited, 250);

    let paid = wallet.purchase(&buyer, purchase_id).await.unwrap();
    assert_eq!(paid.status, PurchaseStatus::Paid);
    assert!(paid.receipt_no.is_some());
    assert_eq!(total(&wallet, "ivan").await, 250);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redeliveries_credit_once() {
    let wallet = wallet();
    let (_, order_id) = purchase(&wallet, "judy", 250).await;
    let (body, headers) = captured_webhook(&wallet, &order_id, 75_000, "evt_burst");

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let wallet = wallet.clone();
        let body = body.clone();
        let headers = headers.clone();
        tasks.spawn(async move { wallet.handle_webhook(Provider::Mock, &body, &headers).await });
    }

    let mut fresh = 0;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap().unwrap();
        assert!(result.success);
        if !result.already_processed {
            fresh += 1;
            assert_eq!(result.result.unwrap().new_balance, Some(250));
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(total(&wallet, "judy").await, 250);
    assert_eq!(ledger_rows(&wallet, "judy").await, 1);
}

#[tokio::test]
async fn test_stripe_payment_intent_credits_purchase() {
    const STRIPE_SECRET: &str = "whsec_stripe_test";
    let config = WalletConfig::default();
    let verifiers = WebhookVerifiers::from_config(&config.providers).with(
        Provider::Stripe,
        WebhookVerifier::Stripe {
            secret: STRIPE_SECRET.into(),
            tolerance_secs: 300,
        },
    );
    let wallet = Wallet::new(
        Arc::new(MemoryStore::new()),
        GatewayRegistry::from_config(&config.providers).unwrap(),
        verifiers,
        config,
    )
    .unwrap();

    let purchase = wallet
        .store()
        .insert_purchase(
            NewPurchase {
                id: Uuid::now_v7(),
                user_id: UserId::new("kate"),
                tokens: 250,
                inr_amount: 75_000,
                provider: Provider::Stripe,
                provider_order_id: "pi_3Test".into(),
                idempotency_key: Some("buy-stripe".into()),
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let body = serde_json::to_vec(&serde_json::json!({
        "id": "evt_stripe_1",
        "type": "payment_intent.succeeded",
        "data": {"object": {
            "id": "pi_3Test",
            "amount": 75_000,
            "latest_charge": "ch_1"
        }}
    }))
    .unwrap();
    let verifier = wallet.webhooks().verifier(Provider::Stripe).unwrap();
    assert_eq!(verifier.signature_header(), "Stripe-Signature");
    let headers = WebhookHeaders {
        signature: Some(verifier.sign(&body, Utc::now()).unwrap()),
        event_id: None,
    };

    let result = wallet.handle_webhook(Provider::Stripe, &body, &headers).await.unwrap();
    assert!(result.success);
    assert!(!result.already_processed);
    assert_eq!(result.event_id, "evt_stripe_1");

    let paid = wallet.purchase_admin(purchase.id).await.unwrap();
    assert_eq!(paid.status, PurchaseStatus::Paid);
    assert_eq!(paid.provider_payment_id.as_deref(), Some("ch_1"));
    assert_eq!(total(&wallet, "kate").await, 250);

    let replay = wallet.handle_webhook(Provider::Stripe, &body, &headers).await.unwrap();
    assert!(replay.already_processed);
    assert_eq!(total(&wallet, "kate").await, 250);

    // A forged signature is rejected before any lookup
    let forged = WebhookHeaders {
        signature: Some(format!("t={},v1={}", Utc::now().timestamp(), "00".repeat(32))),
        event_id: None,
    };
    let err = wallet
        .handle_webhook(Provider::Stripe, &body, &forged)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "signature_invalid");
}
