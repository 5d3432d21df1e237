//! Payment provider webhooks
//!
//! Processing order for every delivery:
//!
//! 1. verify the signature over the raw body (constant time)
//! 2. record the event under `(provider, event_id)`; a delivery whose event
//!    was already processed or skipped stops here
//! 3. resolve the purchase by provider order id
//! 4. apply the event: settle, mark pending or mark failed
//!
//! An event left in `received` or `error` is applied again on redelivery.
//! The purchase `paid` state keeps that from crediting twice.

use crate::{
    config::ProvidersConfig,
    metrics,
    purchase::PurchaseService,
    store::{SettleOutcome, WalletStore, WebhookRecord},
    types::{Provider, Purchase, WebhookEvent, WebhookEventStatus},
    Error, Result,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signature header used by Razorpay (and the mock provider)
pub const RAZORPAY_SIGNATURE_HEADER: &str = "X-Razorpay-Signature";
/// Delivery id header used by Razorpay
pub const RAZORPAY_EVENT_ID_HEADER: &str = "X-Razorpay-Event-Id";
/// Signature header used by Stripe
pub const STRIPE_SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Signature check for one provider, chosen once when the pipeline is built
#[derive(Debug, Clone)]
pub enum WebhookVerifier {
    /// Hex HMAC-SHA256 of the raw body
    Razorpay {
        /// Shared secret
        secret: String,
    },
    /// `t=<unix>,v1=<hex>` over `"<t>.<body>"`
    Stripe {
        /// Signing secret
        secret: String,
        /// Accepted distance between `t` and now
        tolerance_secs: i64,
    },
}

impl WebhookVerifier {
    /// Header carrying the signature
    pub fn signature_header(&self) -> &'static str {
        match self {
            WebhookVerifier::Razorpay { .. } => RAZORPAY_SIGNATURE_HEADER,
            WebhookVerifier::Stripe { .. } => STRIPE_SIGNATURE_HEADER,
        }
    }

    /// Check `signature` against `body`
    pub fn verify(&self, body: &[u8], signature: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Error::SignatureInvalid)?;

        match self {
            WebhookVerifier::Razorpay { secret } => verify_hex(secret, body, signature),
            WebhookVerifier::Stripe {
                secret,
                tolerance_secs,
            } => {
                let (timestamp, candidates) = parse_stripe_header(signature)?;
                if (now.timestamp() - timestamp).abs() > *tolerance_secs {
                    return Err(Error::SignatureInvalid);
                }
                let mut signed = format!("{}.", timestamp).into_bytes();
                signed.extend_from_slice(body);
                if candidates
                    .iter()
                    .any(|candidate| verify_hex(secret, &signed, candidate).is_ok())
                {
                    Ok(())
                } else {
                    Err(Error::SignatureInvalid)
                }
            }
        }
    }

    /// Header value a provider would send for `body` at `now`
    pub fn sign(&self, body: &[u8], now: DateTime<Utc>) -> Result<String> {
        match self {
            WebhookVerifier::Razorpay { secret } => hmac_hex(secret, body),
            WebhookVerifier::Stripe { secret, .. } => {
                let timestamp = now.timestamp();
                let mut signed = format!("{}.", timestamp).into_bytes();
                signed.extend_from_slice(body);
                Ok(format!("t={},v1={}", timestamp, hmac_hex(secret, &signed)?))
            }
        }
    }
}

fn mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::Config("webhook secret is not a valid HMAC key".into()))
}

fn hmac_hex(secret: &str, message: &[u8]) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_hex(secret: &str, message: &[u8], signature: &str) -> Result<()> {
    let expected = hex::decode(signature).map_err(|_| Error::SignatureInvalid)?;
    let mut mac = mac(secret)?;
    mac.update(message);
    mac.verify_slice(&expected).map_err(|_| Error::SignatureInvalid)
}

fn parse_stripe_header(header: &str) -> Result<(i64, Vec<&str>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    match timestamp {
        Some(t) if !signatures.is_empty() => Ok((t, signatures)),
        _ => Err(Error::SignatureInvalid),
    }
}

/// Verifiers of the enabled providers
#[derive(Debug, Clone, Default)]
pub struct WebhookVerifiers {
    verifiers: HashMap<Provider, WebhookVerifier>,
}

impl WebhookVerifiers {
    /// One verifier per configured provider
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut verifiers = HashMap::new();
        if let Some(razorpay) = &config.razorpay {
            verifiers.insert(
                Provider::Razorpay,
                WebhookVerifier::Razorpay {
                    secret: razorpay.webhook_secret.clone(),
                },
            );
        }
        if let Some(stripe) = &config.stripe {
            verifiers.insert(
                Provider::Stripe,
                WebhookVerifier::Stripe {
                    secret: stripe.webhook_secret.clone(),
                    tolerance_secs: stripe.tolerance_secs,
                },
            );
        }
        if config.mock_enabled {
            verifiers.insert(
                Provider::Mock,
                WebhookVerifier::Razorpay {
                    secret: config.mock_webhook_secret.clone(),
                },
            );
        }
        Self { verifiers }
    }

    /// Add or replace a verifier
    pub fn with(mut self, provider: Provider, verifier: WebhookVerifier) -> Self {
        self.verifiers.insert(provider, verifier);
        self
    }

    /// Verifier of a provider
    pub fn get(&self, provider: Provider) -> Result<&WebhookVerifier> {
        self.verifiers
            .get(&provider)
            .ok_or_else(|| Error::NotFound(format!("webhook provider {}", provider)))
    }
}

/// Transport headers of a delivery
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    /// Value of the provider's signature header
    pub signature: Option<String>,
    /// Delivery id header, when the provider sends one
    pub event_id: Option<String>,
}

/// What an event asks the wallet to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Money captured; credit the purchase
    Captured,
    /// Payment authorized but not yet captured
    Pending,
    /// Payment failed
    Failed,
    /// Not relevant to the wallet
    Ignored,
}

/// Provider payload reduced to what the wallet needs
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    /// Delivery id (dedupe key)
    pub event_id: String,
    /// Provider event type
    pub event_type: String,
    /// Classified kind
    pub kind: EventKind,
    /// Provider order / payment intent id
    pub order_id: Option<String>,
    /// Provider payment / charge id
    pub payment_id: Option<String>,
    /// Amount in minor units
    pub amount: Option<i64>,
    /// Provider failure description
    pub failure_reason: Option<String>,
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl ProviderEvent {
    /// Parse a provider payload
    pub fn parse(provider: Provider, payload: &Value, headers: &WebhookHeaders, raw: &[u8]) -> Result<Self> {
        match provider {
            Provider::Razorpay | Provider::Mock => Self::parse_razorpay(payload, headers, raw),
            Provider::Stripe => Self::parse_stripe(payload),
        }
    }

    fn parse_razorpay(payload: &Value, headers: &WebhookHeaders, raw: &[u8]) -> Result<Self> {
        let event_type = str_at(payload, "/event")
            .ok_or_else(|| Error::validation("event", "missing event type"))?;
        let kind = match event_type.as_str() {
            "payment.captured" | "order.paid" => EventKind::Captured,
            "payment.authorized" => EventKind::Pending,
            "payment.failed" => EventKind::Failed,
            _ => EventKind::Ignored,
        };

        let event_id = headers
            .event_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| hex::encode(Sha256::digest(raw)));

        let payment = payload.pointer("/payload/payment/entity");
        let order = payload.pointer("/payload/order/entity");

        Ok(Self {
            event_id,
            event_type,
            kind,
            order_id: payment
                .and_then(|p| str_at(p, "/order_id"))
                .or_else(|| order.and_then(|o| str_at(o, "/id"))),
            payment_id: payment.and_then(|p| str_at(p, "/id")),
            amount: payment
                .and_then(|p| p.get("amount"))
                .or_else(|| order.and_then(|o| o.get("amount")))
                .and_then(Value::as_i64),
            failure_reason: payment.and_then(|p| str_at(p, "/error_description")),
        })
    }

    fn parse_stripe(payload: &Value) -> Result<Self> {
        let event_id =
            str_at(payload, "/id").ok_or_else(|| Error::validation("id", "missing event id"))?;
        let event_type =
            str_at(payload, "/type").ok_or_else(|| Error::validation("type", "missing event type"))?;
        let kind = match event_type.as_str() {
            "payment_intent.succeeded" => EventKind::Captured,
            "payment_intent.processing" => EventKind::Pending,
            "payment_intent.payment_failed" => EventKind::Failed,
            _ => EventKind::Ignored,
        };

        let object = payload.pointer("/data/object");
        Ok(Self {
            event_id,
            event_type,
            kind,
            order_id: object.and_then(|o| str_at(o, "/id")),
            payment_id: object.and_then(|o| str_at(o, "/latest_charge")),
            amount: object.and_then(|o| o.get("amount")).and_then(Value::as_i64),
            failure_reason: object.and_then(|o| str_at(o, "/last_payment_error/message")),
        })
    }
}

/// Credit applied by a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledPurchase {
    /// Purchase
    pub purchase_id: Uuid,
    /// Receipt number
    pub receipt_no: Option<String>,
    /// Tokens credited
    pub tokens_credited: i64,
    /// Total balance after the credit, when this delivery credited
    pub new_balance: Option<i64>,
}

/// Outcome of a delivery, returned to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResult {
    /// False when the event was recorded as an error
    pub success: bool,
    /// The event id was seen before, or its purchase was already paid
    pub already_processed: bool,
    /// Delivery id
    pub event_id: String,
    /// Final event state
    pub status: WebhookEventStatus,
    /// Credit details for captured payments
    pub result: Option<SettledPurchase>,
    /// Human-readable note
    pub message: Option<String>,
}

struct Applied {
    status: WebhookEventStatus,
    result: Option<SettledPurchase>,
    message: Option<String>,
    // The purchase was already paid by an earlier or concurrent delivery
    settled_before: bool,
}

impl Applied {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: WebhookEventStatus::Skipped,
            result: None,
            message: Some(message.into()),
            settled_before: false,
        }
    }

    fn processed(message: impl Into<String>) -> Self {
        Self {
            status: WebhookEventStatus::Processed,
            result: None,
            message: Some(message.into()),
            settled_before: false,
        }
    }
}

fn settled(purchase: &Purchase, new_balance: Option<i64>) -> SettledPurchase {
    SettledPurchase {
        purchase_id: purchase.id,
        receipt_no: purchase.receipt_no.clone(),
        tokens_credited: purchase.tokens,
        new_balance,
    }
}

/// Inbound webhook processing
pub struct WebhookPipeline {
    store: Arc<dyn WalletStore>,
    purchases: Arc<PurchaseService>,
    verifiers: WebhookVerifiers,
}

impl WebhookPipeline {
    /// Create pipeline
    pub fn new(
        store: Arc<dyn WalletStore>,
        purchases: Arc<PurchaseService>,
        verifiers: WebhookVerifiers,
    ) -> Self {
        Self {
            store,
            purchases,
            verifiers,
        }
    }

    /// Verifier of a provider (the HTTP layer needs its header name)
    pub fn verifier(&self, provider: Provider) -> Result<&WebhookVerifier> {
        self.verifiers.get(provider)
    }

    /// Handle one delivery.
    ///
    /// `Err` means the provider should redeliver; an event recorded as
    /// `error` for a reason redelivery cannot fix comes back as `Ok` with
    /// `success: false`.
    pub async fn handle(
        &self,
        provider: Provider,
        raw: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<WebhookResult> {
        let now = Utc::now();
        let verifier = self.verifiers.get(provider)?;
        if let Err(e) = verifier.verify(raw, headers.signature.as_deref(), now) {
            metrics::WEBHOOKS_TOTAL
                .with_label_values(&[provider.as_str(), "signature_invalid"])
                .inc();
            warn!(%provider, "webhook signature rejected");
            return Err(e);
        }

        let payload: Value = serde_json::from_slice(raw)
            .map_err(|e| Error::validation("body", format!("invalid JSON: {}", e)))?;
        let event = ProviderEvent::parse(provider, &payload, headers, raw)?;

        let row = match self
            .store
            .record_webhook_event(provider, &event.event_id, &event.event_type, payload, now)
            .await?
        {
            WebhookRecord::Duplicate(row) if row.status.is_final() => {
                metrics::WEBHOOKS_TOTAL
                    .with_label_values(&[provider.as_str(), "duplicate"])
                    .inc();
                info!(%provider, event_id = %row.event_id, status = %row.status, "webhook already processed");
                return Ok(WebhookResult {
                    success: true,
                    already_processed: true,
                    event_id: row.event_id,
                    status: row.status,
                    result: None,
                    message: Some("event already processed".into()),
                });
            }
            WebhookRecord::Duplicate(row) => {
                info!(%provider, event_id = %row.event_id, status = %row.status, "reprocessing unfinished webhook");
                row
            }
            WebhookRecord::Inserted(row) => row,
        };

        match self.apply(provider, &event).await {
            Ok(applied) => {
                let success = applied.status != WebhookEventStatus::Error;
                self.store
                    .finish_webhook_event(
                        row.id,
                        applied.status,
                        if success { None } else { applied.message.clone() },
                        Utc::now(),
                    )
                    .await?;
                metrics::WEBHOOKS_TOTAL
                    .with_label_values(&[provider.as_str(), applied.status.as_str()])
                    .inc();
                info!(
                    %provider,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    status = %applied.status,
                    "webhook handled"
                );
                Ok(WebhookResult {
                    success,
                    already_processed: applied.settled_before,
                    event_id: event.event_id,
                    status: applied.status,
                    result: applied.result,
                    message: applied.message,
                })
            }
            Err(e) => {
                self.record_failure(&row, &e).await;
                metrics::WEBHOOKS_TOTAL
                    .with_label_values(&[provider.as_str(), "error"])
                    .inc();
                Err(e)
            }
        }
    }

    async fn record_failure(&self, row: &WebhookEvent, e: &Error) {
        error!(provider = %row.provider, event_id = %row.event_id, "webhook processing failed: {}", e);
        if let Err(finish_err) = self
            .store
            .finish_webhook_event(row.id, WebhookEventStatus::Error, Some(e.to_string()), Utc::now())
            .await
        {
            error!(event_id = %row.event_id, "failed to record webhook error: {}", finish_err);
        }
    }

    async fn apply(&self, provider: Provider, event: &ProviderEvent) -> Result<Applied> {
        if event.kind == EventKind::Ignored {
            return Ok(Applied::skipped(format!("event type {} ignored", event.event_type)));
        }
        let Some(order_id) = event.order_id.as_deref() else {
            return Ok(Applied::skipped("event carries no order reference"));
        };
        let Some(purchase) = self.purchases.find_by_order(provider, order_id).await? else {
            warn!(%provider, order_id, "webhook for unknown order");
            return Ok(Applied::skipped(format!("unknown order {}", order_id)));
        };

        match event.kind {
            EventKind::Captured => self.apply_captured(event, purchase).await,
            EventKind::Pending => Ok(match self.purchases.mark_pending(purchase.id).await? {
                Some(_) => Applied::processed("purchase pending"),
                None => Applied::skipped(format!("purchase already {}", purchase.status)),
            }),
            EventKind::Failed => Ok(
                match self
                    .purchases
                    .mark_failed(purchase.id, event.failure_reason.clone())
                    .await?
                {
                    Some(_) => Applied::processed("purchase failed"),
                    None => Applied::skipped(format!("purchase already {}", purchase.status)),
                },
            ),
            EventKind::Ignored => Ok(Applied::skipped("event ignored")),
        }
    }

    async fn apply_captured(&self, event: &ProviderEvent, purchase: Purchase) -> Result<Applied> {
        if let Some(amount) = event.amount {
            if amount != purchase.inr_amount {
                warn!(
                    purchase_id = %purchase.id,
                    expected = purchase.inr_amount,
                    received = amount,
                    "captured amount does not match purchase"
                );
                return Ok(Applied {
                    status: WebhookEventStatus::Error,
                    result: None,
                    message: Some(format!(
                        "amount mismatch: expected {}, received {}",
                        purchase.inr_amount, amount
                    )),
                    settled_before: false,
                });
            }
        }

        Ok(
            match self
                .purchases
                .settle(purchase.id, event.payment_id.clone())
                .await?
            {
                SettleOutcome::Credited { purchase, posted } => Applied {
                    status: WebhookEventStatus::Processed,
                    result: Some(settled(&purchase, Some(posted.balances.total()))),
                    message: None,
                    settled_before: false,
                },
                SettleOutcome::AlreadyPaid(purchase) => Applied {
                    status: WebhookEventStatus::Processed,
                    result: Some(settled(&purchase, None)),
                    message: Some("purchase already paid".into()),
                    settled_before: true,
                },
                SettleOutcome::NotCreditable(purchase) => {
                    Applied::skipped(format!("purchase is {}", purchase.status))
                }
            },
        )
    }
}
