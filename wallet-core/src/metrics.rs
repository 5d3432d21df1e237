//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `wallet_postings_total{direction,reason}` - ledger postings committed
//! - `wallet_tokens_total{direction,token_type}` - token units moved
//! - `wallet_authorizations_total{outcome}` - hold lifecycle transitions
//! - `wallet_idempotency_total{outcome}` - guard decisions
//! - `wallet_webhooks_total{provider,outcome}` - webhook deliveries
//! - `wallet_purchases_created_total{provider}` - purchase intents
//! - `wallet_receipts_issued_total` / `wallet_receipt_retries_total`
//! - `wallet_sweep_rows_total{kind}` - rows touched by sweepers
//! - `wallet_promo_warnings_total` - expiry warnings emitted

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref POSTINGS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_postings_total", "Ledger postings committed"),
        &["direction", "reason"]
    ).expect("metric can be created");

    pub static ref TOKENS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_tokens_total", "Token units moved through the ledger"),
        &["direction", "token_type"]
    ).expect("metric can be created");

    pub static ref AUTHORIZATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_authorizations_total", "Hold lifecycle transitions"),
        &["outcome"]
    ).expect("metric can be created");

    pub static ref IDEMPOTENCY_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_idempotency_total", "Idempotency guard decisions"),
        &["outcome"]
    ).expect("metric can be created");

    pub static ref WEBHOOKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_webhooks_total", "Payment webhook deliveries"),
        &["provider", "outcome"]
    ).expect("metric can be created");

    pub static ref PURCHASES_CREATED: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_purchases_created_total", "Purchase intents created"),
        &["provider"]
    ).expect("metric can be created");

    pub static ref RECEIPTS_ISSUED: IntCounter = IntCounter::new(
        "wallet_receipts_issued_total",
        "Receipts issued"
    ).expect("metric can be created");

    pub static ref RECEIPT_RETRIES: IntCounter = IntCounter::new(
        "wallet_receipt_retries_total",
        "Settlements retried after a receipt number collision"
    ).expect("metric can be created");

    pub static ref SWEEP_ROWS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_sweep_rows_total", "Rows touched by sweepers"),
        &["kind"]
    ).expect("metric can be created");

    pub static ref PROMO_WARNINGS: IntCounter = IntCounter::new(
        "wallet_promo_warnings_total",
        "Promo expiry warnings emitted"
    ).expect("metric can be created");
}

/// Register all wallet metrics with the given registry
pub fn register_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(POSTINGS_TOTAL.clone()))?;
    registry.register(Box::new(TOKENS_TOTAL.clone()))?;
    registry.register(Box::new(AUTHORIZATIONS_TOTAL.clone()))?;
    registry.register(Box::new(IDEMPOTENCY_TOTAL.clone()))?;
    registry.register(Box::new(WEBHOOKS_TOTAL.clone()))?;
    registry.register(Box::new(PURCHASES_CREATED.clone()))?;
    registry.register(Box::new(RECEIPTS_ISSUED.clone()))?;
    registry.register(Box::new(RECEIPT_RETRIES.clone()))?;
    registry.register(Box::new(SWEEP_ROWS_TOTAL.clone()))?;
    registry.register(Box::new(PROMO_WARNINGS.clone()))?;
    Ok(())
}

/// Render a registry in the Prometheus text format
pub fn render(registry: &Registry) -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_render() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();

        RECEIPTS_ISSUED.inc();
        POSTINGS_TOTAL.with_label_values(&["credit", "admin_seed"]).inc();

        let text = render(&registry).unwrap();
        assert!(text.contains("wallet_receipts_issued_total"));
        assert!(text.contains("wallet_postings_total"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        assert!(register_metrics(&registry).is_err());
    }
}
