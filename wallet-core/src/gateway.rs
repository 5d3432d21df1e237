//! Payment provider gateways
//!
//! The purchase pipeline only needs one thing from a provider: an order (or
//! payment intent) it can hand to the client checkout. Network failures,
//! timeouts and non-success responses all surface as
//! [`Error::UpstreamUnavailable`].

use crate::{
    config::{ProvidersConfig, RazorpayConfig, StripeConfig},
    types::{Provider, UserId},
    Error, Result,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Currency of every order
pub const CURRENCY: &str = "INR";

/// Order to create at the provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    /// Purchase id, sent as the provider-side receipt reference
    pub purchase_id: Uuid,
    /// Buyer
    pub user_id: UserId,
    /// Tokens bought
    pub tokens: i64,
    /// Amount in minor units
    pub inr_amount: i64,
}

/// Order created at the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOrder {
    /// Provider order / payment intent id
    pub provider_order_id: String,
    /// What the client checkout needs
    pub client_payload: serde_json::Value,
}

/// Provider-side order creation
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider served by this gateway
    fn provider(&self) -> Provider;

    /// Create an order for the given amount
    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder>;
}

fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("HTTP client: {}", e)))
}

async fn check_status(provider: Provider, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(%provider, %status, "order creation rejected: {}", body);
    Err(Error::UpstreamUnavailable(format!(
        "{} responded with {}",
        provider, status
    )))
}

/// Razorpay Orders API
pub struct RazorpayGateway {
    config: RazorpayConfig,
    client: Client,
}

#[derive(Deserialize)]
struct RazorpayOrder {
    id: String,
}

impl RazorpayGateway {
    /// Create gateway
    pub fn new(config: RazorpayConfig) -> Result<Self> {
        let client = http_client(config.timeout_secs)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn provider(&self) -> Provider {
        Provider::Razorpay
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder> {
        let url = format!("{}/v1/orders", self.config.api_base.trim_end_matches('/'));
        let body = serde_json::json!({
            "amount": request.inr_amount,
            "currency": CURRENCY,
            "receipt": request.purchase_id.to_string(),
            "notes": {
                "user_id": request.user_id,
                "tokens": request.tokens,
            },
        });

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&body)
            .send()
            .await?;
        let order: RazorpayOrder = check_status(Provider::Razorpay, response).await?.json().await?;

        info!(purchase_id = %request.purchase_id, order_id = %order.id, "razorpay order created");

        Ok(ProviderOrder {
            client_payload: serde_json::json!({
                "key_id": self.config.key_id,
                "order_id": order.id,
                "amount": request.inr_amount,
                "currency": CURRENCY,
            }),
            provider_order_id: order.id,
        })
    }
}

/// Stripe PaymentIntents API
pub struct StripeGateway {
    config: StripeConfig,
    client: Client,
}

#[derive(Deserialize)]
struct StripeIntent {
    id: String,
    client_secret: Option<String>,
}

impl StripeGateway {
    /// Create gateway
    pub fn new(config: StripeConfig) -> Result<Self> {
        let client = http_client(config.timeout_secs)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder> {
        let url = format!(
            "{}/v1/payment_intents",
            self.config.api_base.trim_end_matches('/')
        );
        let form = [
            ("amount", request.inr_amount.to_string()),
            ("currency", CURRENCY.to_lowercase()),
            ("metadata[purchase_id]", request.purchase_id.to_string()),
            ("metadata[user_id]", request.user_id.to_string()),
            ("metadata[tokens]", request.tokens.to_string()),
        ];

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", request.purchase_id.to_string())
            .form(&form)
            .send()
            .await?;
        let intent: StripeIntent = check_status(Provider::Stripe, response).await?.json().await?;

        info!(purchase_id = %request.purchase_id, intent_id = %intent.id, "stripe payment intent created");

        Ok(ProviderOrder {
            client_payload: serde_json::json!({
                "publishable_key": self.config.publishable_key,
                "payment_intent_id": intent.id,
                "client_secret": intent.client_secret,
                "amount": request.inr_amount,
                "currency": CURRENCY,
            }),
            provider_order_id: intent.id,
        })
    }
}

/// In-process gateway for tests and local runs
#[derive(Debug, Default)]
pub struct MockGateway {
    fail: bool,
}

impl MockGateway {
    /// Gateway that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway that always reports the provider as unavailable
    pub fn failing() -> Self {
        Self { fail: true }
    }

    /// Order id the mock hands out for a purchase
    pub fn order_id_for(purchase_id: Uuid) -> String {
        format!("mock_order_{}", purchase_id.simple())
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn provider(&self) -> Provider {
        Provider::Mock
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder> {
        if self.fail {
            return Err(Error::UpstreamUnavailable("mock gateway down".into()));
        }
        let order_id = Self::order_id_for(request.purchase_id);
        Ok(ProviderOrder {
            client_payload: serde_json::json!({
                "order_id": order_id,
                "amount": request.inr_amount,
                "currency": CURRENCY,
            }),
            provider_order_id: order_id,
        })
    }
}

/// Gateways by provider
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    gateways: HashMap<Provider, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateways for every configured provider
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut registry = Self::new();
        if let Some(razorpay) = &config.razorpay {
            registry = registry.with(Arc::new(RazorpayGateway::new(razorpay.clone())?));
        }
        if let Some(stripe) = &config.stripe {
            registry = registry.with(Arc::new(StripeGateway::new(stripe.clone())?));
        }
        if config.mock_enabled {
            registry = registry.with(Arc::new(MockGateway::new()));
        }
        Ok(registry)
    }

    /// Add or replace a gateway
    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.provider(), gateway);
        self
    }

    /// Gateway for a provider
    pub fn get(&self, provider: Provider) -> Result<Arc<dyn PaymentGateway>> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::validation("provider", format!("{} is not enabled", provider)))
    }

    /// Enabled providers
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.gateways.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl std::fmt::Debug for dyn PaymentGateway {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "PaymentGateway({})", self.provider())
        }
    }

    fn order() -> OrderRequest {
        OrderRequest {
            purchase_id: Uuid::now_v7(),
            user_id: UserId::new("buyer"),
            tokens: 250,
            inr_amount: 75_000,
        }
    }

    #[tokio::test]
    async fn test_mock_gateway_order_id() {
        let request = order();
        let created = MockGateway::new().create_order(&request).await.unwrap();
        assert_eq!(created.provider_order_id, MockGateway::order_id_for(request.purchase_id));
        assert_eq!(created.client_payload["amount"], 75_000);
    }

    #[tokio::test]
    async fn test_failing_gateway_is_upstream_error() {
        let err = MockGateway::failing().create_order(&order()).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = GatewayRegistry::from_config(&ProvidersConfig {
            mock_enabled: true,
            ..ProvidersConfig::default()
        })
        .unwrap();
        assert!(registry.get(Provider::Mock).is_ok());
        assert_eq!(registry.get(Provider::Stripe).unwrap_err().code(), "validation_error");
        assert_eq!(registry.providers(), vec![Provider::Mock]);
    }

    #[tokio::test]
    async fn test_unreachable_provider_maps_to_upstream() {
        let gateway = RazorpayGateway::new(RazorpayConfig {
            key_id: "rzp_test".into(),
            key_secret: "secret".into(),
            webhook_secret: "whsec".into(),
            api_base: "http://127.0.0.1:9".into(),
            timeout_secs: 1,
        })
        .unwrap();
        let err = gateway.create_order(&order()).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
    }
}
