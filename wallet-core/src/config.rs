//! Configuration for the wallet core

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Token pricing and grant policy
    pub tokens: TokenPolicy,

    /// Hold policy
    pub authorization: AuthorizationConfig,

    /// Idempotency guard
    pub idempotency: IdempotencyConfig,

    /// Receipt numbering
    pub receipts: ReceiptConfig,

    /// Background sweepers
    pub sweeper: SweeperConfig,

    /// Payment providers
    pub providers: ProvidersConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            tokens: TokenPolicy::default(),
            authorization: AuthorizationConfig::default(),
            idempotency: IdempotencyConfig::default(),
            receipts: ReceiptConfig::default(),
            sweeper: SweeperConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

/// Token pricing and grant policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPolicy {
    /// Price of one token in rupees (e.g. "3.00")
    pub price_per_token_inr: Decimal,

    /// Smallest purchase
    pub min_purchase_tokens: i64,

    /// Largest purchase
    pub max_purchase_tokens: i64,

    /// Upper bound for any single posting
    pub max_posting_amount: i64,

    /// Tokens granted once at registration
    pub registration_bonus: i64,

    /// Promo grants decay after this many days
    pub promo_ttl_days: i64,

    /// Warn this many days before a promo grant decays
    pub promo_warning_days: i64,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            price_per_token_inr: Decimal::new(300, 2), // ₹3.00
            min_purchase_tokens: 50,
            max_purchase_tokens: 100_000,
            max_posting_amount: 10_000_000,
            registration_bonus: 100,
            promo_ttl_days: 30,
            promo_warning_days: 3,
        }
    }
}

impl TokenPolicy {
    /// Price of one token in INR minor units
    pub fn price_per_token_minor(&self) -> crate::Result<i64> {
        (self.price_per_token_inr * Decimal::ONE_HUNDRED)
            .round_dp(0)
            .to_i64()
            .filter(|p| *p > 0)
            .ok_or_else(|| crate::Error::Config("price_per_token_inr must be positive".into()))
    }
}

/// Hold policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Seconds before an uncaptured hold expires
    pub hold_ttl_secs: i64,

    /// Largest `units` value per hold
    pub max_units: i64,

    /// Largest `cost_per_unit` value per hold
    pub max_cost_per_unit: i64,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            hold_ttl_secs: 15 * 60,
            max_units: 100,
            max_cost_per_unit: 10_000,
        }
    }
}

/// Idempotency guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Records are kept this long
    pub ttl_hours: i64,

    /// How long a duplicate waits for an in-flight original
    pub wait_for_in_progress_ms: u64,

    /// Poll step while waiting
    pub poll_interval_ms: u64,

    /// `Retry-After` suggested when the wait runs out
    pub retry_after_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            wait_for_in_progress_ms: 2_000,
            poll_interval_ms: 100,
            retry_after_secs: 2,
        }
    }
}

/// Receipt numbering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptConfig {
    /// `PREFIX` in `PREFIX-YYYY-NNNNNN`
    pub prefix: String,

    /// Attempts when a receipt number collides
    pub max_allocation_attempts: u32,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            prefix: "BG".to_string(),
            max_allocation_attempts: 5,
        }
    }
}

/// Background sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the loop at all
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Rows handled per sweep and kind
    pub batch_size: i64,

    /// Purchases stuck in created/pending expire after this many hours
    pub purchase_ttl_hours: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 500,
            purchase_ttl_hours: 48,
        }
    }
}

/// Payment provider credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Razorpay
    pub razorpay: Option<RazorpayConfig>,

    /// Stripe
    pub stripe: Option<StripeConfig>,

    /// Enable the in-process mock gateway (local runs only)
    pub mock_enabled: bool,

    /// Secret for mock webhooks (Razorpay signature scheme)
    pub mock_webhook_secret: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            razorpay: None,
            stripe: None,
            mock_enabled: false,
            mock_webhook_secret: "mock_webhook_secret".to_string(),
        }
    }
}

/// Razorpay credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RazorpayConfig {
    /// Public key id, also handed to the checkout widget
    pub key_id: String,

    /// API secret
    pub key_secret: String,

    /// Webhook shared secret
    pub webhook_secret: String,

    /// API base URL
    #[serde(default = "default_razorpay_base")]
    pub api_base: String,

    /// Request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Stripe credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    /// Secret API key
    pub secret_key: String,

    /// Publishable key handed to the client
    pub publishable_key: String,

    /// Webhook signing secret
    pub webhook_secret: String,

    /// API base URL
    #[serde(default = "default_stripe_base")]
    pub api_base: String,

    /// Accepted clock skew for signed timestamps
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: i64,

    /// Request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_razorpay_base() -> String {
    "https://api.razorpay.com".to_string()
}

fn default_stripe_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_tolerance_secs() -> i64 {
    300
}

fn default_timeout_secs() -> u64 {
    10
}

impl WalletConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;
        let config: WalletConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> crate::Result<()> {
        let tokens = &self.tokens;
        tokens.price_per_token_minor()?;

        if tokens.min_purchase_tokens < 1 || tokens.min_purchase_tokens > tokens.max_purchase_tokens {
            return Err(crate::Error::Config(
                "purchase bounds must satisfy 1 <= min <= max".into(),
            ));
        }

        if tokens.registration_bonus < 0 || tokens.promo_ttl_days < 1 {
            return Err(crate::Error::Config(
                "registration_bonus must be >= 0 and promo_ttl_days >= 1".into(),
            ));
        }

        if self.authorization.hold_ttl_secs < 1 || self.authorization.max_units < 1 {
            return Err(crate::Error::Config(
                "hold_ttl_secs and max_units must be positive".into(),
            ));
        }

        if self.receipts.prefix.is_empty()
            || !self
                .receipts
                .prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(crate::Error::Config(
                "receipt prefix must be non-empty ASCII alphanumerics".into(),
            ));
        }

        if self.receipts.max_allocation_attempts == 0 {
            return Err(crate::Error::Config(
                "max_allocation_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = WalletConfig::default();
        assert_eq!(config.receipts.prefix, "BG");
        assert_eq!(config.tokens.price_per_token_minor().unwrap(), 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [tokens]
            price_per_token_inr = "2.50"
            min_purchase_tokens = 10

            [receipts]
            prefix = "INV"
            "#
        )
        .unwrap();

        let config = WalletConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tokens.price_per_token_minor().unwrap(), 250);
        assert_eq!(config.tokens.min_purchase_tokens, 10);
        assert_eq!(config.tokens.max_purchase_tokens, 100_000);
        assert_eq!(config.receipts.prefix, "INV");
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let mut config = WalletConfig::default();
        config.tokens.min_purchase_tokens = 500;
        config.tokens.max_purchase_tokens = 100;
        assert!(config.validate().is_err());

        let mut config = WalletConfig::default();
        config.receipts.prefix = "B-G".into();
        assert!(config.validate().is_err());
    }
}
