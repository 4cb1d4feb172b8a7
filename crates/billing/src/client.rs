//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Price IDs for each plan in the catalog
    pub price_ids: PriceIds,
    /// Base URL for raw REST calls not covered by async-stripe
    pub api_base: String,
}

/// Stripe price IDs, one per (tier, interval) plan
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub monthly_basic: String,
    pub monthly_plus: String,
    pub yearly_basic: String,
    pub yearly_plus: String,
}

fn required_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} not set", name)))
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            price_ids: PriceIds {
                monthly_basic: required_env("STRIPE_PRICE_MONTHLY_BASIC")?,
                monthly_plus: required_env("STRIPE_PRICE_MONTHLY_PLUS")?,
                yearly_basic: required_env("STRIPE_PRICE_YEARLY_BASIC")?,
                yearly_plus: required_env("STRIPE_PRICE_YEARLY_PLUS")?,
            },
            api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self {
            client,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Plain HTTP client for endpoints async-stripe does not model
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
