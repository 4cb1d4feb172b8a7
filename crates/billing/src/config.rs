//! Engine configuration

use std::future::Future;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Runtime knobs for the reconciliation engine and webhook ingress
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on every gateway and store call
    pub call_timeout: Duration,
    /// Page size when listing a customer's subscriptions
    pub list_limit: u64,
    /// Age after which a webhook claim stuck in `processing` may be re-claimed
    pub stale_claim_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            list_limit: 100,
            stale_claim_after: Duration::from_secs(30 * 60),
        }
    }
}

fn env_u64(name: &str) -> BillingResult<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("{} must be an integer, got {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Read overrides from the environment, keeping defaults for unset values
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let call_timeout = env_u64("BILLING_CALL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.call_timeout);
        if call_timeout.is_zero() {
            return Err(BillingError::Config(
                "BILLING_CALL_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            call_timeout,
            list_limit: env_u64("BILLING_LIST_LIMIT")?
                .map(|v| v.clamp(1, 100))
                .unwrap_or(defaults.list_limit),
            stale_claim_after: env_u64("WEBHOOK_STALE_CLAIM_MINUTES")?
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(defaults.stale_claim_after),
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Run a gateway or store call under `call_timeout`.
    /// Elapsed calls surface as `GatewayUnavailable`.
    pub(crate) async fn bounded<T, F>(&self, operation: &'static str, call: F) -> BillingResult<T>
    where
        F: Future<Output = BillingResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Billing call timed out"
                );
                Err(BillingError::GatewayUnavailable(format!(
                    "{} timed out after {}ms",
                    operation,
                    self.call_timeout.as_millis()
                )))
            }
        }
    }
}
