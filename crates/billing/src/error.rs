//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Network failure, provider outage, rate limit or timeout.
    /// Never leaves partially applied local state behind.
    #[error("Billing gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Billing provider rejected request: {0}")]
    InvalidRequest(String),

    #[error("No billing profile for user: {0}")]
    ProfileNotFound(String),

    #[error("Invalid plan transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Transient failures the caller (or the provider's redelivery) should retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::Database(_))
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request_error) => {
                let status = request_error.http_status;
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Stripe returned HTTP {}", status));

                if status == 429 || (500..600).contains(&status) {
                    BillingError::GatewayUnavailable(message)
                } else if status == 404
                    || matches!(request_error.code, Some(stripe::ErrorCode::ResourceMissing))
                {
                    BillingError::NotFound(message)
                } else {
                    BillingError::InvalidRequest(message)
                }
            }
            stripe::StripeError::Timeout => {
                BillingError::GatewayUnavailable("Stripe request timed out".to_string())
            }
            stripe::StripeError::ClientError(msg) => BillingError::GatewayUnavailable(msg),
            other => BillingError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<sefer_shared::SeferError> for BillingError {
    fn from(err: sefer_shared::SeferError) -> Self {
        match err {
            sefer_shared::SeferError::NotFound(msg) => BillingError::NotFound(msg),
            sefer_shared::SeferError::Validation(msg) => BillingError::InvalidPayload(msg),
            sefer_shared::SeferError::Database(msg) => BillingError::Database(msg),
            sefer_shared::SeferError::Internal(msg) => BillingError::Internal(msg),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::GatewayUnavailable("down".into()).is_retryable());
        assert!(BillingError::Database("conn reset".into()).is_retryable());
        assert!(!BillingError::NotFound("sub_1".into()).is_retryable());
        assert!(!BillingError::InvalidTransition {
            from: "yearly-plus".into(),
            to: "monthly-basic".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_stripe_timeout_is_unavailable() {
        let err: BillingError = stripe::StripeError::Timeout.into();
        assert!(matches!(err, BillingError::GatewayUnavailable(_)));
    }
}
