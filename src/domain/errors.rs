//! Error taxonomy for the governance core, split the way the upstream
//! trading stack splits input errors from transient upstream errors:
//! fatal-at-the-point-of-use vs. retry-and-degrade.

use thiserror::Error;

/// Fatal, never-retried errors: bad config, unknown assets, invalid actions.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("plan is not active (status={status})")]
    PlanNotActive { status: String },

    #[error("proposal rejected: net advantage {net_advantage_bps} bps below minimum {minimum_bps} bps")]
    ProposalRejected {
        net_advantage_bps: rust_decimal::Decimal,
        minimum_bps: rust_decimal::Decimal,
    },

    #[error("governor state corrupted, starting clean: {0}")]
    CorruptState(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

/// Transient upstream errors: network/429/5xx vs. fatal 4xx/schema.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited by {source}")]
    RateLimitExceeded { source: String },

    #[error("upstream {source} returned server error: {status}")]
    ServerError { source: String, status: u16 },

    #[error("network timeout contacting {source}")]
    Timeout { source: String },

    #[error("upstream {source} rejected request: {status}")]
    ClientError { source: String, status: u16 },

    #[error("schema violation from {source}: {detail}")]
    SchemaViolation { source: String, detail: String },

    #[error("circuit breaker open for {source}")]
    UpstreamUnavailable { source: String },
}

impl ProviderError {
    /// True iff the caller should retry with backoff rather than surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimitExceeded { .. }
                | ProviderError::ServerError { .. }
                | ProviderError::Timeout { .. }
        )
    }
}

/// Oracle-specific failures (LLM regime/plan calls); a schema violation is
/// retried once by the caller, then treated as a plain failure.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle schema violation: {0}")]
    SchemaViolation(String),

    #[error("oracle call failed: {0}")]
    CallFailed(String),
}

/// Exchange/venue adapter failures.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    #[error("venue call failed: {0}")]
    CallFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_retryable_classification() {
        assert!(ProviderError::RateLimitExceeded { source: "funding".into() }.is_retryable());
        assert!(ProviderError::ServerError { source: "candles".into(), status: 503 }.is_retryable());
        assert!(ProviderError::Timeout { source: "oi".into() }.is_retryable());
        assert!(!ProviderError::ClientError { source: "mid".into(), status: 404 }.is_retryable());
        assert!(!ProviderError::SchemaViolation { source: "fg".into(), detail: "bad".into() }.is_retryable());
    }

    #[test]
    fn governance_error_formats_plan_not_active() {
        let err = GovernanceError::PlanNotActive { status: "invalidated".into() };
        assert_eq!(err.to_string(), "plan is not active (status=invalidated)");
    }
}
