//! Caller-facing error taxonomy.

use serde::Serialize;

use crate::providers::ProviderError;

/// One failed attempt in a fallback chain, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub kind: &'static str,
    pub message: String,
}

impl ProviderAttempt {
    pub fn from_error(provider: &str, err: &ProviderError) -> Self {
        Self {
            provider: provider.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors surfaced by the gateway's public entry points.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Budget circuit is open; no driver was contacted.
    #[error("Monthly budget exceeded: ${spend_usd:.4} of ${limit_usd:.2} spent")]
    BudgetExceeded { spend_usd: f64, limit_usd: f64 },

    /// Registry is empty or every provider is unconfigured.
    #[error("No providers configured")]
    NoProvidersConfigured,

    /// Every chain entry failed transiently; attempts are in chain order.
    #[error("All providers failed after {} attempt(s)", .attempts.len())]
    AllProvidersFailed { attempts: Vec<ProviderAttempt> },

    /// Named provider is absent from the registry or unconfigured.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A non-transient driver failure surfaced directly.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Caller cancelled or the deadline expired.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Schema violation caught before budget admission.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Stable lowercase code for logs and API mapping by callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::NoProvidersConfigured => "no_providers_configured",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Provider(_) => "provider_error",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_failed_display_counts_attempts() {
        let err = GatewayError::AllProvidersFailed {
            attempts: vec![
                ProviderAttempt {
                    provider: "azure".into(),
                    kind: "unavailable",
                    message: "503".into(),
                },
                ProviderAttempt {
                    provider: "aws".into(),
                    kind: "rate_limited",
                    message: "429".into(),
                },
            ],
        };
        assert_eq!(err.to_string(), "All providers failed after 2 attempt(s)");
        assert_eq!(err.code(), "all_providers_failed");
    }

    #[test]
    fn test_provider_error_passthrough() {
        let inner = ProviderError::Auth {
            provider: "azure".into(),
            message: "key rejected".into(),
        };
        let err = GatewayError::from(inner);
        assert_eq!(err.code(), "provider_error");
        assert!(err.to_string().contains("key rejected"));
    }

    #[test]
    fn test_attempt_from_error() {
        let inner = ProviderError::Unavailable {
            provider: "ollama".into(),
            message: "connection refused".into(),
        };
        let attempt = ProviderAttempt::from_error("ollama", &inner);
        assert_eq!(attempt.provider, "ollama");
        assert_eq!(attempt.kind, "unavailable");
    }
}
