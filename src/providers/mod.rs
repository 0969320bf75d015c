//! Provider drivers
//!
//! Defines the uniform [`AiProvider`] contract every backend adapter
//! implements, the closed [`ProviderError`] taxonomy the router acts on, and
//! the concrete drivers (Azure OpenAI, AWS Bedrock, GCP Vertex, Ollama,
//! vLLM).

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod ollama;
pub mod openai;
pub mod sse;
pub mod vllm;

use std::future::Future;
use std::pin::Pin;

use futures::Stream;

use crate::types::{CompletionResponse, ProviderRequest, StreamChunk};

pub use self::aws::AwsBedrockProvider;
pub use self::azure::AzureOpenAiProvider;
pub use self::gcp::GcpVertexProvider;
pub use self::ollama::OllamaProvider;
pub use self::vllm::VllmProvider;

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors a driver may surface, mapped from each backend's native failures.
///
/// The kind determines router behaviour: transient kinds trigger fallback to
/// the next chain entry, the rest stop the chain and surface directly.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("Rate limited by {provider}: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider} unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("Model {model} not found on {provider}")]
    ModelNotFound { provider: String, model: String },

    #[error("Content filtered by {provider}: {message}")]
    ContentFiltered { provider: String, message: String },

    #[error("Protocol error from {provider}: {message}")]
    Protocol { provider: String, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error from {provider}: {message}")]
    Internal { provider: String, message: String },

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: &'static str,
    },
}

impl ProviderError {
    /// Stable lowercase kind name, used in logs and failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable { .. } => "unavailable",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::ContentFiltered { .. } => "content_filtered",
            Self::Protocol { .. } => "protocol",
            Self::Cancelled(_) => "cancelled",
            Self::Internal { .. } => "internal",
            Self::Unsupported { .. } => "unsupported",
        }
    }

    /// Whether the router should fall over to the next provider.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. }
                | Self::RateLimited { .. }
                | Self::Internal { .. }
                | Self::Protocol { .. }
        )
    }

    /// Map a non-success HTTP status to the closed error set.
    pub fn from_status(provider: &str, model: &str, status: u16, body: String) -> Self {
        let provider = provider.to_string();
        match status {
            401 | 403 => Self::Auth {
                provider,
                message: body,
            },
            404 => Self::ModelNotFound {
                provider,
                model: model.to_string(),
            },
            429 => Self::RateLimited {
                provider,
                message: body,
            },
            500..=599 => Self::Unavailable {
                provider,
                message: format!("HTTP {status}: {body}"),
            },
            _ => Self::Internal {
                provider,
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    /// Map a transport-level failure (connect, timeout, TLS) to the closed
    /// error set. All of these mean the backend could not be reached.
    pub fn transport(provider: &str, err: reqwest::Error) -> Self {
        Self::Unavailable {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    /// Map a malformed response body.
    pub fn protocol(provider: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AiProvider trait
// ---------------------------------------------------------------------------

/// Boxed future returned by driver operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// A finite, single-pass, non-restartable stream of chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Trait every backend driver implements.
///
/// Async methods return boxed futures so the trait is dyn-compatible (drivers
/// are shared as `Arc<dyn AiProvider>`). No `async_trait` macro is needed.
///
/// Implementations must be safe for concurrent use of `complete` and
/// `stream`; the registry shares one instance per provider for the process
/// lifetime.
pub trait AiProvider: Send + Sync {
    /// Canonical provider name (`azure`, `aws`, `gcp`, `ollama`, `vllm`).
    fn name(&self) -> &'static str;

    /// Whether credentials (and endpoint, where applicable) are present.
    /// Unconfigured providers are excluded from routing and report health
    /// checks as skipped.
    fn is_configured(&self) -> bool;

    /// One non-streaming completion call. One attempt, no retries.
    fn complete(&self, request: &ProviderRequest) -> ProviderFuture<'_, CompletionResponse>;

    /// Open a streaming completion. Chunks arrive in generation order;
    /// exactly one chunk carries the finish reason (and usage when the
    /// backend exposes it). When the backend closes without a terminal
    /// chunk, the driver synthesises a `finish_reason = error` terminal.
    fn stream(&self, request: &ProviderRequest) -> ProviderFuture<'_, ChunkStream>;

    /// Embed each text into a vector; all vectors share one dimension.
    /// Drivers without an embedding backend return [`ProviderError::Unsupported`].
    fn embed(&self, texts: &[String], model: &str) -> ProviderFuture<'_, Vec<Vec<f32>>>;

    /// Lightweight reachability probe. Callers enforce the 5 s deadline.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Release open connections. Idempotent.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_partition() {
        let transient = [
            ProviderError::Unavailable {
                provider: "aws".into(),
                message: "connection refused".into(),
            },
            ProviderError::RateLimited {
                provider: "azure".into(),
                message: "429".into(),
            },
            ProviderError::Internal {
                provider: "gcp".into(),
                message: "boom".into(),
            },
            ProviderError::Protocol {
                provider: "vllm".into(),
                message: "bad json".into(),
            },
        ];
        for e in transient {
            assert!(e.is_transient(), "{} should be transient", e.kind());
        }

        let fatal = [
            ProviderError::Auth {
                provider: "azure".into(),
                message: "bad key".into(),
            },
            ProviderError::ModelNotFound {
                provider: "aws".into(),
                model: "nope".into(),
            },
            ProviderError::ContentFiltered {
                provider: "azure".into(),
                message: "blocked".into(),
            },
            ProviderError::Cancelled("deadline".into()),
        ];
        for e in fatal {
            assert!(!e.is_transient(), "{} should not be transient", e.kind());
        }
    }

    #[test]
    fn test_from_status_mapping() {
        assert_eq!(
            ProviderError::from_status("azure", "gpt-4o", 401, "denied".into()).kind(),
            "auth"
        );
        assert_eq!(
            ProviderError::from_status("azure", "gpt-4o", 403, "denied".into()).kind(),
            "auth"
        );
        assert_eq!(
            ProviderError::from_status("aws", "titan", 404, String::new()).kind(),
            "model_not_found"
        );
        assert_eq!(
            ProviderError::from_status("gcp", "gemini", 429, String::new()).kind(),
            "rate_limited"
        );
        assert_eq!(
            ProviderError::from_status("vllm", "llama", 503, String::new()).kind(),
            "unavailable"
        );
        assert_eq!(
            ProviderError::from_status("ollama", "llama", 418, String::new()).kind(),
            "internal"
        );
    }

    #[test]
    fn test_error_display_carries_provider() {
        let err = ProviderError::ModelNotFound {
            provider: "aws".into(),
            model: "anthropic.claude-3-haiku".into(),
        };
        assert_eq!(
            err.to_string(),
            "Model anthropic.claude-3-haiku not found on aws"
        );
    }
}
