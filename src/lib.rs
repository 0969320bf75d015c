//! gantry — multi-cloud AI provider gateway.
//!
//! One uniform request/response/streaming contract over heterogeneous LLM
//! backends (Azure OpenAI, AWS Bedrock, GCP Vertex, Ollama, vLLM), with
//! three controls layered on top:
//!
//!   - an ordered fallback router that fails over on transient provider
//!     errors without losing the caller's stream,
//!   - a monthly-budget circuit breaker fed by a fixed-scale-decimal cost
//!     tracker,
//!   - a hybrid routing policy that steers classified traffic to on-premise
//!     models.
//!
//! The crate is a library: the REST layer, agents and dashboards are
//! callers. Build a [`Gateway`] from a [`GatewayConfig`] and use
//! `complete` / `stream` / `embed`, plus the admin surface
//! (`budget_state`, `cost_summary`, `providers_status`, ...).
//!
//! ```no_run
//! use gantry::{ChatMessage, CompletionRequest, Gateway, GatewayConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = GatewayConfig::load(std::path::Path::new("gantry.toml"))?;
//! let gateway = Gateway::from_config(config)?;
//!
//! let request = CompletionRequest::new(vec![ChatMessage::user("hello")]);
//! let response = gateway.complete(&request).await?;
//! println!("{} (${:.4})", response.content, response.cost_usd);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod catalog;
pub mod config;
pub mod cost;
pub mod error;
pub mod providers;
pub mod registry;
pub mod router;
pub mod types;

pub use budget::{BudgetBreaker, BudgetStatus, CircuitState};
pub use catalog::{ModelCatalog, ModelSpec};
pub use config::{GatewayConfig, HybridRule, RoutingConfig, RoutingMode, TimeoutConfig};
pub use cost::{CostRecord, CostSummary, CostTracker, SummaryFilter};
pub use error::{GatewayError, ProviderAttempt};
pub use providers::{AiProvider, ChunkStream, ProviderError};
pub use registry::{HealthStatus, ProviderRegistry};
pub use router::Gateway;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, DataClassification, FinishReason,
    ModelTier, ProviderRequest, Role, StreamChunk, TokenUsage,
};
