//! Request router — the gateway's public face.
//!
//! Every entry point runs the same decision procedure: budget gate, chain
//! selection (explicit provider, local chain, hybrid classification rules,
//! or the fallback chain), per-provider tier resolution, then an attempt
//! loop that falls over on transient failures and stops on fatal ones. A
//! successful attempt records its cost and debits the budget; a request
//! that never reached a driver costs nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::budget::{BudgetBreaker, BudgetStatus};
use crate::catalog::ModelCatalog;
use crate::config::{GatewayConfig, RoutingConfig, RoutingMode, TimeoutConfig};
use crate::cost::{CostRecord, CostSummary, CostTracker, SummaryFilter};
use crate::error::{GatewayError, ProviderAttempt};
use crate::providers::{AiProvider, ChunkStream, ProviderError};
use crate::registry::{HealthStatus, ProviderRegistry};
use crate::types::{
    estimate_tokens, CompletionRequest, CompletionResponse, FinishReason, ProviderRequest,
    StreamChunk,
};

/// The multi-cloud gateway: uniform completion, streaming and embedding
/// entry points over the registered providers, plus the admin surface.
///
/// Safe for concurrent callers; shared behind an `Arc` by embedders.
pub struct Gateway {
    registry: ProviderRegistry,
    catalog: Arc<ModelCatalog>,
    tracker: Arc<CostTracker>,
    breaker: Arc<BudgetBreaker>,
    routing: RoutingConfig,
    timeouts: TimeoutConfig,
}

impl Gateway {
    /// Build the full gateway from configuration: all five drivers, the
    /// catalog with overrides, and a fresh budget.
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = ProviderRegistry::from_config(&config)?;
        let catalog = Arc::new(ModelCatalog::from_config(&config));
        let breaker = Arc::new(BudgetBreaker::new(
            config.budget.monthly_limit_usd,
            config.budget.alert_threshold,
            config.budget.breaker_threshold,
        ));
        Ok(Self::new(
            registry,
            catalog,
            breaker,
            config.routing,
            config.timeouts,
        ))
    }

    /// Assemble a gateway from parts. Tests inject stub registries and a
    /// seeded budget through here.
    pub fn new(
        registry: ProviderRegistry,
        catalog: Arc<ModelCatalog>,
        breaker: Arc<BudgetBreaker>,
        routing: RoutingConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        let tracker = Arc::new(CostTracker::new(Arc::clone(&catalog)));
        Self {
            registry,
            catalog,
            tracker,
            breaker,
            routing,
            timeouts,
        }
    }

    // -- public surface ------------------------------------------------------

    /// One completion with fallback.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        request.validate()?;
        self.breaker.check_and_admit(self.estimate_cost(request))?;

        let chain = self.build_chain(request);
        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = request
            .timeout
            .unwrap_or(Duration::from_secs(self.timeouts.complete_secs));

        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut invoked_any = false;

        for name in &chain {
            let provider = match self.registry.get(name) {
                Ok(provider) => provider,
                Err(_) => {
                    warn!(
                        provider = %name,
                        request_id = %request_id,
                        "router.provider_not_configured"
                    );
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        kind: "unavailable",
                        message: format!("provider {name} is not configured"),
                    });
                    continue;
                }
            };
            let Some(model) = self.resolve_model(request, name) else {
                attempts.push(ProviderAttempt {
                    provider: name.clone(),
                    kind: "model_not_found",
                    message: format!("no {} model for provider {name}", request.tier),
                });
                continue;
            };

            let provider_request = ProviderRequest::resolved(request, model.clone());
            info!(
                provider = %name,
                model = %model,
                request_id = %request_id,
                "router.attempting"
            );
            invoked_any = true;

            match tokio::time::timeout(deadline, provider.complete(&provider_request)).await {
                Err(_) => {
                    // Deadline expiry ends the request; no debit, no fallback.
                    return Err(GatewayError::Cancelled(format!(
                        "completion exceeded {}s",
                        deadline.as_secs()
                    )));
                }
                Ok(Ok(mut response)) => {
                    let cost = self.tracker.record(
                        name,
                        &model,
                        response.usage.prompt_tokens,
                        response.usage.completion_tokens,
                        &request_id,
                    );
                    self.breaker.record_usage(cost);
                    response.cost_usd = cost.to_f64().unwrap_or(0.0);
                    info!(
                        provider = %name,
                        model = %model,
                        tokens = response.usage.total_tokens,
                        cost_usd = %cost,
                        request_id = %request_id,
                        "router.success"
                    );
                    return Ok(response);
                }
                Ok(Err(e)) if e.is_transient() => {
                    warn!(
                        provider = %name,
                        error = %e,
                        request_id = %request_id,
                        "router.provider_failed"
                    );
                    attempts.push(ProviderAttempt::from_error(name, &e));
                }
                Ok(Err(ProviderError::Cancelled(reason))) => {
                    return Err(GatewayError::Cancelled(reason));
                }
                Ok(Err(e)) => return Err(GatewayError::Provider(e)),
            }
        }

        if !invoked_any {
            return Err(GatewayError::NoProvidersConfigured);
        }
        Err(GatewayError::AllProvidersFailed { attempts })
    }

    /// Open a completion stream with fallback. Because bytes cannot be
    /// un-sent, fallback happens only before the first chunk is delivered;
    /// failures after that terminate the stream with the observed error.
    /// Cost is recorded at the terminal chunk.
    pub async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, GatewayError> {
        request.validate()?;
        self.breaker.check_and_admit(self.estimate_cost(request))?;

        let chain = self.build_chain(request);
        let request_id = uuid::Uuid::new_v4().to_string();
        let total = request
            .timeout
            .unwrap_or(Duration::from_secs(self.timeouts.stream_secs));
        let idle = Duration::from_secs(self.timeouts.stream_idle_secs);

        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut invoked_any = false;

        for name in &chain {
            let provider = match self.registry.get(name) {
                Ok(provider) => provider,
                Err(_) => {
                    warn!(
                        provider = %name,
                        request_id = %request_id,
                        "router.provider_not_configured"
                    );
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        kind: "unavailable",
                        message: format!("provider {name} is not configured"),
                    });
                    continue;
                }
            };
            let Some(model) = self.resolve_model(request, name) else {
                attempts.push(ProviderAttempt {
                    provider: name.clone(),
                    kind: "model_not_found",
                    message: format!("no {} model for provider {name}", request.tier),
                });
                continue;
            };

            let provider_request = ProviderRequest::resolved(request, model.clone());
            info!(
                provider = %name,
                model = %model,
                request_id = %request_id,
                "router.stream.attempting"
            );
            invoked_any = true;

            let mut inner = match provider.stream(&provider_request).await {
                Ok(stream) => stream,
                Err(e) if e.is_transient() => {
                    warn!(
                        provider = %name,
                        error = %e,
                        request_id = %request_id,
                        "router.provider_failed"
                    );
                    attempts.push(ProviderAttempt::from_error(name, &e));
                    continue;
                }
                Err(ProviderError::Cancelled(reason)) => {
                    return Err(GatewayError::Cancelled(reason));
                }
                Err(e) => return Err(GatewayError::Provider(e)),
            };

            // Pull the first chunk while fallback is still possible.
            let first = match tokio::time::timeout(idle, inner.next()).await {
                Err(_) => {
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        kind: "unavailable",
                        message: format!("no chunk within {}s", idle.as_secs()),
                    });
                    continue;
                }
                Ok(None) => {
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        kind: "protocol",
                        message: "stream ended before the first chunk".into(),
                    });
                    continue;
                }
                Ok(Some(Err(e))) if e.is_transient() => {
                    warn!(
                        provider = %name,
                        error = %e,
                        request_id = %request_id,
                        "router.provider_failed"
                    );
                    attempts.push(ProviderAttempt::from_error(name, &e));
                    continue;
                }
                Ok(Some(Err(ProviderError::Cancelled(reason)))) => {
                    return Err(GatewayError::Cancelled(reason));
                }
                Ok(Some(Err(e))) => return Err(GatewayError::Provider(e)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            // A driver whose backend closed immediately synthesises a bare
            // error terminal; that still counts as a failed attempt.
            if first.finish_reason == Some(FinishReason::Error) && first.delta.is_empty() {
                attempts.push(ProviderAttempt {
                    provider: name.clone(),
                    kind: "unavailable",
                    message: "stream closed before producing output".into(),
                });
                continue;
            }

            info!(
                provider = %name,
                model = %model,
                request_id = %request_id,
                "router.stream.started"
            );
            return Ok(self.wrap_stream(
                name.clone(),
                model,
                request_id,
                first,
                inner,
                total,
                idle,
            ));
        }

        if !invoked_any {
            return Err(GatewayError::NoProvidersConfigured);
        }
        Err(GatewayError::AllProvidersFailed { attempts })
    }

    /// Embed texts with fallback. Drivers without an embedding backend are
    /// skipped the same way unavailable ones are.
    pub async fn embed(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<Vec<Vec<f32>>, GatewayError> {
        if texts.is_empty() {
            return Err(GatewayError::InvalidRequest("texts must not be empty".into()));
        }
        self.breaker.check_and_admit(0.0)?;

        let chain = self.build_chain(&CompletionRequest::default());
        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut invoked_any = false;

        for name in &chain {
            let provider = match self.registry.get(name) {
                Ok(provider) => provider,
                Err(_) => {
                    warn!(provider = %name, "router.provider_not_configured");
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        kind: "unavailable",
                        message: format!("provider {name} is not configured"),
                    });
                    continue;
                }
            };
            invoked_any = true;

            match provider.embed(texts, model).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) if e.is_transient() || matches!(e, ProviderError::Unsupported { .. }) => {
                    warn!(provider = %name, error = %e, "router.embed.failed");
                    attempts.push(ProviderAttempt::from_error(name, &e));
                }
                Err(ProviderError::Cancelled(reason)) => {
                    return Err(GatewayError::Cancelled(reason));
                }
                Err(e) => return Err(GatewayError::Provider(e)),
            }
        }

        if !invoked_any {
            return Err(GatewayError::NoProvidersConfigured);
        }
        Err(GatewayError::AllProvidersFailed { attempts })
    }

    // -- admin surface -------------------------------------------------------

    pub fn budget_state(&self) -> BudgetStatus {
        self.breaker.status()
    }

    pub fn reset_budget(&self) {
        self.breaker.reset();
    }

    pub fn cost_summary(&self, filter: &SummaryFilter) -> CostSummary {
        self.tracker.summary(filter)
    }

    pub fn cost_records(&self, offset: usize, limit: usize) -> Vec<CostRecord> {
        self.tracker.records(offset, limit)
    }

    /// Configuration status per registered provider.
    pub fn providers_status(&self) -> HashMap<String, bool> {
        self.registry.status()
    }

    pub async fn health_check_all(&self) -> HashMap<String, HealthStatus> {
        self.registry.health_check_all().await
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Close every driver. Idempotent; call on shutdown.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }

    // -- decision procedure --------------------------------------------------

    /// Chain of provider names to try, in order.
    fn build_chain(&self, request: &CompletionRequest) -> Vec<String> {
        // An explicit provider pins the request: no fallback.
        if let Some(provider) = &request.provider {
            return vec![provider.clone()];
        }

        match self.routing.mode {
            RoutingMode::Local => self.routing.local_chain.clone(),
            RoutingMode::Hybrid => {
                if let Some(classification) = request.data_classification {
                    if let Some(rule) = self
                        .routing
                        .hybrid_rules
                        .iter()
                        .find(|rule| rule.classification == classification)
                    {
                        info!(
                            classification = %classification,
                            provider = %rule.provider,
                            "router.hybrid_match"
                        );
                        return vec![rule.provider.clone()];
                    }
                }
                self.default_chain()
            }
            RoutingMode::Cloud => self.default_chain(),
        }
    }

    /// Fallback chain headed by the default provider, filtered to providers
    /// that are currently available.
    fn default_chain(&self) -> Vec<String> {
        let available = self.registry.available();
        self.routing
            .chain_from(&self.routing.default_provider)
            .into_iter()
            .filter(|name| available.contains(name))
            .collect()
    }

    /// Concrete model for this provider: the request's own model, or the
    /// catalog entry for its tier. Re-run per provider, so fallback across
    /// providers re-resolves the tier.
    fn resolve_model(&self, request: &CompletionRequest, provider: &str) -> Option<String> {
        match &request.model {
            Some(model) => Some(model.clone()),
            None => self
                .catalog
                .resolve(provider, request.tier)
                .map(|spec| spec.model_id.clone()),
        }
    }

    /// Rough pre-admission cost estimate; used for logging only, never for
    /// admission decisions.
    fn estimate_cost(&self, request: &CompletionRequest) -> f64 {
        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        let prompt_tokens = estimate_tokens(prompt_chars);
        request
            .model
            .as_deref()
            .and_then(|model| self.catalog.price_for(model))
            .map(|(input_per_1k, _)| {
                (Decimal::from(prompt_tokens) / Decimal::from(1000) * input_per_1k)
                    .to_f64()
                    .unwrap_or(0.0)
            })
            .unwrap_or(0.0)
    }

    /// Wrap a driver stream with idle/total deadlines and terminal-chunk
    /// cost recording. The first chunk was already pulled by the router.
    #[allow(clippy::too_many_arguments)]
    fn wrap_stream(
        &self,
        provider: String,
        model: String,
        request_id: String,
        first: StreamChunk,
        inner: ChunkStream,
        total: Duration,
        idle: Duration,
    ) -> ChunkStream {
        struct WrapState {
            inner: ChunkStream,
            first: Option<StreamChunk>,
            tracker: Arc<CostTracker>,
            breaker: Arc<BudgetBreaker>,
            provider: String,
            model: String,
            request_id: String,
            deadline: Instant,
            idle: Duration,
            done: bool,
        }

        impl WrapState {
            fn deliver(&mut self, chunk: StreamChunk) -> Result<StreamChunk, ProviderError> {
                if chunk.is_terminal() {
                    self.done = true;
                    // An error terminal means the stream died mid-flight;
                    // nothing is charged for it.
                    if chunk.finish_reason != Some(FinishReason::Error) {
                        let usage = chunk.usage.unwrap_or_default();
                        let cost = self.tracker.record(
                            &self.provider,
                            &self.model,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            &self.request_id,
                        );
                        self.breaker.record_usage(cost);
                        info!(
                            provider = %self.provider,
                            model = %self.model,
                            cost_usd = %cost,
                            request_id = %self.request_id,
                            "router.stream.success"
                        );
                    }
                }
                Ok(chunk)
            }
        }

        let state = WrapState {
            inner,
            first: Some(first),
            tracker: Arc::clone(&self.tracker),
            breaker: Arc::clone(&self.breaker),
            provider,
            model,
            request_id,
            deadline: Instant::now() + total,
            idle,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if let Some(chunk) = st.first.take() {
                let item = st.deliver(chunk);
                return Some((item, st));
            }

            let now = Instant::now();
            let Some(remaining) = st.deadline.checked_duration_since(now) else {
                st.done = true;
                return Some((
                    Err(ProviderError::Cancelled("stream deadline exceeded".into())),
                    st,
                ));
            };

            match tokio::time::timeout(st.idle.min(remaining), st.inner.next()).await {
                Err(_) => {
                    st.done = true;
                    let err = if Instant::now() >= st.deadline {
                        ProviderError::Cancelled("stream deadline exceeded".into())
                    } else {
                        ProviderError::Unavailable {
                            provider: st.provider.clone(),
                            message: format!("no chunk for {}s", st.idle.as_secs()),
                        }
                    };
                    Some((Err(err), st))
                }
                Ok(None) => {
                    st.done = true;
                    None
                }
                Ok(Some(Ok(chunk))) => {
                    let item = st.deliver(chunk);
                    Some((item, st))
                }
                Ok(Some(Err(e))) => {
                    st.done = true;
                    Some((Err(e), st))
                }
            }
        });

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HybridRule;
    use crate::types::{ChatMessage, DataClassification, ModelTier};

    fn gateway_with_routing(routing: RoutingConfig) -> Gateway {
        let config = GatewayConfig {
            routing,
            ..Default::default()
        };
        let registry = ProviderRegistry::from_config(&config).unwrap();
        Gateway::new(
            registry,
            Arc::new(ModelCatalog::new()),
            Arc::new(BudgetBreaker::new(100.0, 0.8, 0.95)),
            config.routing,
            config.timeouts,
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    #[test]
    fn test_explicit_provider_pins_chain() {
        let gateway = gateway_with_routing(RoutingConfig::default());
        let mut req = request();
        req.provider = Some("gcp".into());
        assert_eq!(gateway.build_chain(&req), vec!["gcp"]);
    }

    #[test]
    fn test_cloud_chain_filters_to_available() {
        // Default config configures only the local providers; the fallback
        // chain [azure, aws, gcp, ollama] filters down to ollama.
        let gateway = gateway_with_routing(RoutingConfig::default());
        assert_eq!(gateway.build_chain(&request()), vec!["ollama"]);
    }

    #[test]
    fn test_local_mode_uses_local_chain() {
        let routing = RoutingConfig {
            mode: RoutingMode::Local,
            ..Default::default()
        };
        let gateway = gateway_with_routing(routing);
        assert_eq!(gateway.build_chain(&request()), vec!["ollama", "vllm"]);
    }

    #[test]
    fn test_hybrid_rule_overrides_chain() {
        let routing = RoutingConfig {
            mode: RoutingMode::Hybrid,
            hybrid_rules: vec![HybridRule {
                classification: DataClassification::Confidential,
                provider: "ollama".into(),
            }],
            ..Default::default()
        };
        let gateway = gateway_with_routing(routing);

        let mut req = request();
        req.data_classification = Some(DataClassification::Confidential);
        assert_eq!(gateway.build_chain(&req), vec!["ollama"]);

        // Unmatched classification falls through to the default chain.
        req.data_classification = Some(DataClassification::Public);
        assert_eq!(gateway.build_chain(&req), vec!["ollama"]);
    }

    #[test]
    fn test_resolve_model_prefers_explicit() {
        let gateway = gateway_with_routing(RoutingConfig::default());
        let mut req = request();
        req.model = Some("my-model".into());
        assert_eq!(
            gateway.resolve_model(&req, "azure").as_deref(),
            Some("my-model")
        );

        req.model = None;
        req.tier = ModelTier::CostEffective;
        assert_eq!(
            gateway.resolve_model(&req, "azure").as_deref(),
            Some("gpt-4o-mini")
        );
        assert_eq!(
            gateway.resolve_model(&req, "aws").as_deref(),
            Some("anthropic.claude-3-haiku-20240307-v1:0")
        );
        assert!(gateway.resolve_model(&req, "unknown").is_none());
    }

    #[test]
    fn test_estimate_cost_known_model_only() {
        let gateway = gateway_with_routing(RoutingConfig::default());
        let mut req = request();
        assert_eq!(gateway.estimate_cost(&req), 0.0);

        // 4000 chars -> 1000 tokens at $0.0025/1K.
        req.messages = vec![ChatMessage::user("x".repeat(4000))];
        req.model = Some("gpt-4o".into());
        let estimate = gateway.estimate_cost(&req);
        assert!((estimate - 0.0025).abs() < 1e-9);
    }
}
