//! Provider registry.
//!
//! Holds one driver per canonical provider name for the process lifetime.
//! Constructed once from configuration and immutable afterwards; the router
//! reaches drivers only through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::info;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::providers::{
    AiProvider, AwsBedrockProvider, AzureOpenAiProvider, GcpVertexProvider, OllamaProvider,
    VllmProvider,
};

/// Outcome of one provider's health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// Provider is not configured; the probe was not attempted.
    Skipped,
    /// Probe failed or exceeded the deadline.
    Error,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AiProvider>>,
    /// Registration order, for stable listings.
    order: Vec<String>,
    health_deadline: Duration,
}

impl ProviderRegistry {
    /// Empty registry; used by tests and embedders that assemble their own
    /// driver set.
    pub fn new(health_deadline: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            order: Vec::new(),
            health_deadline,
        }
    }

    /// Build all five drivers from configuration. Unconfigured drivers are
    /// still registered: they report `Skipped` health and are excluded from
    /// routing by [`Self::available`].
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new(Duration::from_secs(config.timeouts.health_secs));
        registry.register(Arc::new(AzureOpenAiProvider::new(
            config.azure.clone(),
            &config.timeouts,
        )?));
        registry.register(Arc::new(AwsBedrockProvider::new(
            config.aws.clone(),
            &config.timeouts,
        )?));
        registry.register(Arc::new(GcpVertexProvider::new(
            config.gcp.clone(),
            &config.timeouts,
        )?));
        registry.register(Arc::new(OllamaProvider::new(
            config.ollama.clone(),
            &config.timeouts,
        )?));
        registry.register(Arc::new(VllmProvider::new(
            config.vllm.clone(),
            &config.timeouts,
        )?));
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn AiProvider>) {
        let name = provider.name().to_string();
        info!(
            provider = %name,
            configured = provider.is_configured(),
            "provider.registered"
        );
        if !self.providers.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.providers.insert(name, provider);
    }

    /// Fetch a driver by name. Absent or unconfigured providers signal
    /// `provider_unavailable`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn AiProvider>, GatewayError> {
        match self.providers.get(name) {
            Some(provider) if provider.is_configured() => Ok(Arc::clone(provider)),
            _ => Err(GatewayError::ProviderUnavailable(name.to_string())),
        }
    }

    /// All registered names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Names whose drivers report a present configuration.
    pub fn available(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                self.providers
                    .get(*name)
                    .is_some_and(|p| p.is_configured())
            })
            .cloned()
            .collect()
    }

    /// Configuration status per provider, for the admin surface.
    pub fn status(&self) -> HashMap<String, bool> {
        self.providers
            .iter()
            .map(|(name, p)| (name.clone(), p.is_configured()))
            .collect()
    }

    /// Probe every driver in parallel. Each probe races the health deadline;
    /// overruns report `Error`, unconfigured drivers report `Skipped`.
    pub async fn health_check_all(&self) -> HashMap<String, HealthStatus> {
        let deadline = self.health_deadline;
        let probes = self.order.iter().map(|name| {
            let provider = Arc::clone(&self.providers[name]);
            let name = name.clone();
            async move {
                if !provider.is_configured() {
                    return (name, HealthStatus::Skipped);
                }
                let status = match tokio::time::timeout(deadline, provider.health_check()).await {
                    Ok(true) => HealthStatus::Ok,
                    Ok(false) | Err(_) => HealthStatus::Error,
                };
                (name, status)
            }
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Close every driver; called on shutdown.
    pub async fn close_all(&self) {
        join_all(self.providers.values().map(|p| p.close())).await;
    }
}
