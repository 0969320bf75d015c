//! Model tier catalog.
//!
//! Maps `(provider, tier)` to a concrete backend model id with published
//! per-1K-token prices. Seeded with built-in presets for every provider;
//! configuration overrides replace the model id while keeping the preset's
//! pricing slot. Read-only at runtime.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::GatewayConfig;
use crate::types::ModelTier;

/// One catalog entry: a concrete model with its prices and context window.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub provider: String,
    pub tier: ModelTier,
    pub model_id: String,
    /// USD per 1K input tokens.
    pub input_cost_per_1k: Decimal,
    /// USD per 1K output tokens.
    pub output_cost_per_1k: Decimal,
    pub context_window: u32,
}

/// Static `(provider, tier)` table, plus pricing lookup by model id.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    specs: HashMap<(String, ModelTier), ModelSpec>,
}

impl ModelCatalog {
    /// Catalog with the built-in presets.
    pub fn new() -> Self {
        let mut catalog = Self {
            specs: HashMap::new(),
        };

        // Azure OpenAI
        catalog.insert("azure", ModelTier::Sota, "gpt-4o", dec!(0.0025), dec!(0.01), 128_000);
        catalog.insert(
            "azure",
            ModelTier::CostEffective,
            "gpt-4o-mini",
            dec!(0.00015),
            dec!(0.0006),
            128_000,
        );

        // AWS Bedrock
        catalog.insert(
            "aws",
            ModelTier::Sota,
            "anthropic.claude-3-5-sonnet-20241022-v2:0",
            dec!(0.003),
            dec!(0.015),
            200_000,
        );
        catalog.insert(
            "aws",
            ModelTier::CostEffective,
            "anthropic.claude-3-haiku-20240307-v1:0",
            dec!(0.00025),
            dec!(0.00125),
            200_000,
        );

        // GCP Vertex
        catalog.insert(
            "gcp",
            ModelTier::Sota,
            "gemini-1.5-pro",
            dec!(0.00125),
            dec!(0.005),
            2_000_000,
        );
        catalog.insert(
            "gcp",
            ModelTier::CostEffective,
            "gemini-1.5-flash",
            dec!(0.000075),
            dec!(0.0003),
            1_000_000,
        );

        // Local inference is free.
        catalog.insert("ollama", ModelTier::Sota, "llama3.1:70b", dec!(0), dec!(0), 128_000);
        catalog.insert(
            "ollama",
            ModelTier::CostEffective,
            "llama3.1:8b",
            dec!(0),
            dec!(0),
            128_000,
        );
        catalog.insert(
            "vllm",
            ModelTier::Sota,
            "meta-llama/Llama-3.1-8B-Instruct",
            dec!(0),
            dec!(0),
            128_000,
        );
        catalog.insert(
            "vllm",
            ModelTier::CostEffective,
            "meta-llama/Llama-3.1-8B-Instruct",
            dec!(0),
            dec!(0),
            128_000,
        );

        catalog
    }

    /// Catalog with configuration overrides applied. An override replaces the
    /// model id of its slot; the slot's pricing and context window stay.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut catalog = Self::new();

        let overrides: [(&str, ModelTier, &Option<String>); 10] = [
            ("azure", ModelTier::Sota, &config.azure.sota_deployment),
            ("azure", ModelTier::CostEffective, &config.azure.cost_effective_deployment),
            ("aws", ModelTier::Sota, &config.aws.sota_model),
            ("aws", ModelTier::CostEffective, &config.aws.cost_effective_model),
            ("gcp", ModelTier::Sota, &config.gcp.sota_model),
            ("gcp", ModelTier::CostEffective, &config.gcp.cost_effective_model),
            ("ollama", ModelTier::Sota, &config.ollama.sota_model),
            ("ollama", ModelTier::CostEffective, &config.ollama.cost_effective_model),
            ("vllm", ModelTier::Sota, &config.vllm.model),
            ("vllm", ModelTier::CostEffective, &config.vllm.model),
        ];

        for (provider, tier, model_id) in overrides {
            if let Some(id) = model_id {
                catalog.override_model(provider, tier, id);
            }
        }

        catalog
    }

    /// Add or replace an entry. The catalog is read-only once the gateway is
    /// built; this is for construction time (and tests).
    pub fn insert_spec(&mut self, spec: ModelSpec) {
        self.specs.insert((spec.provider.clone(), spec.tier), spec);
    }

    fn insert(
        &mut self,
        provider: &str,
        tier: ModelTier,
        model_id: &str,
        input_cost_per_1k: Decimal,
        output_cost_per_1k: Decimal,
        context_window: u32,
    ) {
        self.specs.insert(
            (provider.to_string(), tier),
            ModelSpec {
                provider: provider.to_string(),
                tier,
                model_id: model_id.to_string(),
                input_cost_per_1k,
                output_cost_per_1k,
                context_window,
            },
        );
    }

    fn override_model(&mut self, provider: &str, tier: ModelTier, model_id: &str) {
        if let Some(spec) = self.specs.get_mut(&(provider.to_string(), tier)) {
            spec.model_id = model_id.to_string();
        }
    }

    /// Resolve a tier to the concrete model for a provider.
    pub fn resolve(&self, provider: &str, tier: ModelTier) -> Option<&ModelSpec> {
        self.specs.get(&(provider.to_string(), tier))
    }

    /// Per-1K (input, output) prices for a concrete model id, searched across
    /// every entry. `None` means the model is unknown and priced at zero.
    pub fn price_for(&self, model_id: &str) -> Option<(Decimal, Decimal)> {
        self.specs
            .values()
            .find(|s| s.model_id == model_id)
            .map(|s| (s.input_cost_per_1k, s.output_cost_per_1k))
    }

    /// Every catalog entry, unordered.
    pub fn all(&self) -> Vec<&ModelSpec> {
        self.specs.values().collect()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_provider_has_both_tiers() {
        let catalog = ModelCatalog::new();
        for provider in ["azure", "aws", "gcp", "ollama", "vllm"] {
            assert!(
                catalog.resolve(provider, ModelTier::Sota).is_some(),
                "{provider} missing sota"
            );
            assert!(
                catalog.resolve(provider, ModelTier::CostEffective).is_some(),
                "{provider} missing cost_effective"
            );
        }
    }

    #[test]
    fn test_resolve_returns_concrete_model() {
        let catalog = ModelCatalog::new();
        let spec = catalog.resolve("azure", ModelTier::Sota).unwrap();
        assert_eq!(spec.model_id, "gpt-4o");
        assert_eq!(spec.input_cost_per_1k, dec!(0.0025));

        let spec = catalog.resolve("aws", ModelTier::CostEffective).unwrap();
        assert_eq!(spec.model_id, "anthropic.claude-3-haiku-20240307-v1:0");
    }

    #[test]
    fn test_local_models_are_free() {
        let catalog = ModelCatalog::new();
        for provider in ["ollama", "vllm"] {
            let spec = catalog.resolve(provider, ModelTier::Sota).unwrap();
            assert_eq!(spec.input_cost_per_1k, Decimal::ZERO);
            assert_eq!(spec.output_cost_per_1k, Decimal::ZERO);
        }
    }

    #[test]
    fn test_price_for_known_model() {
        let catalog = ModelCatalog::new();
        let (input, output) = catalog.price_for("gemini-1.5-flash").unwrap();
        assert_eq!(input, dec!(0.000075));
        assert_eq!(output, dec!(0.0003));
    }

    #[test]
    fn test_price_for_unknown_model() {
        let catalog = ModelCatalog::new();
        assert!(catalog.price_for("not-a-model").is_none());
    }

    #[test]
    fn test_override_keeps_pricing_slot() {
        let mut catalog = ModelCatalog::new();
        catalog.override_model("azure", ModelTier::Sota, "my-gpt4o-deployment");

        let spec = catalog.resolve("azure", ModelTier::Sota).unwrap();
        assert_eq!(spec.model_id, "my-gpt4o-deployment");
        // Pricing stays with the slot, not the name.
        assert_eq!(spec.input_cost_per_1k, dec!(0.0025));
    }

    #[test]
    fn test_unknown_provider_resolves_none() {
        let catalog = ModelCatalog::new();
        assert!(catalog.resolve("openai", ModelTier::Sota).is_none());
    }
}
