//! Gateway configuration.
//!
//! Loaded once at startup from a TOML file, then overridden field-by-field
//! by `GANTRY_*` environment variables. Immutable afterwards: nothing in the
//! crate mutates a loaded config, and the router/registry take it by value.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::DataClassification;

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Base routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Walk the configured fallback chain.
    #[default]
    Cloud,
    /// Only the configured local chain is used.
    Local,
    /// Classification rules pick the provider; unmatched requests fall
    /// through to the fallback chain.
    Hybrid,
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Local => write!(f, "local"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cloud" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(format!("Unknown routing mode: {s}")),
        }
    }
}

/// One hybrid-mode routing rule; first match wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HybridRule {
    pub classification: DataClassification,
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    /// Order tried when mode is `cloud`.
    #[serde(default = "default_fallback_chain")]
    pub fallback_chain: Vec<String>,
    /// Chain used when mode is `local`.
    #[serde(default = "default_local_chain")]
    pub local_chain: Vec<String>,
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default)]
    pub hybrid_rules: Vec<HybridRule>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            fallback_chain: default_fallback_chain(),
            local_chain: default_local_chain(),
            mode: RoutingMode::default(),
            hybrid_rules: Vec::new(),
        }
    }
}

impl RoutingConfig {
    /// Fallback chain with the primary provider moved (or inserted) first.
    pub fn chain_from(&self, primary: &str) -> Vec<String> {
        let mut chain = vec![primary.to_string()];
        chain.extend(
            self.fallback_chain
                .iter()
                .filter(|p| p.as_str() != primary)
                .cloned(),
        );
        chain
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit_usd: f64,
    /// Usage ratio where the circuit goes HalfOpen.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Usage ratio where the circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit_usd: default_monthly_limit(),
            alert_threshold: default_alert_threshold(),
            breaker_threshold: default_breaker_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_complete_secs")]
    pub complete_secs: u64,
    #[serde(default = "default_stream_secs")]
    pub stream_secs: u64,
    /// Maximum silence between stream chunks before the attempt is treated
    /// as unavailable.
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_secs: u64,
    #[serde(default = "default_health_secs")]
    pub health_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            complete_secs: default_complete_secs(),
            stream_secs: default_stream_secs(),
            stream_idle_secs: default_stream_idle_secs(),
            health_secs: default_health_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-provider sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AzureConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub sota_deployment: Option<String>,
    #[serde(default)]
    pub cost_effective_deployment: Option<String>,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            api_version: default_azure_api_version(),
            sota_deployment: None,
            cost_effective_deployment: None,
        }
    }
}

impl AzureConfig {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty() && !self.api_key.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AwsConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default = "default_aws_region")]
    pub region: String,
    #[serde(default)]
    pub sota_model: Option<String>,
    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: default_aws_region(),
            sota_model: None,
            cost_effective_model: None,
        }
    }
}

impl AwsConfig {
    pub fn is_configured(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcpConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_gcp_location")]
    pub location: String,
    /// OAuth bearer token for the Vertex REST API (e.g. from
    /// `gcloud auth print-access-token` or a metadata-server sidecar).
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub sota_model: Option<String>,
    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            location: default_gcp_location(),
            access_token: String::new(),
            sota_model: None,
            cost_effective_model: None,
        }
    }
}

impl GcpConfig {
    pub fn is_configured(&self) -> bool {
        !self.project_id.is_empty() && !self.access_token.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default)]
    pub sota_model: Option<String>,
    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            sota_model: None,
            cost_effective_model: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VllmConfig {
    #[serde(default = "default_vllm_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for VllmConfig {
    fn default() -> Self {
        Self {
            base_url: default_vllm_url(),
            api_key: None,
            model: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub gcp: GcpConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub vllm: VllmConfig,
}

impl GatewayConfig {
    /// Load from a TOML file (missing file means defaults), apply `GANTRY_*`
    /// environment overrides, then validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Validate threshold ordering and limits; called by [`Self::load`], and
    /// by hand when a config is assembled in code.
    pub fn validate(&self) -> anyhow::Result<()> {
        let b = &self.budget;
        if b.monthly_limit_usd <= 0.0 {
            anyhow::bail!("budget.monthly_limit_usd must be positive");
        }
        if !(0.0 < b.alert_threshold && b.alert_threshold <= 1.0) {
            anyhow::bail!("budget.alert_threshold must be in (0, 1]");
        }
        if !(b.alert_threshold < b.breaker_threshold && b.breaker_threshold <= 1.0) {
            anyhow::bail!("budget.breaker_threshold must be in (alert_threshold, 1]");
        }
        if self.routing.fallback_chain.is_empty() {
            anyhow::bail!("routing.fallback_chain must not be empty");
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! env_str {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                }
            };
        }
        macro_rules! env_opt_str {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = if val.is_empty() { None } else { Some(val) };
                }
            };
        }
        macro_rules! env_parse {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                    }
                }
            };
        }
        macro_rules! env_list {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
            };
        }

        // Routing
        env_parse!("GANTRY_MODE", self.routing.mode);
        env_str!("GANTRY_DEFAULT_PROVIDER", self.routing.default_provider);
        env_list!("GANTRY_FALLBACK_CHAIN", self.routing.fallback_chain);
        env_list!("GANTRY_LOCAL_CHAIN", self.routing.local_chain);

        // Budget
        env_parse!("GANTRY_MONTHLY_LIMIT_USD", self.budget.monthly_limit_usd);
        env_parse!("GANTRY_ALERT_THRESHOLD", self.budget.alert_threshold);
        env_parse!("GANTRY_BREAKER_THRESHOLD", self.budget.breaker_threshold);

        // Azure
        env_str!("GANTRY_AZURE_ENDPOINT", self.azure.endpoint);
        env_str!("GANTRY_AZURE_API_KEY", self.azure.api_key);
        env_str!("GANTRY_AZURE_API_VERSION", self.azure.api_version);
        env_opt_str!("GANTRY_AZURE_SOTA_MODEL", self.azure.sota_deployment);
        env_opt_str!(
            "GANTRY_AZURE_COST_EFFECTIVE_MODEL",
            self.azure.cost_effective_deployment
        );

        // AWS
        env_str!("GANTRY_AWS_ACCESS_KEY_ID", self.aws.access_key_id);
        env_str!("GANTRY_AWS_SECRET_ACCESS_KEY", self.aws.secret_access_key);
        env_str!("GANTRY_AWS_REGION", self.aws.region);
        env_opt_str!("GANTRY_AWS_SOTA_MODEL", self.aws.sota_model);
        env_opt_str!("GANTRY_AWS_COST_EFFECTIVE_MODEL", self.aws.cost_effective_model);

        // GCP
        env_str!("GANTRY_GCP_PROJECT_ID", self.gcp.project_id);
        env_str!("GANTRY_GCP_LOCATION", self.gcp.location);
        env_str!("GANTRY_GCP_ACCESS_TOKEN", self.gcp.access_token);
        env_opt_str!("GANTRY_GCP_SOTA_MODEL", self.gcp.sota_model);
        env_opt_str!("GANTRY_GCP_COST_EFFECTIVE_MODEL", self.gcp.cost_effective_model);

        // Ollama / vLLM
        env_str!("GANTRY_OLLAMA_ENDPOINT", self.ollama.base_url);
        env_opt_str!("GANTRY_OLLAMA_SOTA_MODEL", self.ollama.sota_model);
        env_opt_str!(
            "GANTRY_OLLAMA_COST_EFFECTIVE_MODEL",
            self.ollama.cost_effective_model
        );
        env_str!("GANTRY_VLLM_ENDPOINT", self.vllm.base_url);
        env_opt_str!("GANTRY_VLLM_API_KEY", self.vllm.api_key);
        env_opt_str!("GANTRY_VLLM_MODEL", self.vllm.model);
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_provider() -> String {
    "azure".to_string()
}
fn default_fallback_chain() -> Vec<String> {
    ["azure", "aws", "gcp", "ollama"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_local_chain() -> Vec<String> {
    ["ollama", "vllm"].iter().map(|s| s.to_string()).collect()
}
const fn default_monthly_limit() -> f64 {
    500.0
}
const fn default_alert_threshold() -> f64 {
    0.8
}
const fn default_breaker_threshold() -> f64 {
    0.95
}
const fn default_complete_secs() -> u64 {
    60
}
const fn default_stream_secs() -> u64 {
    300
}
const fn default_stream_idle_secs() -> u64 {
    30
}
const fn default_health_secs() -> u64 {
    5
}
fn default_azure_api_version() -> String {
    "2024-12-01-preview".to_string()
}
fn default_aws_region() -> String {
    "us-east-1".to_string()
}
fn default_gcp_location() -> String {
    "us-central1".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_vllm_url() -> String {
    "http://localhost:8000".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
