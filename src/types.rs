//! Core request/response data model shared by the router and every driver.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// The wire name used by every OpenAI-compatible backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Quality/cost preset resolved by the model catalog to a concrete model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Sota,
    CostEffective,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sota => write!(f, "sota"),
            Self::CostEffective => write!(f, "cost_effective"),
        }
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "sota" => Ok(Self::Sota),
            "cost_effective" => Ok(Self::CostEffective),
            _ => Err(format!("Unknown model tier: {s}")),
        }
    }
}

/// Sensitivity label attached to a request; hybrid mode routes on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    Confidential,
    Internal,
    General,
    Public,
}

impl std::fmt::Display for DataClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confidential => write!(f, "confidential"),
            Self::Internal => write!(f, "internal"),
            Self::General => write!(f, "general"),
            Self::Public => write!(f, "public"),
        }
    }
}

impl FromStr for DataClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "confidential" => Ok(Self::Confidential),
            "internal" => Ok(Self::Internal),
            "general" => Ok(Self::General),
            "public" => Ok(Self::Public),
            _ => Err(format!("Unknown data classification: {s}")),
        }
    }
}

/// A completion request as submitted by a caller of the gateway.
///
/// Either `model` names a concrete backend model id, or `tier` selects one
/// through the catalog. An explicit `provider` pins the request to a single
/// provider with no fallback.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Concrete model id; bypasses tier resolution when set.
    pub model: Option<String>,
    pub tier: ModelTier,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
    pub data_classification: Option<DataClassification>,
    /// Explicit provider override; disables the fallback chain.
    pub provider: Option<String>,
    /// Per-call deadline override (defaults: 60 s complete, 5 min stream).
    pub timeout: Option<Duration>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Schema validation performed before budget admission.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".into(),
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::InvalidRequest(format!(
                    "temperature {t} outside [0, 2]"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(GatewayError::InvalidRequest(format!(
                    "top_p {p} outside [0, 1]"
                )));
            }
        }
        if let Some(m) = &self.model {
            if m.is_empty() {
                return Err(GatewayError::InvalidRequest("model must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// The request handed to a driver: identical to [`CompletionRequest`] except
/// the model is always concrete (tier resolution happened at the router).
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
}

impl ProviderRequest {
    pub fn resolved(request: &CompletionRequest, model: String) -> Self {
        Self {
            messages: request.messages.clone(),
            model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: request.stop.clone(),
        }
    }

    /// Total character length of all message bodies, for token estimation.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCall,
    Error,
}

impl FinishReason {
    /// Map an OpenAI-compatible `finish_reason` string.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCall,
            "error" => Self::Error,
            _ => Self::Stop,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ContentFilter => write!(f, "content_filter"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Token usage for one exchange.
///
/// `estimated` marks counts derived from the char/4 heuristic rather than
/// reported by the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default)]
    pub estimated: bool,
}

impl TokenUsage {
    /// Usage reported verbatim by the backend.
    pub fn reported(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: false,
        }
    }

    /// Best-effort usage estimated from character counts.
    pub fn estimated(prompt_chars: usize, completion_chars: usize) -> Self {
        let prompt_tokens = estimate_tokens(prompt_chars);
        let completion_tokens = estimate_tokens(completion_chars);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: true,
        }
    }
}

/// `ceil(chars / 4)` token estimate, used when a backend reports no usage.
pub fn estimate_tokens(chars: usize) -> u32 {
    chars.div_ceil(4) as u32
}

/// The completed response returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Cost in USD, filled in by the router after cost recording.
    pub cost_usd: f64,
    pub finish_reason: FinishReason,
}

/// One delta of a streaming response.
///
/// Exactly one chunk per stream carries a finish reason (the terminal chunk);
/// usage is present only there, and only when the backend exposes it.
#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub delta: String,
    pub provider: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamChunk {
    pub fn delta(provider: &str, model: &str, delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            provider: provider.to_string(),
            model: model.to_string(),
            usage: None,
            finish_reason: None,
        }
    }

    pub fn terminal(
        provider: &str,
        model: &str,
        usage: Option<TokenUsage>,
        finish_reason: FinishReason,
    ) -> Self {
        Self {
            delta: String::new(),
            provider: provider.to_string(),
            model: model.to_string(),
            usage,
            finish_reason: Some(finish_reason),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}
