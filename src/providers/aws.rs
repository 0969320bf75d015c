//! AWS Bedrock driver.
//!
//! Invokes models through the Bedrock runtime (`/model/{id}/invoke` and
//! `/invoke-with-response-stream`) with SigV4-signed requests. The request
//! and response body shape varies by vendor model family — Anthropic
//! messages, Amazon Titan text generation and Meta Llama prompts are each
//! handled here. Response streams arrive in the AWS event-stream envelope;
//! the driver extracts the embedded base64 payload documents rather than
//! interpreting the binary framing.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine as _;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::{AwsConfig, TimeoutConfig};
use crate::providers::{AiProvider, ChunkStream, ProviderError, ProviderFuture};
use crate::types::{
    CompletionResponse, FinishReason, ProviderRequest, Role, StreamChunk, TokenUsage,
};

/// Embedding model used when the caller passes an empty model id.
const DEFAULT_EMBED_MODEL: &str = "amazon.titan-embed-text-v2:0";

const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// SigV4 request signing
// ---------------------------------------------------------------------------

mod sigv4 {
    use chrono::{DateTime, Utc};
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};

    type HmacSha256 = Hmac<Sha256>;

    pub struct Credentials<'a> {
        pub access_key_id: &'a str,
        pub secret_access_key: &'a str,
    }

    /// The pieces of a request that participate in the signature. The
    /// canonical URI and query string must arrive already URI-encoded.
    pub struct SigningInput<'a> {
        pub method: &'a str,
        pub host: &'a str,
        pub canonical_uri: &'a str,
        pub canonical_query: &'a str,
        pub content_type: Option<&'a str>,
        pub payload: &'a [u8],
        pub region: &'a str,
        pub service: &'a str,
        pub timestamp: DateTime<Utc>,
    }

    pub struct Signature {
        pub authorization: String,
        pub amz_date: String,
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex(&Sha256::digest(data))
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn sign(credentials: &Credentials, input: &SigningInput) -> Signature {
        let amz_date = input.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date = input.timestamp.format("%Y%m%d").to_string();

        // Canonical headers in lexical order; content-type only when sent.
        let mut headers: Vec<(&str, String)> = Vec::new();
        if let Some(ct) = input.content_type {
            headers.push(("content-type", ct.to_string()));
        }
        headers.push(("host", input.host.to_string()));
        headers.push(("x-amz-date", amz_date.clone()));

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");

        let payload_hash = sha256_hex(input.payload);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            input.method,
            input.canonical_uri,
            input.canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash,
        );

        let scope = format!("{date}/{}/{}/aws4_request", input.region, input.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes()),
        );

        let secret = format!("AWS4{}", credentials.secret_access_key);
        let k_date = hmac(secret.as_bytes(), date.as_bytes());
        let k_region = hmac(&k_date, input.region.as_bytes());
        let k_service = hmac(&k_region, input.service.as_bytes());
        let k_signing = hmac(&k_service, b"aws4_request");
        let signature = hex(&hmac(&k_signing, string_to_sign.as_bytes()));

        Signature {
            authorization: format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                credentials.access_key_id,
            ),
            amz_date,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::TimeZone;

        /// The worked GET example from the SigV4 reference.
        #[test]
        fn test_reference_vector() {
            let credentials = Credentials {
                access_key_id: "AKIDEXAMPLE",
                secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            };
            let input = SigningInput {
                method: "GET",
                host: "iam.amazonaws.com",
                canonical_uri: "/",
                canonical_query: "Action=ListUsers&Version=2010-05-08",
                content_type: Some("application/x-www-form-urlencoded; charset=utf-8"),
                payload: b"",
                region: "us-east-1",
                service: "iam",
                timestamp: Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap(),
            };

            let signature = sign(&credentials, &input);
            assert_eq!(signature.amz_date, "20150830T123600Z");
            assert!(signature.authorization.ends_with(
                "Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
            ));
            assert!(signature
                .authorization
                .contains("SignedHeaders=content-type;host;x-amz-date"));
        }
    }
}

/// Percent-encode one path segment the way SigV4 canonicalization expects:
/// everything but unreserved characters.
fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Model families
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFamily {
    Anthropic,
    Titan,
    Meta,
}

impl ModelFamily {
    /// Detect the vendor family from the model id; cross-region ids carry a
    /// geo prefix (`us.anthropic...`) so matching is on the vendor segment.
    fn of(model_id: &str) -> Option<Self> {
        if model_id.contains("anthropic.") {
            Some(Self::Anthropic)
        } else if model_id.contains("amazon.titan") {
            Some(Self::Titan)
        } else if model_id.contains("meta.") {
            Some(Self::Meta)
        } else {
            None
        }
    }
}

/// Split the system prompt from the turn history, the shape Anthropic's
/// messages API expects.
fn split_system(request: &ProviderRequest) -> (Option<String>, Vec<serde_json::Value>) {
    let mut system = None;
    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => system = Some(message.content.clone()),
            role => messages.push(serde_json::json!({
                "role": role.as_str(),
                "content": [{ "type": "text", "text": message.content }],
            })),
        }
    }
    (system, messages)
}

/// Flatten the chat history into a single prompt for the completion-style
/// families (Titan, Meta).
fn flatten_messages(request: &ProviderRequest) -> String {
    let mut prompt = String::new();
    for message in &request.messages {
        let label = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Assistant:");
    prompt
}

fn family_body(family: ModelFamily, request: &ProviderRequest) -> serde_json::Value {
    match family {
        ModelFamily::Anthropic => {
            let (system, messages) = split_system(request);
            let mut body = serde_json::json!({
                "anthropic_version": "bedrock-2023-05-31",
                "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                "messages": messages,
            });
            if let Some(system) = system {
                body["system"] = serde_json::json!(system);
            }
            if let Some(t) = request.temperature {
                body["temperature"] = serde_json::json!(t);
            }
            if let Some(p) = request.top_p {
                body["top_p"] = serde_json::json!(p);
            }
            if !request.stop.is_empty() {
                body["stop_sequences"] = serde_json::json!(request.stop);
            }
            body
        }
        ModelFamily::Titan => {
            let mut config = serde_json::json!({
                "maxTokenCount": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            });
            if let Some(t) = request.temperature {
                config["temperature"] = serde_json::json!(t);
            }
            if let Some(p) = request.top_p {
                config["topP"] = serde_json::json!(p);
            }
            if !request.stop.is_empty() {
                config["stopSequences"] = serde_json::json!(request.stop);
            }
            serde_json::json!({
                "inputText": flatten_messages(request),
                "textGenerationConfig": config,
            })
        }
        ModelFamily::Meta => {
            let mut body = serde_json::json!({
                "prompt": flatten_messages(request),
                "max_gen_len": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            });
            if let Some(t) = request.temperature {
                body["temperature"] = serde_json::json!(t);
            }
            if let Some(p) = request.top_p {
                body["top_p"] = serde_json::json!(p);
            }
            body
        }
    }
}

// ---------------------------------------------------------------------------
// Family response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct TitanResponse {
    #[serde(rename = "inputTextTokenCount", default)]
    input_text_token_count: u32,
    #[serde(default)]
    results: Vec<TitanResult>,
}

#[derive(Debug, Deserialize)]
struct TitanResult {
    #[serde(rename = "tokenCount", default)]
    token_count: u32,
    #[serde(rename = "outputText", default)]
    output_text: String,
    #[serde(rename = "completionReason", default)]
    completion_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetaResponse {
    #[serde(default)]
    generation: String,
    #[serde(rename = "prompt_token_count", default)]
    prompt_token_count: u32,
    #[serde(rename = "generation_token_count", default)]
    generation_token_count: u32,
    #[serde(default)]
    stop_reason: Option<String>,
}

fn map_anthropic_stop(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCall,
        _ => FinishReason::Stop,
    }
}

fn map_titan_reason(reason: &str) -> FinishReason {
    match reason {
        "LENGTH" => FinishReason::Length,
        "CONTENT_FILTERED" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn map_meta_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct AwsBedrockProvider {
    config: AwsConfig,
    client: Client,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl AwsBedrockProvider {
    pub const NAME: &'static str = "aws";

    pub fn new(config: AwsConfig, timeouts: &TimeoutConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Internal {
                provider: Self::NAME.into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            config,
            client,
            request_timeout: Duration::from_secs(timeouts.complete_secs),
            health_timeout: Duration::from_secs(timeouts.health_secs),
        })
    }

    fn runtime_host(&self) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.config.region)
    }

    /// Sign and dispatch a POST against the Bedrock runtime. `verb` is
    /// `invoke` or `invoke-with-response-stream`; `timeout` bounds the whole
    /// exchange and must stay `None` for streaming responses.
    async fn invoke(
        &self,
        model: &str,
        verb: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ProviderError> {
        let host = self.runtime_host();
        let canonical_uri = format!("/model/{}/{verb}", encode_path_segment(model));

        let credentials = sigv4::Credentials {
            access_key_id: &self.config.access_key_id,
            secret_access_key: &self.config.secret_access_key,
        };
        let signature = sigv4::sign(
            &credentials,
            &sigv4::SigningInput {
                method: "POST",
                host: &host,
                canonical_uri: &canonical_uri,
                canonical_query: "",
                content_type: Some("application/json"),
                payload: &payload,
                region: &self.config.region,
                service: "bedrock",
                timestamp: chrono::Utc::now(),
            },
        );

        let mut builder = self
            .client
            .post(format!("https://{host}{canonical_uri}"))
            .header("content-type", "application/json")
            .header("x-amz-date", signature.amz_date)
            .header("authorization", signature.authorization)
            .body(payload);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .send()
            .await
            .map_err(|e| ProviderError::transport(Self::NAME, e))
    }

    fn parse_response(
        &self,
        family: ModelFamily,
        request: &ProviderRequest,
        body: &[u8],
    ) -> Result<CompletionResponse, ProviderError> {
        let (content, usage, finish_reason) = match family {
            ModelFamily::Anthropic => {
                let parsed: AnthropicResponse = serde_json::from_slice(body)
                    .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
                let content: String = parsed
                    .content
                    .iter()
                    .filter_map(|c| c.text.as_deref())
                    .collect();
                let usage = match &parsed.usage {
                    Some(u) => TokenUsage::reported(u.input_tokens, u.output_tokens),
                    None => TokenUsage::estimated(request.prompt_chars(), content.len()),
                };
                let reason = parsed
                    .stop_reason
                    .as_deref()
                    .map(map_anthropic_stop)
                    .unwrap_or(FinishReason::Stop);
                (content, usage, reason)
            }
            ModelFamily::Titan => {
                let parsed: TitanResponse = serde_json::from_slice(body)
                    .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
                let result = parsed.results.into_iter().next().ok_or_else(|| {
                    ProviderError::protocol(Self::NAME, "Titan response carried no results")
                })?;
                let usage = TokenUsage::reported(parsed.input_text_token_count, result.token_count);
                let reason = result
                    .completion_reason
                    .as_deref()
                    .map(map_titan_reason)
                    .unwrap_or(FinishReason::Stop);
                (result.output_text, usage, reason)
            }
            ModelFamily::Meta => {
                let parsed: MetaResponse = serde_json::from_slice(body)
                    .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
                let usage = TokenUsage::reported(
                    parsed.prompt_token_count,
                    parsed.generation_token_count,
                );
                let reason = parsed
                    .stop_reason
                    .as_deref()
                    .map(map_meta_reason)
                    .unwrap_or(FinishReason::Stop);
                (parsed.generation, usage, reason)
            }
        };

        Ok(CompletionResponse {
            content,
            provider: Self::NAME.to_string(),
            model: request.model.clone(),
            usage,
            cost_usd: 0.0,
            finish_reason,
        })
    }
}

impl AiProvider for AwsBedrockProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn complete(&self, request: &ProviderRequest) -> ProviderFuture<'_, CompletionResponse> {
        let request = request.clone();
        Box::pin(async move {
            let family = ModelFamily::of(&request.model).ok_or_else(|| {
                ProviderError::ModelNotFound {
                    provider: Self::NAME.into(),
                    model: request.model.clone(),
                }
            })?;
            let payload = serde_json::to_vec(&family_body(family, &request))
                .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
            debug!(model = %request.model, family = ?family, "aws.complete");

            let response = self.invoke(&request.model, "invoke", payload, None).await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::from_status(
                    Self::NAME,
                    &request.model,
                    status.as_u16(),
                    body,
                ));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| ProviderError::transport(Self::NAME, e))?;
            self.parse_response(family, &request, &body)
        })
    }

    fn stream(&self, request: &ProviderRequest) -> ProviderFuture<'_, ChunkStream> {
        let request = request.clone();
        Box::pin(async move {
            let family = ModelFamily::of(&request.model).ok_or_else(|| {
                ProviderError::ModelNotFound {
                    provider: Self::NAME.into(),
                    model: request.model.clone(),
                }
            })?;
            let payload = serde_json::to_vec(&family_body(family, &request))
                .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
            debug!(model = %request.model, family = ?family, "aws.stream");

            let response = self
                .invoke(&request.model, "invoke-with-response-stream", payload, None)
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::from_status(
                    Self::NAME,
                    &request.model,
                    status.as_u16(),
                    body,
                ));
            }

            Ok(bedrock_chunk_stream(
                family,
                request.model.clone(),
                request.prompt_chars(),
                response.bytes_stream(),
            ))
        })
    }

    fn embed(&self, texts: &[String], model: &str) -> ProviderFuture<'_, Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let model = if model.is_empty() {
            DEFAULT_EMBED_MODEL.to_string()
        } else {
            model.to_string()
        };
        Box::pin(async move {
            #[derive(Deserialize)]
            struct TitanEmbedding {
                embedding: Vec<f32>,
            }

            // Titan embeds one text per invocation.
            let mut embeddings = Vec::with_capacity(texts.len());
            for text in &texts {
                let payload = serde_json::to_vec(&serde_json::json!({ "inputText": text }))
                    .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
                let response = self.invoke(&model, "invoke", payload, Some(self.request_timeout)).await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::from_status(
                        Self::NAME,
                        &model,
                        status.as_u16(),
                        body,
                    ));
                }

                let parsed: TitanEmbedding = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
                embeddings.push(parsed.embedding);
            }
            Ok(embeddings)
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            if !self.is_configured() {
                return false;
            }
            // ListFoundationModels on the control plane is the cheapest
            // authenticated probe.
            let host = format!("bedrock.{}.amazonaws.com", self.config.region);
            let credentials = sigv4::Credentials {
                access_key_id: &self.config.access_key_id,
                secret_access_key: &self.config.secret_access_key,
            };
            let signature = sigv4::sign(
                &credentials,
                &sigv4::SigningInput {
                    method: "GET",
                    host: &host,
                    canonical_uri: "/foundation-models",
                    canonical_query: "",
                    content_type: None,
                    payload: b"",
                    region: &self.config.region,
                    service: "bedrock",
                    timestamp: chrono::Utc::now(),
                },
            );

            match self
                .client
                .get(format!("https://{host}/foundation-models"))
                .header("x-amz-date", signature.amz_date)
                .header("authorization", signature.authorization)
                .timeout(self.health_timeout)
                .send()
                .await
            {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

// ---------------------------------------------------------------------------
// Event-stream payload extraction
// ---------------------------------------------------------------------------

/// Pull the base64 `"bytes"` payloads out of the event-stream envelope. The
/// binary framing around them is skipped, not parsed; a partially received
/// payload stays in the buffer for the next call.
fn extract_payloads(buffer: &mut Vec<u8>) -> Vec<String> {
    const NEEDLE: &[u8] = b"\"bytes\":\"";
    let mut payloads = Vec::new();
    let mut consumed = 0;

    loop {
        let window = &buffer[consumed..];
        let Some(start) = find(window, NEEDLE) else {
            break;
        };
        let value_start = consumed + start + NEEDLE.len();
        let Some(end_offset) = buffer[value_start..].iter().position(|&b| b == b'"') else {
            // Value not fully buffered yet; keep from the needle onwards.
            consumed += start;
            break;
        };
        let encoded = &buffer[value_start..value_start + end_offset];
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) {
            payloads.push(String::from_utf8_lossy(&decoded).into_owned());
        }
        consumed = value_start + end_offset + 1;
    }

    buffer.drain(..consumed);
    payloads
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// One decoded event, normalized across model families.
#[derive(Debug)]
enum FamilyEvent {
    Delta(String),
    /// Usage update that arrives before the terminal event (Anthropic
    /// message_start / message_delta).
    Usage {
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
        stop_reason: Option<FinishReason>,
    },
    Terminal {
        reason: FinishReason,
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    },
}

fn parse_family_event(family: ModelFamily, payload: &str) -> Vec<FamilyEvent> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        debug!("Skipping unparseable Bedrock stream payload");
        return Vec::new();
    };

    match family {
        ModelFamily::Anthropic => parse_anthropic_event(&value),
        ModelFamily::Titan => parse_titan_event(&value),
        ModelFamily::Meta => parse_meta_event(&value),
    }
}

fn parse_anthropic_event(value: &serde_json::Value) -> Vec<FamilyEvent> {
    let mut events = Vec::new();
    match value.get("type").and_then(|t| t.as_str()) {
        Some("message_start") => {
            let input = value
                .pointer("/message/usage/input_tokens")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32);
            events.push(FamilyEvent::Usage {
                input_tokens: input,
                output_tokens: None,
                stop_reason: None,
            });
        }
        Some("content_block_delta") => {
            if let Some(text) = value.pointer("/delta/text").and_then(|v| v.as_str()) {
                events.push(FamilyEvent::Delta(text.to_string()));
            }
        }
        Some("message_delta") => {
            let output = value
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32);
            let stop = value
                .pointer("/delta/stop_reason")
                .and_then(|v| v.as_str())
                .map(map_anthropic_stop);
            events.push(FamilyEvent::Usage {
                input_tokens: None,
                output_tokens: output,
                stop_reason: stop,
            });
        }
        Some("message_stop") => {
            // Invocation metrics, when present, are authoritative.
            let metrics = value.get("amazon-bedrock-invocationMetrics");
            let input = metrics
                .and_then(|m| m.get("inputTokenCount"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32);
            let output = metrics
                .and_then(|m| m.get("outputTokenCount"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32);
            events.push(FamilyEvent::Terminal {
                reason: FinishReason::Stop,
                input_tokens: input,
                output_tokens: output,
            });
        }
        _ => {}
    }
    events
}

fn parse_titan_event(value: &serde_json::Value) -> Vec<FamilyEvent> {
    let mut events = Vec::new();
    if let Some(text) = value.get("outputText").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(FamilyEvent::Delta(text.to_string()));
        }
    }
    if let Some(reason) = value.get("completionReason").and_then(|v| v.as_str()) {
        let input = value
            .get("inputTextTokenCount")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let output = value
            .get("totalOutputTextTokenCount")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        events.push(FamilyEvent::Terminal {
            reason: map_titan_reason(reason),
            input_tokens: input,
            output_tokens: output,
        });
    }
    events
}

fn parse_meta_event(value: &serde_json::Value) -> Vec<FamilyEvent> {
    let mut events = Vec::new();
    if let Some(text) = value.get("generation").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(FamilyEvent::Delta(text.to_string()));
        }
    }
    if let Some(reason) = value.get("stop_reason").and_then(|v| v.as_str()) {
        let input = value
            .get("prompt_token_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let output = value
            .get("generation_token_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        events.push(FamilyEvent::Terminal {
            reason: map_meta_reason(reason),
            input_tokens: input,
            output_tokens: output,
        });
    }
    events
}

struct BedrockStreamState<S> {
    bytes: S,
    buffer: Vec<u8>,
    ready: VecDeque<StreamChunk>,
    family: ModelFamily,
    model: String,
    prompt_chars: usize,
    completion_chars: usize,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    stop_reason: Option<FinishReason>,
    finished: bool,
}

impl<S> BedrockStreamState<S> {
    fn ingest(&mut self, payload: &str) {
        for event in parse_family_event(self.family, payload) {
            if self.finished {
                return;
            }
            match event {
                FamilyEvent::Delta(text) => {
                    self.completion_chars += text.len();
                    self.ready
                        .push_back(StreamChunk::delta(AwsBedrockProvider::NAME, &self.model, text));
                }
                FamilyEvent::Usage {
                    input_tokens,
                    output_tokens,
                    stop_reason,
                } => {
                    self.input_tokens = input_tokens.or(self.input_tokens);
                    self.output_tokens = output_tokens.or(self.output_tokens);
                    self.stop_reason = stop_reason.or(self.stop_reason);
                }
                FamilyEvent::Terminal {
                    reason,
                    input_tokens,
                    output_tokens,
                } => {
                    self.finished = true;
                    let input = input_tokens.or(self.input_tokens);
                    let output = output_tokens.or(self.output_tokens);
                    let usage = match (input, output) {
                        (Some(i), Some(o)) => TokenUsage::reported(i, o),
                        _ => TokenUsage::estimated(self.prompt_chars, self.completion_chars),
                    };
                    let reason = self.stop_reason.unwrap_or(reason);
                    self.ready.push_back(StreamChunk::terminal(
                        AwsBedrockProvider::NAME,
                        &self.model,
                        Some(usage),
                        reason,
                    ));
                }
            }
        }
    }
}

fn bedrock_chunk_stream<S>(
    family: ModelFamily,
    model: String,
    prompt_chars: usize,
    bytes: S,
) -> ChunkStream
where
    S: futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
{
    let state = BedrockStreamState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        family,
        model,
        prompt_chars,
        completion_chars: 0,
        input_tokens: None,
        output_tokens: None,
        stop_reason: None,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.ready.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.finished {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.extend_from_slice(&bytes);
                    let payloads = extract_payloads(&mut st.buffer);
                    for payload in payloads {
                        st.ingest(&payload);
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((
                        Err(ProviderError::transport(AwsBedrockProvider::NAME, e)),
                        st,
                    ));
                }
                None => {
                    // Connection closed without a terminal event.
                    st.finished = true;
                    let terminal = StreamChunk::terminal(
                        AwsBedrockProvider::NAME,
                        &st.model,
                        Some(TokenUsage::estimated(st.prompt_chars, st.completion_chars)),
                        FinishReason::Error,
                    );
                    return Some((Ok(terminal), st));
                }
            }
        }
    });

    Box::pin(stream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
