//! GCP Vertex AI driver.
//!
//! Speaks the generative-model REST surface: `:generateContent` for
//! completions, `:streamGenerateContent?alt=sse` for streaming and
//! `:predict` on a text-embedding publisher model for embeddings. Vertex
//! uses a distinct chat-history shape (`user`/`model` roles with a separate
//! `systemInstruction`), so this driver does its own conversion instead of
//! sharing the OpenAI wire module.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::{GcpConfig, TimeoutConfig};
use crate::providers::sse::{SseEvent, SseStream};
use crate::providers::{AiProvider, ChunkStream, ProviderError, ProviderFuture};
use crate::types::{
    CompletionResponse, FinishReason, ProviderRequest, Role, StreamChunk, TokenUsage,
};

/// Embedding model used when the caller passes an empty model id.
const DEFAULT_EMBED_MODEL: &str = "text-embedding-005";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason", default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    embeddings: PredictionEmbeddings,
}

#[derive(Debug, Deserialize)]
struct PredictionEmbeddings {
    values: Vec<f32>,
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        "STOP" => FinishReason::Stop,
        _ => FinishReason::Stop,
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct GcpVertexProvider {
    config: GcpConfig,
    client: Client,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl GcpVertexProvider {
    pub const NAME: &'static str = "gcp";

    pub fn new(config: GcpConfig, timeouts: &TimeoutConfig) -> Result<Self, ProviderError> {
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

    fn model_url(&self, model: &str, verb: &str) -> String {
        format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/google/models/{model}:{verb}",
            loc = self.config.location,
            project = self.config.project_id,
            model = model,
        )
    }

    /// Vertex separates the system instruction from the turn history and
    /// names the assistant role `model`.
    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut system_instruction: Option<String> = None;
        let mut contents = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system_instruction = Some(message.content.clone()),
                Role::User => contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{ "text": message.content }],
                })),
                Role::Assistant => contents.push(serde_json::json!({
                    "role": "model",
                    "parts": [{ "text": message.content }],
                })),
            }
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation_config.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(m) = request.max_tokens {
            generation_config.insert("maxOutputTokens".into(), serde_json::json!(m));
        }
        if let Some(p) = request.top_p {
            generation_config.insert("topP".into(), serde_json::json!(p));
        }
        if !request.stop.is_empty() {
            generation_config.insert("stopSequences".into(), serde_json::json!(request.stop));
        }

        let mut body = serde_json::json!({ "contents": contents });
        if let Some(system) = system_instruction {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation_config);
        }
        body
    }

    fn candidate_text(response: &GenerateResponse) -> String {
        response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

impl AiProvider for GcpVertexProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn complete(&self, request: &ProviderRequest) -> ProviderFuture<'_, CompletionResponse> {
        let request = request.clone();
        Box::pin(async move {
            let url = self.model_url(&request.model, "generateContent");
            let body = Self::request_body(&request);
            debug!(model = %request.model, "gcp.complete");

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.access_token)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::transport(Self::NAME, e))?;

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

            let generated: GenerateResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;

            if let Some(reason) = generated
                .prompt_feedback
                .as_ref()
                .and_then(|f| f.block_reason.as_deref())
            {
                return Err(ProviderError::ContentFiltered {
                    provider: Self::NAME.into(),
                    message: format!("prompt blocked: {reason}"),
                });
            }

            let content = Self::candidate_text(&generated);
            let finish_reason = generated
                .candidates
                .first()
                .and_then(|c| c.finish_reason.as_deref())
                .map(map_finish_reason)
                .unwrap_or(FinishReason::Stop);

            let usage = match &generated.usage_metadata {
                Some(meta) => {
                    TokenUsage::reported(meta.prompt_token_count, meta.candidates_token_count)
                }
                None => TokenUsage::estimated(request.prompt_chars(), content.len()),
            };

            Ok(CompletionResponse {
                content,
                provider: Self::NAME.to_string(),
                model: request.model.clone(),
                usage,
                cost_usd: 0.0,
                finish_reason,
            })
        })
    }

    fn stream(&self, request: &ProviderRequest) -> ProviderFuture<'_, ChunkStream> {
        let request = request.clone();
        Box::pin(async move {
            let url = format!(
                "{}?alt=sse",
                self.model_url(&request.model, "streamGenerateContent")
            );
            let body = Self::request_body(&request);
            debug!(model = %request.model, "gcp.stream");

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.access_token)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::transport(Self::NAME, e))?;

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

            let events = SseStream::new(response.bytes_stream());
            Ok(vertex_chunk_stream(
                request.model.clone(),
                request.prompt_chars(),
                events,
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
            let url = self.model_url(&model, "predict");
            let instances: Vec<serde_json::Value> = texts
                .iter()
                .map(|t| serde_json::json!({ "content": t }))
                .collect();

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.access_token)
                .json(&serde_json::json!({ "instances": instances }))
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(|e| ProviderError::transport(Self::NAME, e))?;

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

            let predictions: PredictResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
            Ok(predictions
                .predictions
                .into_iter()
                .map(|p| p.embeddings.values)
                .collect())
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            if !self.is_configured() {
                return false;
            }
            // countTokens is the cheapest authenticated call on the model.
            let model = self
                .config
                .sota_model
                .as_deref()
                .unwrap_or("gemini-1.5-flash");
            let url = self.model_url(model, "countTokens");
            let body = serde_json::json!({
                "contents": [{ "role": "user", "parts": [{ "text": "ping" }] }]
            });
            match self
                .client
                .post(&url)
                .bearer_auth(&self.config.access_token)
                .json(&body)
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
// Stream adapter
// ---------------------------------------------------------------------------

struct VertexStreamState<S> {
    events: S,
    model: String,
    prompt_chars: usize,
    completion_chars: usize,
    finished: bool,
}

fn vertex_chunk_stream<S>(model: String, prompt_chars: usize, events: S) -> ChunkStream
where
    S: futures::Stream<Item = Result<SseEvent, reqwest::Error>> + Send + 'static,
{
    let state = VertexStreamState {
        events: Box::pin(events),
        model,
        prompt_chars,
        completion_chars: 0,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }

        loop {
            match st.events.next().await {
                Some(Ok(event)) => {
                    let response: GenerateResponse = match serde_json::from_str(&event.data) {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "Skipping unparseable Vertex stream event");
                            continue;
                        }
                    };

                    let delta = GcpVertexProvider::candidate_text(&response);
                    st.completion_chars += delta.len();

                    let finish_reason = response
                        .candidates
                        .first()
                        .and_then(|c| c.finish_reason.as_deref())
                        .map(map_finish_reason);

                    if let Some(reason) = finish_reason {
                        st.finished = true;
                        let usage = match &response.usage_metadata {
                            Some(meta) => TokenUsage::reported(
                                meta.prompt_token_count,
                                meta.candidates_token_count,
                            ),
                            None => TokenUsage::estimated(st.prompt_chars, st.completion_chars),
                        };
                        let mut terminal = StreamChunk::terminal(
                            GcpVertexProvider::NAME,
                            &st.model,
                            Some(usage),
                            reason,
                        );
                        terminal.delta = delta;
                        return Some((Ok(terminal), st));
                    }

                    if delta.is_empty() {
                        continue;
                    }

                    let chunk = StreamChunk::delta(GcpVertexProvider::NAME, &st.model, delta);
                    return Some((Ok(chunk), st));
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(ProviderError::transport(GcpVertexProvider::NAME, e)), st));
                }
                None => {
                    st.finished = true;
                    let terminal = StreamChunk::terminal(
                        GcpVertexProvider::NAME,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use futures::stream;

    fn request() -> ProviderRequest {
        ProviderRequest {
            messages: vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("hello"),
                ChatMessage::assistant("hi"),
                ChatMessage::user("bye"),
            ],
            model: "gemini-1.5-pro".into(),
            temperature: Some(0.3),
            max_tokens: Some(64),
            top_p: None,
            stop: vec![],
        }
    }

    #[test]
    fn test_request_body_separates_system_and_maps_roles() {
        let body = GcpVertexProvider::request_body(&request());
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "be terse"
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
    }

    #[test]
    fn test_model_url_shape() {
        let provider = GcpVertexProvider::new(
            GcpConfig {
                project_id: "acme-risk".into(),
                access_token: "token".into(),
                ..Default::default()
            },
            &TimeoutConfig::default(),
        )
        .unwrap();
        assert_eq!(
            provider.model_url("gemini-1.5-pro", "generateContent"),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/acme-risk/locations/us-central1/publishers/google/models/gemini-1.5-pro:generateContent"
        );
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP"), FinishReason::Stop);
        assert_eq!(map_finish_reason("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(map_finish_reason("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(map_finish_reason("RECITATION"), FinishReason::ContentFilter);
        assert_eq!(map_finish_reason("OTHER"), FinishReason::Stop);
    }

    fn sse_events(data: Vec<&str>) -> impl futures::Stream<Item = Result<SseEvent, reqwest::Error>> + Unpin
    {
        stream::iter(
            data.into_iter()
                .map(|d| {
                    Ok(SseEvent {
                        event: None,
                        data: d.to_string(),
                    })
                })
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_vertex_stream_terminal_carries_usage() {
        let events = sse_events(vec![
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#,
        ]);

        let chunks: Vec<_> = vertex_chunk_stream("gemini-1.5-pro".into(), 12, events)
            .collect::<Vec<_>>()
            .await;
        let chunks: Vec<_> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].delta, "Hel");
        assert!(chunks[1].is_terminal());
        assert_eq!(chunks[1].delta, "lo");
        let usage = chunks[1].usage.unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert!(!usage.estimated);
    }

    #[tokio::test]
    async fn test_vertex_stream_early_close_synthesizes_error() {
        let events = sse_events(vec![
            r#"{"candidates":[{"content":{"parts":[{"text":"partial"}]}}]}"#,
        ]);

        let chunks: Vec<_> = vertex_chunk_stream("gemini-1.5-flash".into(), 4, events)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(chunks.len(), 2);
        let terminal = chunks[1].as_ref().unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::Error));
        assert!(terminal.usage.unwrap().estimated);
    }
}
