//! OpenAI-compatible wire format.
//!
//! Azure OpenAI, Ollama and vLLM all speak the same chat-completions shape;
//! this module holds the request body builder, the response/chunk
//! deserialization types and the SSE-to-chunk-stream adapter those drivers
//! share. Every driver keeps its own URL scheme, auth and error mapping.

use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::providers::sse::SseEvent;
use crate::providers::{ChunkStream, ProviderError};
use crate::types::{
    CompletionResponse, FinishReason, ProviderRequest, StreamChunk, TokenUsage,
};

// ---------------------------------------------------------------------------
// Request body
// ---------------------------------------------------------------------------

/// Build an OpenAI-compatible chat-completions body. Optional sampling
/// fields are omitted rather than sent as null.
pub fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "stream": stream,
    });

    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    if !request.stop.is_empty() {
        body["stop"] = serde_json::json!(request.stop);
    }

    body
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<Delta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Embeddings {
    #[serde(default)]
    pub data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRow {
    pub embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Convert a parsed completion into the uniform response. Backends that
/// report no usage get the char/4 estimate, flagged as such.
pub fn into_response(
    provider: &'static str,
    request: &ProviderRequest,
    completion: ChatCompletion,
) -> Result<CompletionResponse, ProviderError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::protocol(provider, "response carried no choices"))?;

    let content = choice
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();

    let usage = match completion.usage {
        Some(u) => TokenUsage::reported(u.prompt_tokens, u.completion_tokens),
        None => TokenUsage::estimated(request.prompt_chars(), content.len()),
    };

    let finish_reason = choice
        .finish_reason
        .as_deref()
        .map(FinishReason::from_wire)
        .unwrap_or(FinishReason::Stop);

    Ok(CompletionResponse {
        content,
        provider: provider.to_string(),
        model: if completion.model.is_empty() {
            request.model.clone()
        } else {
            completion.model
        },
        usage,
        cost_usd: 0.0,
        finish_reason,
    })
}

// ---------------------------------------------------------------------------
// Chunk stream adapter
// ---------------------------------------------------------------------------

struct StreamState<S> {
    events: S,
    provider: &'static str,
    model: String,
    prompt_chars: usize,
    completion_chars: usize,
    finished: bool,
}

/// Adapt an SSE event stream into the uniform chunk stream.
///
/// Guarantees of the driver streaming contract are enforced here: chunks are
/// yielded in arrival order, exactly one terminal chunk carries the finish
/// reason (with backend usage when present, otherwise the running char/4
/// estimate), and a backend that closes early yields a synthesized
/// `finish_reason = error` terminal chunk.
pub fn chunk_stream<S>(
    provider: &'static str,
    model: String,
    prompt_chars: usize,
    events: S,
) -> ChunkStream
where
    S: Stream<Item = Result<SseEvent, reqwest::Error>> + Send + 'static,
{
    let state = StreamState {
        events: Box::pin(events),
        provider,
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
                    if event.data == "[DONE]" {
                        // End marker without a finish_reason chunk first.
                        st.finished = true;
                        return Some((Ok(synthesized_terminal(&st)), st));
                    }

                    let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!(
                                provider = st.provider,
                                error = %e,
                                "Skipping unparseable stream event"
                            );
                            continue;
                        }
                    };

                    let choice = chunk.choices.into_iter().next();
                    let delta = choice
                        .as_ref()
                        .and_then(|c| c.delta.as_ref())
                        .and_then(|d| d.content.clone())
                        .unwrap_or_default();
                    st.completion_chars += delta.len();

                    if let Some(reason) = choice.and_then(|c| c.finish_reason) {
                        st.finished = true;
                        let usage = chunk
                            .usage
                            .map(|u| TokenUsage::reported(u.prompt_tokens, u.completion_tokens))
                            .unwrap_or_else(|| {
                                TokenUsage::estimated(st.prompt_chars, st.completion_chars)
                            });
                        let mut terminal = StreamChunk::terminal(
                            st.provider,
                            &st.model,
                            Some(usage),
                            FinishReason::from_wire(&reason),
                        );
                        terminal.delta = delta;
                        return Some((Ok(terminal), st));
                    }

                    if delta.is_empty() {
                        // Role-only prelude chunks carry nothing to deliver.
                        continue;
                    }

                    let chunk = StreamChunk::delta(st.provider, &st.model, delta);
                    return Some((Ok(chunk), st));
                }
                Some(Err(e)) => {
                    st.finished = true;
                    let provider = st.provider;
                    return Some((Err(ProviderError::transport(provider, e)), st));
                }
                None => {
                    // Backend closed without [DONE] or a finish_reason.
                    st.finished = true;
                    return Some((Ok(synthesized_terminal(&st)), st));
                }
            }
        }
    });

    Box::pin(stream)
}

fn synthesized_terminal<S>(st: &StreamState<S>) -> StreamChunk {
    StreamChunk::terminal(
        st.provider,
        &st.model,
        Some(TokenUsage::estimated(st.prompt_chars, st.completion_chars)),
        FinishReason::Error,
    )
}
