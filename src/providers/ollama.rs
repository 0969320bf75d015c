//! Ollama driver.
//!
//! Talks to a local Ollama server over its OpenAI-compatible routes. Always
//! counts as configured (the endpoint has a default); the health check tells
//! the truth about reachability.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::{OllamaConfig, TimeoutConfig};
use crate::providers::sse::SseStream;
use crate::providers::{openai, AiProvider, ChunkStream, ProviderError, ProviderFuture};
use crate::types::{CompletionResponse, ProviderRequest};

pub struct OllamaProvider {
    config: OllamaConfig,
    client: Client,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl OllamaProvider {
    pub const NAME: &'static str = "ollama";

    pub fn new(config: OllamaConfig, timeouts: &TimeoutConfig) -> Result<Self, ProviderError> {
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

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }
}

impl AiProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    fn complete(&self, request: &ProviderRequest) -> ProviderFuture<'_, CompletionResponse> {
        let request = request.clone();
        Box::pin(async move {
            let body = openai::request_body(&request, false);
            debug!(model = %request.model, "ollama.complete");

            let response = self
                .client
                .post(self.url("/v1/chat/completions"))
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

            let completion: openai::ChatCompletion = response
                .json()
                .await
                .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
            openai::into_response(Self::NAME, &request, completion)
        })
    }

    fn stream(&self, request: &ProviderRequest) -> ProviderFuture<'_, ChunkStream> {
        let request = request.clone();
        Box::pin(async move {
            let body = openai::request_body(&request, true);
            debug!(model = %request.model, "ollama.stream");

            let response = self
                .client
                .post(self.url("/v1/chat/completions"))
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
            Ok(openai::chunk_stream(
                Self::NAME,
                request.model.clone(),
                request.prompt_chars(),
                events,
            ))
        })
    }

    fn embed(&self, texts: &[String], model: &str) -> ProviderFuture<'_, Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let model = model.to_string();
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/v1/embeddings"))
                .json(&serde_json::json!({ "model": model, "input": texts }))
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

            let embeddings: openai::Embeddings = response
                .json()
                .await
                .map_err(|e| ProviderError::protocol(Self::NAME, e.to_string()))?;
            Ok(embeddings.data.into_iter().map(|r| r.embedding).collect())
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self
                .client
                .get(self.url("/api/tags"))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let provider = OllamaProvider::new(
            OllamaConfig {
                base_url: "http://localhost:11434/".into(),
                ..Default::default()
            },
            &TimeoutConfig::default(),
        )
        .unwrap();
        assert_eq!(
            provider.url("/v1/chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_default_config_is_configured() {
        let provider =
            OllamaProvider::new(OllamaConfig::default(), &TimeoutConfig::default()).unwrap();
        assert!(provider.is_configured());
        assert_eq!(provider.name(), "ollama");
    }
}
