//! vLLM driver.
//!
//! Same OpenAI-compatible surface as the Ollama driver, with optional bearer
//! authentication (vLLM deployments behind a reverse proxy usually require
//! it) and vLLM's own `/health` probe endpoint.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use tracing::debug;

use crate::config::{TimeoutConfig, VllmConfig};
use crate::providers::sse::SseStream;
use crate::providers::{openai, AiProvider, ChunkStream, ProviderError, ProviderFuture};
use crate::types::{CompletionResponse, ProviderRequest};

pub struct VllmProvider {
    config: VllmConfig,
    client: Client,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl VllmProvider {
    pub const NAME: &'static str = "vllm";

    pub fn new(config: VllmConfig, timeouts: &TimeoutConfig) -> Result<Self, ProviderError> {
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

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

impl AiProvider for VllmProvider {
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
            debug!(model = %request.model, "vllm.complete");

            let response = self
                .authed(self.client.post(self.url("/v1/chat/completions")))
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
            debug!(model = %request.model, "vllm.stream");

            let response = self
                .authed(self.client.post(self.url("/v1/chat/completions")))
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
                .authed(self.client.post(self.url("/v1/embeddings")))
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
                .authed(self.client.get(self.url("/health")))
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
    fn test_url_and_name() {
        let provider = VllmProvider::new(
            VllmConfig {
                base_url: "http://gpu-box:8000".into(),
                ..Default::default()
            },
            &TimeoutConfig::default(),
        )
        .unwrap();
        assert_eq!(provider.url("/health"), "http://gpu-box:8000/health");
        assert_eq!(provider.name(), "vllm");
        assert!(provider.is_configured());
    }
}
