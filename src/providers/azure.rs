//! Azure OpenAI driver.
//!
//! Speaks the deployment-keyed chat-completions API: the model id doubles as
//! the deployment name in the URL, authentication is the `api-key` header.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::{AzureConfig, TimeoutConfig};
use crate::providers::sse::SseStream;
use crate::providers::{openai, AiProvider, ChunkStream, ProviderError, ProviderFuture};
use crate::types::{CompletionResponse, ProviderRequest};

pub struct AzureOpenAiProvider {
    config: AzureConfig,
    client: Client,
    health_timeout: Duration,
}

impl AzureOpenAiProvider {
    pub const NAME: &'static str = "azure";

    pub fn new(config: AzureConfig, timeouts: &TimeoutConfig) -> Result<Self, ProviderError> {
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
            health_timeout: Duration::from_secs(timeouts.health_secs),
        })
    }

    fn chat_url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            deployment,
            self.config.api_version
        )
    }

    /// Azure reports a prompt blocked by its content policy as a 400 whose
    /// body names the content_filter code.
    fn map_error(&self, model: &str, status: u16, body: String) -> ProviderError {
        if status == 400 && body.contains("content_filter") {
            return ProviderError::ContentFiltered {
                provider: Self::NAME.into(),
                message: body,
            };
        }
        ProviderError::from_status(Self::NAME, model, status, body)
    }
}

impl AiProvider for AzureOpenAiProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn complete(&self, request: &ProviderRequest) -> ProviderFuture<'_, CompletionResponse> {
        let request = request.clone();
        Box::pin(async move {
            let url = self.chat_url(&request.model);
            let body = openai::request_body(&request, false);
            debug!(model = %request.model, "azure.complete");

            let response = self
                .client
                .post(&url)
                .header("api-key", &self.config.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::transport(Self::NAME, e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(self.map_error(&request.model, status.as_u16(), body));
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
            let url = self.chat_url(&request.model);
            let body = openai::request_body(&request, true);
            debug!(model = %request.model, "azure.stream");

            let response = self
                .client
                .post(&url)
                .header("api-key", &self.config.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::transport(Self::NAME, e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(self.map_error(&request.model, status.as_u16(), body));
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

    fn embed(&self, _texts: &[String], _model: &str) -> ProviderFuture<'_, Vec<Vec<f32>>> {
        Box::pin(async move {
            Err(ProviderError::Unsupported {
                provider: Self::NAME.into(),
                capability: "embeddings",
            })
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            if !self.is_configured() {
                return false;
            }
            let url = format!(
                "{}/openai/models?api-version={}",
                self.config.endpoint.trim_end_matches('/'),
                self.config.api_version
            );
            match self
                .client
                .get(&url)
                .header("api-key", &self.config.api_key)
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
        // Connections belong to the pooled client and are released with it.
        Box::pin(async {})
    }
}
