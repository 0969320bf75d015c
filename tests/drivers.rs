//! HTTP contract tests for the OpenAI-compatible drivers, against a mock
//! backend.

use futures::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gantry::config::{AzureConfig, OllamaConfig, TimeoutConfig, VllmConfig};
use gantry::providers::{AzureOpenAiProvider, OllamaProvider, VllmProvider};
use gantry::{AiProvider, ChatMessage, FinishReason, ProviderRequest};

fn request(model: &str) -> ProviderRequest {
    ProviderRequest {
        messages: vec![ChatMessage::user("Hello")],
        model: model.into(),
        temperature: Some(0.7),
        max_tokens: Some(100),
        top_p: None,
        stop: vec![],
    }
}

fn chat_completion_body() -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "llama3.1:8b",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hi from the mock"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13}
    })
}

fn ollama(server: &MockServer) -> OllamaProvider {
    OllamaProvider::new(
        OllamaConfig {
            base_url: server.uri(),
            ..Default::default()
        },
        &TimeoutConfig::default(),
    )
    .unwrap()
}

fn vllm(server: &MockServer, api_key: Option<&str>) -> VllmProvider {
    VllmProvider::new(
        VllmConfig {
            base_url: server.uri(),
            api_key: api_key.map(String::from),
            model: None,
        },
        &TimeoutConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn ollama_complete_parses_openai_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "model": "llama3.1:8b",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&server)
        .await;

    let provider = ollama(&server);
    let response = provider.complete(&request("llama3.1:8b")).await.unwrap();

    assert_eq!(response.content, "Hi from the mock");
    assert_eq!(response.provider, "ollama");
    assert_eq!(response.usage.prompt_tokens, 9);
    assert!(!response.usage.estimated);
    assert_eq!(response.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn ollama_stream_parses_sse_chunks() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],",
        "\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&server)
        .await;

    let provider = ollama(&server);
    let stream = provider.stream(&request("llama3.1:8b")).await.unwrap();
    let chunks: Vec<_> = stream.collect::<Vec<_>>().await;
    let chunks: Vec<_> = chunks.into_iter().map(|c| c.unwrap()).collect();

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].delta, "Hel");
    assert_eq!(chunks[1].delta, "lo");
    assert!(chunks[2].is_terminal());
    assert_eq!(chunks[2].finish_reason, Some(FinishReason::Stop));
    assert_eq!(chunks[2].usage.unwrap().prompt_tokens, 9);
}

#[tokio::test]
async fn ollama_embed_returns_vectors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(body_partial_json(serde_json::json!({
            "model": "nomic-embed-text",
            "input": ["alpha", "beta"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": "list",
            "data": [
                {"object": "embedding", "index": 0, "embedding": [0.1, 0.2]},
                {"object": "embedding", "index": 1, "embedding": [0.3, 0.4]}
            ]
        })))
        .mount(&server)
        .await;

    let provider = ollama(&server);
    let vectors = provider
        .embed(&["alpha".into(), "beta".into()], "nomic-embed-text")
        .await
        .unwrap();

    assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
}

#[tokio::test]
async fn ollama_health_check_uses_tags_route() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
        .mount(&server)
        .await;

    assert!(ollama(&server).health_check().await);
}

#[tokio::test]
async fn ollama_health_check_false_when_unreachable() {
    let server = MockServer::start().await;
    let provider = ollama(&server);
    // Shut the mock down so the request is refused.
    drop(server);
    assert!(!provider.health_check().await);
}

#[tokio::test]
async fn vllm_sends_bearer_auth_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&server)
        .await;

    let provider = vllm(&server, Some("secret-token"));
    let response = provider.complete(&request("llama3.1:8b")).await.unwrap();
    assert_eq!(response.provider, "vllm");
}

#[tokio::test]
async fn vllm_error_mapping_follows_status() {
    for (status, kind) in [(401u16, "auth"), (404, "model_not_found"), (429, "rate_limited"), (503, "unavailable")] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_string("backend says no"))
            .mount(&server)
            .await;

        let provider = vllm(&server, None);
        let err = provider.complete(&request("llama3.1:8b")).await.unwrap_err();
        assert_eq!(err.kind(), kind, "status {status}");
    }
}

#[tokio::test]
async fn vllm_health_check_uses_health_route() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(vllm(&server, None).health_check().await);
}

#[tokio::test]
async fn azure_addresses_deployment_with_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o/chat/completions"))
        .and(query_param("api-version", "2024-12-01-preview"))
        .and(header("api-key", "azure-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&server)
        .await;

    let provider = AzureOpenAiProvider::new(
        AzureConfig {
            endpoint: server.uri(),
            api_key: "azure-key".into(),
            ..Default::default()
        },
        &TimeoutConfig::default(),
    )
    .unwrap();

    let response = provider.complete(&request("gpt-4o")).await.unwrap();
    assert_eq!(response.content, "Hi from the mock");
    assert_eq!(response.provider, "azure");
}

#[tokio::test]
async fn azure_content_filter_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"code": "content_filter", "message": "The prompt was filtered"}
        })))
        .mount(&server)
        .await;

    let provider = AzureOpenAiProvider::new(
        AzureConfig {
            endpoint: server.uri(),
            api_key: "azure-key".into(),
            ..Default::default()
        },
        &TimeoutConfig::default(),
    )
    .unwrap();

    let err = provider.complete(&request("gpt-4o")).await.unwrap_err();
    assert_eq!(err.kind(), "content_filtered");
    assert!(!err.is_transient());
}

#[tokio::test]
async fn stream_without_terminal_synthesizes_error_chunk() {
    // Backend closes after one delta, never sending finish_reason or [DONE].
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string("data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n"),
        )
        .mount(&server)
        .await;

    let provider = vllm(&server, None);
    let stream = provider.stream(&request("llama3.1:8b")).await.unwrap();
    let chunks: Vec<_> = stream.collect::<Vec<_>>().await;
    let chunks: Vec<_> = chunks.into_iter().map(|c| c.unwrap()).collect();

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].delta, "par");
    assert_eq!(chunks[1].finish_reason, Some(FinishReason::Error));
    assert!(chunks[1].usage.unwrap().estimated);
}
