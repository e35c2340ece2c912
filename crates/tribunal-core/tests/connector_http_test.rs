mod common;

use common::fast_connector_cfg;
use std::sync::Arc;
use std::time::Duration;
use tribunal_core::connector::http::HttpProvider;
use tribunal_core::connector::{
    InvokeParameters, InvokeRequest, Message, ModelConnector, Provider,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn invoke_request(key: Option<&str>) -> InvokeRequest {
    InvokeRequest {
        model_id: "gpt-test".into(),
        messages: vec![Message::user("hello")],
        parameters: InvokeParameters::default(),
        timeout: Duration::from_secs(10),
        idempotency_key: key.map(String::from),
        tenant_id: "t1".into(),
    }
}

fn chat_body() -> serde_json::Value {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3}
    })
}

#[tokio::test]
async fn parses_text_and_usage_from_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body()))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(server.uri(), "sk-test");
    let resp = provider.call(&invoke_request(None)).await.unwrap();
    assert_eq!(resp.text, "hi there");
    assert_eq!(resp.usage.input_tokens, 7);
    assert_eq!(resp.usage.output_tokens, 3);
}

#[tokio::test]
async fn forwards_the_idempotency_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Idempotency-Key", "exec-1:case-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body()))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpProvider::new(server.uri(), "sk-test");
    provider
        .call(&invoke_request(Some("exec-1:case-2")))
        .await
        .unwrap();
}

struct FlakyResponder {
    failures: std::sync::atomic::AtomicUsize,
}

impl Respond for FlakyResponder {
    fn respond(&self, _req: &Request) -> ResponseTemplate {
        let n = self
            .failures
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n < 2 {
            ResponseTemplate::new(503)
        } else {
            ResponseTemplate::new(200).set_body_json(chat_body())
        }
    }
}

#[tokio::test]
async fn connector_retries_5xx_until_the_provider_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyResponder {
            failures: std::sync::atomic::AtomicUsize::new(0),
        })
        .mount(&server)
        .await;

    let provider = Arc::new(HttpProvider::new(server.uri(), "sk-test"));
    let connector = ModelConnector::new(provider, fast_connector_cfg());
    let resp = connector.invoke(invoke_request(None)).await.unwrap();
    assert_eq!(resp.text, "hi there");
    assert!(resp.latency_ms < 10_000);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = Arc::new(HttpProvider::new(server.uri(), "sk-test"));
    let connector = ModelConnector::new(provider, fast_connector_cfg());
    let err = connector.invoke(invoke_request(None)).await.unwrap_err();
    assert_eq!(err.kind(), "invalid");
}
