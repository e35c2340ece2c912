use super::{InvokeRequest, InvokeResponse, Provider, TokenUsage};
use crate::errors::{CoreError, Result};
use async_trait::async_trait;
use serde_json::json;

/// Chat-completions style HTTP provider. The endpoint shape follows the
/// common `/chat/completions` contract; the wire choice beyond that is the
/// provider's concern, not the core's.
pub struct HttpProvider {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports_idempotency(&self) -> bool {
        true
    }

    async fn call(&self, req: &InvokeRequest) -> Result<InvokeResponse> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let body = json!({
            "model": req.model_id,
            "messages": req.messages,
            "temperature": req.parameters.temperature,
            "max_tokens": req.parameters.max_tokens,
        });

        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(key) = &req.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let resp = builder.send().await.map_err(classify_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Transport(format!("malformed provider response: {}", e)))?;

        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Transport("provider response missing content".into()))?
            .to_string();

        let usage = TokenUsage {
            input_tokens: payload
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: payload
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };

        Ok(InvokeResponse {
            text,
            usage,
            latency_ms: 0,
        })
    }
}

fn classify_reqwest(e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::Timeout(e.to_string())
    } else {
        CoreError::Transport(e.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, detail: &str) -> CoreError {
    let trimmed: String = detail.chars().take(200).collect();
    match status.as_u16() {
        429 => CoreError::RateLimited(trimmed),
        401 | 403 => CoreError::Forbidden(format!("provider auth failed: {}", trimmed)),
        400 | 404 | 422 => CoreError::Invalid(format!("provider rejected request: {}", trimmed)),
        408 => CoreError::Timeout(trimmed),
        _ => CoreError::Transport(format!("provider returned {}: {}", status, trimmed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down").kind(),
            "rate_limited"
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED, "bad key").kind(),
            "forbidden"
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_REQUEST, "no model").kind(),
            "invalid"
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY, "upstream").kind(),
            "transport"
        );
    }
}
