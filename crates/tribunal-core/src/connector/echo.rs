use super::{InvokeRequest, InvokeResponse, Provider, TokenUsage};
use crate::errors::Result;
use async_trait::async_trait;

/// Deterministic in-process provider for local wiring and tests: echoes the
/// last user message. No network, no flakiness.
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn call(&self, req: &InvokeRequest) -> Result<InvokeResponse> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let input_tokens = req
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        let text = format!("echo: {}", last_user);
        Ok(InvokeResponse {
            usage: TokenUsage {
                input_tokens,
                output_tokens: text.split_whitespace().count() as u64,
            },
            text,
            latency_ms: 0,
        })
    }
}
