//! OpenAI-compatible chat client.
//!
//! POSTs `{model, messages, temperature, max_tokens}` to
//! `<endpoint>/v1/chat/completions` with bearer auth. Images travel as
//! inline `data:` URIs inside the message content. No streaming; the
//! response body is read whole.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ChatClient, ChatMessage, ChatOutcome, ChatParams, ChatUsage, LlmError};
use crate::config::AppConfig;

/// Network-level retries on timeout or 5xx, with fixed backoff steps.
const MAX_RETRIES: u32 = 2;
const BACKOFF: [Duration; 2] = [Duration::from_millis(250), Duration::from_secs(1)];

pub struct OpenAiChatClient {
    http: reqwest::Client,
    chat_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatClient {
    pub fn new(config: &AppConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            chat_url: chat_url(&config.llm_endpoint),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }

    pub fn chat_endpoint(&self) -> &str {
        &self.chat_url
    }

    async fn send_once(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatOutcome, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let response = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .timeout(params.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ChatEnvelope = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;
        let text = envelope
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::ResponseParsing("empty choices array".into()))?;

        Ok(ChatOutcome {
            text,
            usage: envelope.usage,
        })
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatOutcome, LlmError> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(messages, params).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < MAX_RETRIES && is_retryable(&e) => {
                    let delay = BACKOFF[attempt as usize];
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying chat request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(error: &LlmError) -> bool {
    match error {
        LlmError::Timeout => true,
        LlmError::HttpStatus { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Derive the chat-completions URL from a configured base, tolerating
/// endpoints that already carry part of the path.
fn chat_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        return base.to_string();
    }
    if base.ends_with("/v1") || base.ends_with("/api/v1") {
        return format!("{base}/chat/completions");
    }
    format!("{base}/v1/chat/completions")
}

#[derive(Deserialize)]
struct ChatEnvelope {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}
