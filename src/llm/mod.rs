pub mod client;
pub mod prompts;

pub use client::OpenAiChatClient;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Maximum images attached to a single chat call.
pub const MAX_IMAGES_PER_CALL: usize = 8;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Chat request timed out")]
    Timeout,

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Upstream returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Malformed chat response: {0}")]
    ResponseParsing(String),
}

/// One chat turn. Content is a sequence of interleaved parts so that
/// image payloads ride next to instruction text.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self { role: "user", content: parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::text(text)])
    }

    /// Whether any part of this message carries an image payload.
    pub fn has_images(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::ImageUrl { .. }))
    }
}

/// OpenAI-style content part: text, or an inline data-URI image.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Encode raw image bytes as an inline `data:` URI part.
    pub fn image(mime: &str, bytes: &[u8]) -> Self {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{mime};base64,{encoded}"),
            },
        }
    }
}

/// Per-call parameters. Extraction always runs at temperature 0.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 2500,
            timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: Option<ChatUsage>,
}

/// Chat completion seam. `OpenAiChatClient` talks to the real endpoint;
/// `ScriptedChatClient` replays canned responses in tests.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatOutcome, LlmError>;
}

/// Record of one call made against the scripted client.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub text: String,
    pub image_count: usize,
}

/// Test double that replays a fixed sequence of responses and records
/// what was asked of it.
pub struct ScriptedChatClient {
    responses: Mutex<std::collections::VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedChatClient {
    pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(responses: &[&str]) -> Self {
        Self::new(responses.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> Result<ChatOutcome, LlmError> {
        let text = messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        let image_count = messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
            .count();
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall { text, image_count });

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(ChatOutcome { text, usage: None }),
            Some(Err(e)) => Err(e),
            None => Err(LlmError::Transport("script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_part_builds_data_uri() {
        let part = ContentPart::image("image/png", b"abc");
        match part {
            ContentPart::ImageUrl { image_url } => {
                assert!(image_url.url.starts_with("data:image/png;base64,"));
                assert!(image_url.url.ends_with("YWJj"));
            }
            _ => panic!("expected image part"),
        }
    }

    #[test]
    fn message_reports_image_presence() {
        let plain = ChatMessage::user_text("hello");
        assert!(!plain.has_images());
        let mixed = ChatMessage::user(vec![
            ContentPart::text("look"),
            ContentPart::image("image/jpeg", b"x"),
        ]);
        assert!(mixed.has_images());
    }

    #[test]
    fn content_part_serializes_to_openai_shape() {
        let json = serde_json::to_value(ContentPart::text("hi")).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");

        let json = serde_json::to_value(ContentPart::image("image/png", b"z")).unwrap();
        assert_eq!(json["type"], "image_url");
        assert!(json["image_url"]["url"].as_str().unwrap().starts_with("data:"));
    }

    #[tokio::test]
    async fn scripted_client_replays_in_order() {
        let client = ScriptedChatClient::replying(&["first", "second"]);
        let params = ChatParams::default();
        let msg = [ChatMessage::user_text("q")];
        assert_eq!(client.chat(&msg, &params).await.unwrap().text, "first");
        assert_eq!(client.chat(&msg, &params).await.unwrap().text, "second");
        assert!(client.chat(&msg, &params).await.is_err());
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn scripted_client_records_image_counts() {
        let client = ScriptedChatClient::replying(&["ok"]);
        let msg = [ChatMessage::user(vec![
            ContentPart::text("classify"),
            ContentPart::image("image/png", b"a"),
            ContentPart::image("image/png", b"b"),
        ])];
        client.chat(&msg, &ChatParams::default()).await.unwrap();
        assert_eq!(client.calls()[0].image_count, 2);
        assert!(client.calls()[0].text.contains("classify"));
    }
}
