//! Model collaborator seam and the reference OpenRouter adapter.
//!
//! The core only needs a stream of UTF-8 text fragments with an explicit
//! end; prompt assembly and transport belong to the adapter.

use crate::config::LlmConfig;
use crate::error::{Result, StreamError};
use crate::memory::types::StoredMessage;
use crate::{ChannelId, InboundMessage};
use futures::{Stream, StreamExt as _};
use std::future::Future;
use std::pin::Pin;

/// Streamed response fragments, terminated by stream end.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Everything the model collaborator gets to build a request from.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub channel: ChannelId,
    pub incoming: InboundMessage,
    /// Channel history snapshot, oldest first, not including `incoming`.
    pub history: Vec<StoredMessage>,
}

/// Static trait for model clients.
pub trait ModelClient: Send + Sync + 'static {
    /// Start a streaming completion for one inbound message.
    fn stream_actions(
        &self,
        request: ChatRequest,
    ) -> impl Future<Output = Result<TokenStream>> + Send;
}

/// Dynamic companion for `Arc<dyn ModelClientDyn>` storage.
pub trait ModelClientDyn: Send + Sync + 'static {
    fn stream_actions<'a>(
        &'a self,
        request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TokenStream>> + Send + 'a>>;
}

impl<T: ModelClient> ModelClientDyn for T {
    fn stream_actions<'a>(
        &'a self,
        request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TokenStream>> + Send + 'a>> {
        Box::pin(ModelClient::stream_actions(self, request))
    }
}

/// OpenRouter chat-completions adapter speaking the SSE line protocol:
/// `data: <json>` lines, `data: [DONE]` terminator.
pub struct OpenRouterClient {
    http: reqwest::Client,
    config: LlmConfig,
    system_prompt: String,
}

impl OpenRouterClient {
    pub fn new(config: LlmConfig, system_prompt: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            system_prompt: system_prompt.into(),
        }
    }

    /// Pack the request into the user turn as JSON: chat id, author, text,
    /// time, and the prior context.
    fn user_payload(request: &ChatRequest) -> String {
        let context: Vec<serde_json::Value> = request
            .history
            .iter()
            .map(|message| {
                serde_json::json!({
                    "author": message.author,
                    "content": message.text,
                    "timestamp": message.timestamp,
                })
            })
            .collect();
        serde_json::json!({
            "chat_id": request.channel.to_string(),
            "author": request.incoming.author,
            "content": request.incoming.text,
            "time_now": request.incoming.timestamp,
            "context": context,
        })
        .to_string()
    }
}

impl ModelClient for OpenRouterClient {
    async fn stream_actions(&self, request: ChatRequest) -> Result<TokenStream> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or_else(|| StreamError::Transport("no API key configured".into()))?;

        let body = serde_json::json!({
            "model": self.config.model.as_str(),
            "temperature": self.config.temperature,
            "stream": true,
            "messages": [
                { "role": "system", "content": self.system_prompt.as_str() },
                { "role": "user", "content": Self::user_payload(&request) },
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| StreamError::Transport(error.to_string()))?
            .error_for_status()
            .map_err(|error| StreamError::Transport(error.to_string()))?;

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut line_buf = String::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|error| StreamError::Transport(error.to_string()))?;
                line_buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = line_buf.find('\n') {
                    let line: String = line_buf.drain(..=newline).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'read;
                    }
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };
                    if let Some(content) = delta_content(&event) {
                        yield content.to_string();
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Extract the content fragment from one decoded SSE event, if any.
/// Split out for testing; the adapter inlines the same lookup.
pub fn delta_content(event: &serde_json::Value) -> Option<&str> {
    event["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|content| !content.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_content_reads_the_streaming_shape() {
        let event: serde_json::Value = serde_json::from_str(
            r#"{"choices": [{"delta": {"content": "hel"}}]}"#,
        )
        .expect("event");
        assert_eq!(delta_content(&event), Some("hel"));
    }

    #[test]
    fn delta_content_ignores_empty_and_missing() {
        let empty: serde_json::Value =
            serde_json::from_str(r#"{"choices": [{"delta": {"content": ""}}]}"#).expect("event");
        assert_eq!(delta_content(&empty), None);

        let role_only: serde_json::Value =
            serde_json::from_str(r#"{"choices": [{"delta": {"role": "assistant"}}]}"#)
                .expect("event");
        assert_eq!(delta_content(&role_only), None);
    }

    #[test]
    fn user_payload_carries_history() {
        let channel = ChannelId::new(crate::ChannelKind::Console, 0);
        let incoming = InboundMessage::now(channel, 5, "DVD", "hi there");
        let request = ChatRequest {
            channel,
            incoming: incoming.clone(),
            history: vec![StoredMessage::new(4, "Alpha", "earlier")],
        };
        let payload: serde_json::Value =
            serde_json::from_str(&OpenRouterClient::user_payload(&request)).expect("payload");
        assert_eq!(payload["author"], "DVD");
        assert_eq!(payload["context"][0]["author"], "Alpha");
        assert_eq!(payload["chat_id"], "console:0");
    }
}
