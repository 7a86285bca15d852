//! Language model client (OpenAI-compatible chat completions).
//!
//! The client is shared across sessions; each call carries its own
//! history and cancellation token, so nothing here is session-scoped.
//! Responses stream over SSE and the accumulated text is returned whole
//! once the stream ends — the turn controller wants one reply per turn,
//! not a sentence feed.

pub mod sse;

use crate::config::LlmConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use futures_util::StreamExt;
use sse::{SseParser, is_done};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One completed user/assistant exchange.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// What the user said.
    pub user: String,
    /// What the agent answered.
    pub assistant: String,
}

/// A reply-producing language model.
///
/// Implementations must observe `cancel` promptly: an in-flight HTTP
/// call is aborted by dropping its stream when the token fires.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a reply to `user_text` given the conversation so far.
    async fn reply(
        &self,
        history: &[ChatTurn],
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// LLM backend speaking the OpenAI chat-completions protocol.
///
/// Works against any compatible server (Ollama, vLLM, llama.cpp server,
/// hosted providers).
pub struct HttpLlm {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpLlm {
    /// Create a client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| VoiceError::Pipeline(format!("LLM client init failed: {e}")))?;
        info!(
            "LLM configured: {} model={}",
            config.api_url, config.api_model
        );
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn completions_url(&self) -> String {
        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url)
            .trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }

    fn build_messages(&self, history: &[ChatTurn], user_text: &str) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(serde_json::json!({
            "role": "system",
            "content": self.config.system_prompt,
        }));

        let skip = history.len().saturating_sub(self.config.max_history_turns);
        for turn in &history[skip..] {
            messages.push(serde_json::json!({"role": "user", "content": turn.user}));
            messages.push(serde_json::json!({"role": "assistant", "content": turn.assistant}));
        }
        messages.push(serde_json::json!({"role": "user", "content": user_text}));
        messages
    }
}

#[async_trait]
impl LanguageModel for HttpLlm {
    async fn reply(
        &self,
        history: &[ChatTurn],
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.api_model,
            "messages": self.build_messages(history, user_text),
            "stream": true,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        });

        let mut request = self.client.post(self.completions_url()).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = tokio::select! {
            () = cancel.cancelled() => {
                return Err(VoiceError::Pipeline("LLM request cancelled".to_owned()));
            }
            response = request.send() => response
                .map_err(|e| VoiceError::Pipeline(format!("LLM request failed: {e}")))?,
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Pipeline(format!(
                "LLM returned {status}: {detail}"
            )));
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut reply = String::new();

        loop {
            let chunk = tokio::select! {
                // Dropping the stream aborts the in-flight connection.
                () = cancel.cancelled() => {
                    return Err(VoiceError::Pipeline("LLM stream cancelled".to_owned()));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk =
                chunk.map_err(|e| VoiceError::Pipeline(format!("LLM stream error: {e}")))?;

            for payload in parser.push(&chunk) {
                if is_done(&payload) {
                    return finish_reply(reply);
                }
                append_delta(&mut reply, &payload)?;
            }
        }

        if let Some(payload) = parser.finish()
            && !is_done(&payload)
        {
            append_delta(&mut reply, &payload)?;
        }
        finish_reply(reply)
    }
}

/// Pull the delta content out of one streamed chunk.
fn append_delta(reply: &mut String, payload: &str) -> Result<()> {
    let chunk: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| VoiceError::Pipeline(format!("LLM chunk parse error: {e}")))?;
    if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
        reply.push_str(content);
    }
    Ok(())
}

fn finish_reply(reply: String) -> Result<String> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(VoiceError::Pipeline("LLM returned an empty reply".to_owned()));
    }
    debug!("LLM reply complete ({} chars)", trimmed.len());
    Ok(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn test_llm(url: &str) -> HttpLlm {
        HttpLlm::new(&LlmConfig {
            api_url: url.to_owned(),
            max_history_turns: 2,
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn url_joins_with_and_without_v1_suffix() {
        assert_eq!(
            test_llm("http://host:1234").completions_url(),
            "http://host:1234/v1/chat/completions"
        );
        assert_eq!(
            test_llm("http://host:1234/v1").completions_url(),
            "http://host:1234/v1/chat/completions"
        );
        assert_eq!(
            test_llm("http://host:1234/").completions_url(),
            "http://host:1234/v1/chat/completions"
        );
    }

    #[test]
    fn history_is_trimmed_to_configured_turns() {
        let llm = test_llm("http://x");
        let history: Vec<ChatTurn> = (0..5)
            .map(|i| ChatTurn {
                user: format!("u{i}"),
                assistant: format!("a{i}"),
            })
            .collect();

        let messages = llm.build_messages(&history, "now");
        // system + 2 kept turns * 2 + current user
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[1]["content"], "u3");
        assert_eq!(messages[4]["content"], "a4");
        assert_eq!(messages[5]["content"], "now");
    }

    #[test]
    fn delta_extraction_tolerates_role_only_chunks() {
        let mut reply = String::new();
        append_delta(
            &mut reply,
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
        )
        .unwrap();
        append_delta(&mut reply, r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(reply, "Hi");
    }

    #[test]
    fn empty_reply_is_an_error() {
        assert!(finish_reply("   ".to_owned()).is_err());
        assert_eq!(finish_reply(" ok ".to_owned()).unwrap(), "ok");
    }
}
