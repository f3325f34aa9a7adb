//! LLM integration.
//!
//! The pipeline talks to a single [`LlmProvider`] trait; the concrete
//! implementation speaks the OpenAI-compatible chat completions API. Stages
//! that need structured output go through [`complete_json`], which constrains
//! the model to a JSON object and parses the reply.

mod chat_api;

pub use chat_api::ChatApiProvider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::LlmConfig;
use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Constrain the reply to a single JSON object.
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
            json_output: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Create the LLM provider from configuration.
pub fn create_llm_provider(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    Arc::new(ChatApiProvider::new(config.clone()))
}

/// Run a JSON-constrained completion and parse the reply into `T`.
///
/// Models occasionally wrap JSON in a markdown fence despite instructions;
/// the fence is stripped before parsing.
pub async fn complete_json<T: DeserializeOwned>(
    llm: &dyn LlmProvider,
    request: CompletionRequest,
) -> Result<T, LlmError> {
    let response = llm.complete(request.json()).await?;
    let content = strip_code_fence(&response.content);
    serde_json::from_str(content).map_err(|e| LlmError::InvalidResponse {
        provider: "chat_api".to_string(),
        reason: format!("schema mismatch: {e}"),
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim().strip_suffix("```").unwrap_or(inner).trim()
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Probe {
        route: String,
    }

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), r#"{"a":1}"#);
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), r#"{"a":1}"#);
        assert_eq!(strip_code_fence("  {\"a\":1}  "), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_complete_json_parses() {
        let llm = testing::ScriptedLlm::replying(&[r#"{"route":"CONTINUE"}"#]);
        let probe: Probe = complete_json(&llm, CompletionRequest::new(vec![ChatMessage::user("x")]))
            .await
            .unwrap();
        assert_eq!(probe.route, "CONTINUE");
    }

    #[tokio::test]
    async fn test_complete_json_rejects_garbage() {
        let llm = testing::ScriptedLlm::replying(&["not json"]);
        let result: Result<Probe, _> =
            complete_json(&llm, CompletionRequest::new(vec![ChatMessage::user("x")])).await;
        assert!(matches!(result, Err(LlmError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_scripted_llm_records_prompts() {
        let llm = testing::ScriptedLlm::replying(&["ok"]);
        llm.complete(CompletionRequest::new(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hello"),
        ]))
        .await
        .unwrap();
        assert_eq!(llm.call_count(), 1);
        assert!(llm.prompts.lock().unwrap()[0].contains("hello"));
    }
}
