//! Scripted provider for tests.
//!
//! Responses are queued ahead of time and popped per `chat` call; every
//! request is recorded for assertions. An empty queue echoes the last user
//! message, which keeps single-turn tests terse.

use std::collections::VecDeque;

use parking_lot::Mutex;

use casc_domain::error::{Error, Result};
use casc_domain::message::{Role, ToolCall, Usage};

use crate::traits::{ChatRequest, ChatResponse, ModelProvider};

enum Scripted {
    Response(ChatResponse),
    TransientError(String),
    PermanentError(String),
}

pub struct ScriptedProvider {
    provider_id: String,
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn response(&self, content: &str, tool_calls: Vec<ToolCall>, usage: Usage) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            tool_calls,
            reasoning: None,
            usage: Some(usage),
            model: format!("{}/scripted", self.provider_id),
            finish_reason: Some("stop".into()),
        }
    }

    /// Queue a plain text response.
    pub fn push_text(&self, content: &str, usage: Usage) {
        self.script
            .lock()
            .push_back(Scripted::Response(self.response(content, Vec::new(), usage)));
    }

    /// Queue a response that invokes tools (with optional leading text).
    pub fn push_tool_calls(&self, content: &str, tool_calls: Vec<ToolCall>, usage: Usage) {
        self.script
            .lock()
            .push_back(Scripted::Response(self.response(content, tool_calls, usage)));
    }

    /// Queue a full response (reasoning, custom finish reason, ...).
    pub fn push_response(&self, response: ChatResponse) {
        self.script.lock().push_back(Scripted::Response(response));
    }

    pub fn push_transient_error(&self, message: &str) {
        self.script
            .lock()
            .push_back(Scripted::TransientError(message.to_string()));
    }

    pub fn push_permanent_error(&self, message: &str) {
        self.script
            .lock()
            .push_back(Scripted::PermanentError(message.to_string()));
    }

    /// Requests seen so far.
    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn echo_last_user(&self, req: &ChatRequest) -> ChatResponse {
        let text = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.extract_all_text())
            .unwrap_or_default();
        self.response(
            &text,
            Vec::new(),
            Usage {
                tokens_in: req
                    .messages
                    .iter()
                    .map(|m| casc_domain::message::estimate_tokens(&m.content.extract_all_text()))
                    .sum(),
                tokens_out: casc_domain::message::estimate_tokens(&text),
                cost: 0.0,
            },
        )
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.calls.lock().push(req.clone());
        match self.script.lock().pop_front() {
            Some(Scripted::Response(mut response)) => {
                if let Some(model) = &req.model {
                    response.model = model.clone();
                }
                Ok(response)
            }
            Some(Scripted::TransientError(msg)) => Err(Error::ProviderTransient(msg)),
            Some(Scripted::PermanentError(msg)) => Err(Error::ProviderPermanent(msg)),
            None => Ok(self.echo_last_user(&req)),
        }
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casc_domain::message::{Message, MessageContent};

    fn req(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripted_responses_pop_in_order() {
        let provider = ScriptedProvider::new("mock");
        provider.push_text("first", Usage::default());
        provider.push_text("second", Usage::default());

        assert_eq!(provider.chat(req("a")).await.unwrap().content, "first");
        assert_eq!(provider.chat(req("b")).await.unwrap().content, "second");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_script_echoes_user() {
        let provider = ScriptedProvider::new("mock");
        let response = provider.chat(req("hello there")).await.unwrap();
        assert_eq!(response.content, "hello there");
        assert!(response.usage.unwrap().tokens_out > 0);
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let provider = ScriptedProvider::new("mock");
        provider.push_transient_error("503");
        provider.push_permanent_error("401");
        assert!(provider.chat(req("x")).await.unwrap_err().is_retryable());
        assert!(!provider.chat(req("x")).await.unwrap_err().is_retryable());
    }

    #[test]
    fn message_content_text_helper() {
        let msg = Message::assistant("text body");
        assert!(matches!(msg.content, MessageContent::Text(_)));
    }
}
