use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::providers::{ApiToolCall, ChatMessage, CompletionRequest, CompletionResponse, LLMProvider};

/// One canned completion.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<(String, Value)>,
}

impl ScriptedResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            content: None,
            tool_calls: vec![(name.into(), arguments)],
        }
    }
}

/// Provider that replays a fixed response sequence. Test-only by intent.
pub struct ScriptedProvider {
    responses: Vec<ScriptedResponse>,
    cursor: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses,
            cursor: Mutex::new(0),
        }
    }

    pub fn texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(ScriptedResponse::text).collect())
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let index = {
            let mut cursor = self.cursor.lock().expect("scripted cursor poisoned");
            let index = *cursor;
            *cursor += 1;
            index
        };

        let scripted = self
            .responses
            .get(index)
            .ok_or_else(|| ProviderError::Provider(format!("no scripted response at {index}")))?;

        let mut message = match &scripted.content {
            Some(content) => ChatMessage::assistant(content.clone()),
            None => ChatMessage {
                role: crate::providers::MessageRole::Assistant,
                content: None,
                tool_call_id: None,
                tool_calls: Vec::new(),
            },
        };
        message.tool_calls = scripted
            .tool_calls
            .iter()
            .enumerate()
            .map(|(i, (name, arguments))| ApiToolCall {
                id: format!("scripted_{index}_{i}"),
                name: name.clone(),
                arguments: arguments.clone(),
            })
            .collect();

        Ok(CompletionResponse {
            message,
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
