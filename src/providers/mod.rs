use async_trait::async_trait;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::env::ToolDef;
use crate::error::ProviderError;
use crate::messages::TokenUsage;

pub mod openai;
pub mod scripted;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in provider wire format (chat-completions shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ApiToolCall>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_call_id: Some(id.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ApiToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Wire-format tool call. `arguments` travels as a JSON string on the wire
/// but is kept parsed here.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl Serialize for ApiToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct Function<'a> {
            name: &'a str,
            arguments: String,
        }

        let arguments = serde_json::to_string(&self.arguments)
            .map_err(|e| serde::ser::Error::custom(e.to_string()))?;

        let mut state = serializer.serialize_struct("ApiToolCall", 3)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("type", "function")?;
        state.serialize_field(
            "function",
            &Function {
                name: &self.name,
                arguments,
            },
        )?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ApiToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawFunction {
            name: String,
            arguments: String,
        }

        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            id: Option<String>,
            #[serde(rename = "type")]
            kind: String,
            function: RawFunction,
        }

        let raw = Raw::deserialize(deserializer)?;
        if raw.kind != "function" {
            return Err(serde::de::Error::custom(format!(
                "unsupported tool call type '{}'",
                raw.kind
            )));
        }
        let arguments: Value = serde_json::from_str(&raw.function.arguments)
            .map_err(|e| serde::de::Error::custom(format!("bad tool arguments: {e}")))?;
        Ok(Self {
            id: raw.id.unwrap_or_default(),
            name: raw.function.name,
            arguments,
        })
    }
}

/// Tool definition in provider wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ApiFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

impl From<&ToolDef> for ApiTool {
    fn from(def: &ToolDef) -> Self {
        Self {
            kind: "function".to_string(),
            function: ApiFunction {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
            seed: None,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn with_tools<'a, I>(mut self, defs: I) -> Self
    where
        I: IntoIterator<Item = &'a ToolDef>,
    {
        self.tools = defs.into_iter().map(ApiTool::from).collect();
        if !self.tools.is_empty() && self.tool_choice.is_none() {
            self.tool_choice = Some("auto".to_string());
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    pub message: ChatMessage,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    fn name(&self) -> &'static str;
}
