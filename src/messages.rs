use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Which participant produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Agent,
    User,
    Environment,
}

impl Sender {
    /// The conversational counterpart. Environment messages never own a turn.
    pub fn other(self) -> Sender {
        match self {
            Sender::Agent => Sender::User,
            Sender::User => Sender::Agent,
            Sender::Environment => Sender::Environment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool invocation, carried by an Environment message.
/// Domain errors travel here as `ok = false`; they are data, not failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub call_id: String,
    pub ok: bool,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One conversation unit. `content` and `tool_calls` may co-occur only in
/// lenient protocol mode; `tool_result` is set on Environment messages only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    #[serde(default)]
    pub turn: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn text(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            sender,
            turn: 0,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_result: None,
            usage: None,
        }
    }

    pub fn tool_calls(sender: Sender, calls: Vec<ToolCall>) -> Self {
        Self {
            sender,
            turn: 0,
            content: None,
            tool_calls: calls,
            tool_result: None,
            usage: None,
        }
    }

    pub fn tool_result(outcome: ToolOutcome) -> Self {
        Self {
            sender: Sender::Environment,
            turn: 0,
            content: None,
            tool_calls: Vec::new(),
            tool_result: Some(outcome),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn text_content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }

    pub fn is_text(&self) -> bool {
        self.text_content().is_some() && self.tool_calls.is_empty() && self.tool_result.is_none()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("protocol violation: {0}")]
pub struct ProtocolViolation(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Forbid text and tool calls in one message.
    pub strict_protocol: bool,
    pub max_tool_calls_per_turn: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            strict_protocol: true,
            max_tool_calls_per_turn: 1,
        }
    }
}

/// Check one actor-produced message against the protocol rules.
/// Environment messages are scheduler-produced and always pass.
pub fn validate(message: &Message, config: &ProtocolConfig) -> Result<(), ProtocolViolation> {
    if message.sender == Sender::Environment {
        return Ok(());
    }

    if message.tool_result.is_some() {
        return Err(ProtocolViolation(
            "tool results may only be sent by the environment".to_string(),
        ));
    }

    if config.strict_protocol && message.text_content().is_some() && message.has_tool_calls() {
        return Err(ProtocolViolation(
            "message mixes text and tool calls in strict mode".to_string(),
        ));
    }

    if message.tool_calls.len() > config.max_tool_calls_per_turn {
        return Err(ProtocolViolation(format!(
            "{} tool calls in one turn, limit is {}",
            message.tool_calls.len(),
            config.max_tool_calls_per_turn
        )));
    }

    if message.text_content().is_none() && message.tool_calls.is_empty() {
        return Err(ProtocolViolation("empty message".to_string()));
    }

    Ok(())
}

/// Append-only message sequence owned by one trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends and stamps the next turn index.
    pub fn push(&mut self, mut message: Message) -> &Message {
        message.turn = self.messages.len();
        self.messages.push(message);
        self.messages.last().expect("just pushed")
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Text messages spoken by the given side, in order.
    pub fn texts_from(&self, sender: Sender) -> impl Iterator<Item = &str> {
        self.messages
            .iter()
            .filter(move |m| m.sender == sender)
            .filter_map(|m| m.text_content())
    }

    /// All tool calls in transcript order.
    pub fn tool_call_sequence(&self) -> Vec<&ToolCall> {
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .collect()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        let mut conversation = Conversation::new();
        for message in messages {
            conversation.push(message);
        }
        conversation
    }
}
