use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::env::{EnvironmentState, ToolDef};
use crate::error::{ActorError, ConfigError};
use crate::messages::{Conversation, Message, Sender, TokenUsage, ToolCall};
use crate::providers::{ChatMessage, CompletionRequest, CompletionResponse, LLMProvider};
use crate::providers::scripted::ScriptedResponse;

/// Sampling configuration; part of the cache fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: Some(0.0),
            top_p: None,
            max_tokens: None,
            seed: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Read-only slice of the environment handed to an actor for one turn.
pub struct EnvView<'a> {
    pub state: &'a EnvironmentState,
    pub tools: Vec<&'a ToolDef>,
}

/// A conversation participant: given the history so far, produce the next
/// message set. Implementations must be stateless over the conversation so
/// that identical input reproduces cacheable output.
#[async_trait]
pub trait Actor: Send + Sync {
    fn id(&self) -> &str;

    /// Which side of the conversation this actor speaks for.
    fn side(&self) -> Sender;

    fn sampling(&self) -> &SamplingParams;

    async fn next_messages(
        &self,
        conversation: &Conversation,
        view: &EnvView<'_>,
    ) -> Result<Vec<Message>, ActorError>;
}

/// End-of-conversation markers emitted inside Text messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Stop,
    Transfer,
}

static RE_STOP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)###\s*STOP\s*###").unwrap());
static RE_TRANSFER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)###\s*TRANSFER\s*###").unwrap());

pub fn termination_signal(text: &str) -> Option<Signal> {
    if RE_STOP.is_match(text) {
        Some(Signal::Stop)
    } else if RE_TRANSFER.is_match(text) {
        Some(Signal::Transfer)
    } else {
        None
    }
}

const AGENT_PROMPT: &str = "\
You are a customer service agent for {{domain}}. Help the current user within the policy below.
Use the available tools to look up and modify records. Never invent tool results.

<policy>
{{policy}}
</policy>

If the request cannot be handled under policy, explain why and do not take the action.
If the conversation requires a human specialist, reply with ###TRANSFER###.";

const USER_PROMPT: &str = "\
You are role-playing a customer contacting a {{domain}} service agent.

Persona: {{persona}}
Scenario: {{scenario}}

Stay in character and pursue the scenario step by step; do not volunteer everything at once.
Once your request has been fully handled (or clearly refused), reply with ###STOP###.";

fn render_prompt(template: &str, data: &serde_json::Value) -> Result<String, ConfigError> {
    let hb = Handlebars::new();
    Ok(hb.render_template(template, data)?)
}

/// LLM-backed participant. The same type plays both sides: the agent sees
/// the domain tools and the policy document, the user simulator sees only
/// the text exchange with roles flipped.
pub struct LlmActor {
    id: String,
    side: Sender,
    provider: Arc<dyn LLMProvider>,
    sampling: SamplingParams,
    system_prompt: String,
}

impl LlmActor {
    pub fn agent(
        provider: Arc<dyn LLMProvider>,
        sampling: SamplingParams,
        domain_name: &str,
        policy: &str,
    ) -> Result<Self, ConfigError> {
        let system_prompt = render_prompt(
            AGENT_PROMPT,
            &json!({"domain": domain_name, "policy": policy}),
        )?;
        Ok(Self {
            id: "agent".to_string(),
            side: Sender::Agent,
            provider,
            sampling,
            system_prompt,
        })
    }

    pub fn user(
        provider: Arc<dyn LLMProvider>,
        sampling: SamplingParams,
        domain_name: &str,
        persona: &str,
        scenario: &str,
    ) -> Result<Self, ConfigError> {
        let system_prompt = render_prompt(
            USER_PROMPT,
            &json!({"domain": domain_name, "persona": persona, "scenario": scenario}),
        )?;
        Ok(Self {
            id: "user".to_string(),
            side: Sender::User,
            provider,
            sampling,
            system_prompt,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    fn to_provider_messages(&self, conversation: &Conversation) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];

        for message in conversation.iter() {
            match message.sender {
                s if s == self.side => {
                    let mut out = match &message.content {
                        Some(content) => ChatMessage::assistant(content.clone()),
                        None => ChatMessage {
                            role: crate::providers::MessageRole::Assistant,
                            content: None,
                            tool_call_id: None,
                            tool_calls: Vec::new(),
                        },
                    };
                    if self.side == Sender::Agent {
                        out.tool_calls = message
                            .tool_calls
                            .iter()
                            .map(|call| crate::providers::ApiToolCall {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            })
                            .collect();
                    }
                    if out.content.is_some() || !out.tool_calls.is_empty() {
                        messages.push(out);
                    }
                }
                Sender::Environment => {
                    // Tool traffic is visible to the agent only.
                    if self.side == Sender::Agent {
                        if let Some(outcome) = &message.tool_result {
                            let content = if outcome.ok {
                                outcome.payload.to_string()
                            } else {
                                json!({"error": outcome.payload}).to_string()
                            };
                            messages.push(ChatMessage::tool(outcome.call_id.clone(), content));
                        }
                    }
                }
                _ => {
                    if let Some(text) = message.text_content() {
                        messages.push(ChatMessage::user(text.to_string()));
                    }
                }
            }
        }

        messages
    }

    fn response_to_message(&self, response: CompletionResponse) -> Result<Message, ActorError> {
        let content = response
            .message
            .content
            .filter(|c| !c.trim().is_empty());
        let tool_calls: Vec<ToolCall> = if self.side == Sender::Agent {
            response
                .message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall::new(call.id, call.name, call.arguments))
                .collect()
        } else {
            Vec::new()
        };

        if content.is_none() && tool_calls.is_empty() {
            return Err(ActorError::Malformed(
                "provider returned neither text nor tool calls".to_string(),
            ));
        }

        let mut message = Message {
            sender: self.side,
            turn: 0,
            content,
            tool_calls,
            tool_result: None,
            usage: None,
        };
        if let Some(usage) = response.usage {
            message.usage = Some(TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            });
        }
        Ok(message)
    }
}

#[async_trait]
impl Actor for LlmActor {
    fn id(&self) -> &str {
        &self.id
    }

    fn side(&self) -> Sender {
        self.side
    }

    fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    async fn next_messages(
        &self,
        conversation: &Conversation,
        view: &EnvView<'_>,
    ) -> Result<Vec<Message>, ActorError> {
        let mut request =
            CompletionRequest::new(self.sampling.model.clone(), self.to_provider_messages(conversation));
        request.temperature = self.sampling.temperature;
        request.top_p = self.sampling.top_p;
        request.max_tokens = self.sampling.max_tokens;
        request.seed = self.sampling.seed;
        if self.side == Sender::Agent {
            request = request.with_tools(view.tools.iter().copied());
        }

        let response = self.provider.complete(request).await?;
        Ok(vec![self.response_to_message(response)?])
    }
}

/// Deterministic actor for tests and replay fixtures. The next response is
/// selected by how many messages this side has already produced, so the
/// actor carries no cursor and behaves identically under concurrency.
pub struct ScriptedActor {
    id: String,
    side: Sender,
    sampling: SamplingParams,
    script: Vec<ScriptedResponse>,
}

impl ScriptedActor {
    pub fn new(side: Sender, script: Vec<ScriptedResponse>) -> Self {
        let id = match side {
            Sender::Agent => "scripted-agent",
            Sender::User => "scripted-user",
            Sender::Environment => "scripted-env",
        };
        Self {
            id: id.to_string(),
            side,
            sampling: SamplingParams::new("scripted"),
            script,
        }
    }
}

#[async_trait]
impl Actor for ScriptedActor {
    fn id(&self) -> &str {
        &self.id
    }

    fn side(&self) -> Sender {
        self.side
    }

    fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    async fn next_messages(
        &self,
        conversation: &Conversation,
        _view: &EnvView<'_>,
    ) -> Result<Vec<Message>, ActorError> {
        let index = conversation
            .iter()
            .filter(|m| m.sender == self.side)
            .count();
        let entry = self
            .script
            .get(index)
            .ok_or(ActorError::ScriptExhausted(index))?;

        let message = if entry.tool_calls.is_empty() {
            Message::text(self.side, entry.content.clone().unwrap_or_default())
        } else {
            let calls = entry
                .tool_calls
                .iter()
                .enumerate()
                .map(|(i, (name, arguments))| {
                    ToolCall::new(format!("{}_{index}_{i}", self.id), name.clone(), arguments.clone())
                })
                .collect();
            let mut message = Message::tool_calls(self.side, calls);
            message.content = entry.content.clone();
            message
        };
        Ok(vec![message])
    }
}
