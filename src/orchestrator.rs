use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{timeout, Instant};

use crate::actors::{termination_signal, Actor, EnvView, Signal};
use crate::cache::{Fingerprint, ResponseCache};
use crate::env::{diff, EnvironmentState, StateDelta, ToolRegistry};
use crate::error::ActorError;
use crate::evaluator::RewardInfo;
use crate::messages::{
    validate, Conversation, Message, ProtocolConfig, Sender, ToolCall, ToolOutcome,
};
use crate::tasks::{FirstSpeaker, Task};

/// Scheduler states. Tool execution never changes whose logical turn it is;
/// only Text messages hand the conversation over.
#[derive(Debug, Clone, PartialEq)]
enum TurnPhase {
    AwaitingAgent,
    AwaitingUser,
    ExecutingTool {
        owner: Sender,
        calls: Vec<ToolCall>,
    },
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserStop,
    AgentStop,
    Transfer,
    TurnBudgetExceeded,
    Timeout,
    ProtocolViolation,
    ActorFailure,
}

/// Whether a tool result re-prompts the calling actor or hands the turn over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTurnPolicy {
    RepromptActor,
    YieldTurn,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub protocol: ProtocolConfig,
    pub tool_turn_policy: ToolTurnPolicy,
    pub max_actor_retries: usize,
    /// Per provider call; a timed-out call counts as a failed attempt.
    pub actor_timeout: Duration,
    /// Whole-trial wall clock budget.
    pub trial_timeout: Option<Duration>,
    /// Set when replaying a recorded trial: a cache miss then means the
    /// replay has diverged from the recording.
    pub warn_on_cache_miss: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            tool_turn_policy: ToolTurnPolicy::RepromptActor,
            max_actor_retries: 3,
            actor_timeout: Duration::from_secs(60),
            trial_timeout: None,
            warn_on_cache_miss: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub agent: SideUsage,
    pub user: SideUsage,
}

fn usage_totals(conversation: &Conversation) -> UsageTotals {
    let mut totals = UsageTotals::default();
    for message in conversation.iter() {
        let side = match message.sender {
            Sender::Agent => &mut totals.agent,
            Sender::User => &mut totals.user,
            Sender::Environment => continue,
        };
        if let Some(usage) = &message.usage {
            side.prompt_tokens += u64::from(usage.prompt_tokens);
            side.completion_tokens += u64::from(usage.completion_tokens);
        }
    }
    totals
}

/// Everything one finished trial leaves behind. Immutable once produced;
/// serializes as the persisted transcript record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub task_id: String,
    pub conversation: Conversation,
    pub final_state: EnvironmentState,
    pub delta: StateDelta,
    pub termination: TerminationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<RewardInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: UsageTotals,
}

enum CallFailure {
    Deadline,
    Actor(ActorError),
}

/// Drives one conversation from task initialization to termination.
/// Owns the Conversation and EnvironmentState for exactly one trial.
pub struct Orchestrator {
    agent: Arc<dyn Actor>,
    user: Arc<dyn Actor>,
    registry: Arc<ToolRegistry>,
    cache: Option<Arc<dyn ResponseCache>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(agent: Arc<dyn Actor>, user: Arc<dyn Actor>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            agent,
            user,
            registry,
            cache: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs the full loop. Never panics; every failure mode is folded into
    /// the returned TrialResult with an explicit termination reason.
    pub async fn run(&self, task: &Task) -> TrialResult {
        let initial = EnvironmentState::new(task.initial_state.clone());
        let mut state = initial.clone();
        let mut conversation = Conversation::new();
        let mut error: Option<String> = None;

        let deadline = self.config.trial_timeout.map(|t| Instant::now() + t);
        let mut phase = match task.first_speaker {
            FirstSpeaker::Agent => TurnPhase::AwaitingAgent,
            FirstSpeaker::User => TurnPhase::AwaitingUser,
        };

        let termination = loop {
            match phase {
                TurnPhase::AwaitingAgent | TurnPhase::AwaitingUser => {
                    let side = if phase == TurnPhase::AwaitingAgent {
                        Sender::Agent
                    } else {
                        Sender::User
                    };
                    if conversation.len() >= task.max_steps {
                        break TerminationReason::TurnBudgetExceeded;
                    }

                    let actor = match side {
                        Sender::Agent => &self.agent,
                        _ => &self.user,
                    };
                    let batch = match self.call_actor(actor, &conversation, &state, deadline).await
                    {
                        Ok(batch) => batch,
                        Err(CallFailure::Deadline) => break TerminationReason::Timeout,
                        Err(CallFailure::Actor(e)) => {
                            error = Some(e.to_string());
                            break TerminationReason::ActorFailure;
                        }
                    };

                    let mut queued_calls = Vec::new();
                    let mut signal = None;
                    let mut violation = None;
                    for message in batch {
                        if let Err(v) = validate(&message, &self.config.protocol) {
                            violation = Some(v);
                            break;
                        }
                        queued_calls.extend(message.tool_calls.clone());
                        if signal.is_none() {
                            if let Some(text) = message.text_content() {
                                signal = termination_signal(text);
                            }
                        }
                        conversation.push(message);
                    }

                    if let Some(v) = violation {
                        error = Some(v.to_string());
                        break TerminationReason::ProtocolViolation;
                    }
                    phase = match signal {
                        Some(Signal::Stop) if side == Sender::User => {
                            TurnPhase::Terminated(TerminationReason::UserStop)
                        }
                        Some(Signal::Stop) => TurnPhase::Terminated(TerminationReason::AgentStop),
                        Some(Signal::Transfer) => {
                            TurnPhase::Terminated(TerminationReason::Transfer)
                        }
                        None if !queued_calls.is_empty() => TurnPhase::ExecutingTool {
                            owner: side,
                            calls: queued_calls,
                        },
                        None => match side.other() {
                            Sender::Agent => TurnPhase::AwaitingAgent,
                            _ => TurnPhase::AwaitingUser,
                        },
                    };
                }
                TurnPhase::ExecutingTool { owner, calls } => {
                    let mut over_budget = false;
                    for call in &calls {
                        if conversation.len() >= task.max_steps {
                            over_budget = true;
                            break;
                        }
                        let outcome = match self.registry.invoke(&mut state, call) {
                            Ok(payload) => ToolOutcome {
                                call_id: call.id.clone(),
                                ok: true,
                                payload,
                            },
                            // Domain rejections go back to the actor as data.
                            Err(domain_error) => {
                                tracing::debug!(tool = %call.name, %domain_error, "tool rejected call");
                                ToolOutcome {
                                    call_id: call.id.clone(),
                                    ok: false,
                                    payload: json!(domain_error.to_string()),
                                }
                            }
                        };
                        conversation.push(Message::tool_result(outcome));
                    }
                    if over_budget {
                        break TerminationReason::TurnBudgetExceeded;
                    }

                    let next_side = match self.config.tool_turn_policy {
                        ToolTurnPolicy::RepromptActor => owner,
                        ToolTurnPolicy::YieldTurn => owner.other(),
                    };
                    phase = match next_side {
                        Sender::Agent => TurnPhase::AwaitingAgent,
                        _ => TurnPhase::AwaitingUser,
                    };
                }
                TurnPhase::Terminated(reason) => break reason,
            }
        };

        tracing::debug!(task = %task.id, ?termination, steps = conversation.len(), "trial finished");
        let usage = usage_totals(&conversation);
        TrialResult {
            task_id: task.id.clone(),
            delta: diff(&initial, &state),
            final_state: state,
            termination,
            reward: None,
            error,
            usage,
            conversation,
        }
    }

    /// One actor turn: cache lookup, then bounded retries against the live
    /// actor. The fingerprint stays constant across retries because the
    /// prefix does not change.
    async fn call_actor(
        &self,
        actor: &Arc<dyn Actor>,
        conversation: &Conversation,
        state: &EnvironmentState,
        deadline: Option<Instant>,
    ) -> Result<Vec<Message>, CallFailure> {
        let fingerprint =
            Fingerprint::compute(actor.id(), actor.sampling(), conversation.messages());

        if let Some(cache) = &self.cache {
            match cache.get(&fingerprint).await {
                Ok(Some(hit)) => return Ok(hit),
                Ok(None) => {
                    if self.config.warn_on_cache_miss {
                        tracing::warn!(
                            actor = actor.id(),
                            step = conversation.len(),
                            "cache miss while replaying a recorded trial"
                        );
                    }
                }
                Err(e) => {
                    // Cache trouble is never fatal; fall through to the actor.
                    tracing::warn!(actor = actor.id(), error = %e, "response cache unavailable");
                }
            }
        }

        let view = EnvView {
            state,
            tools: self.registry.definitions(),
        };

        let mut last_error = ActorError::Malformed("actor produced no messages".to_string());
        for attempt in 0..=self.config.max_actor_retries {
            let budget = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(CallFailure::Deadline);
                    }
                    remaining.min(self.config.actor_timeout)
                }
                None => self.config.actor_timeout,
            };

            match timeout(budget, actor.next_messages(conversation, &view)).await {
                Ok(Ok(batch)) if !batch.is_empty() => {
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.put(&fingerprint, &batch).await {
                            tracing::warn!(actor = actor.id(), error = %e, "cache put failed");
                        }
                    }
                    return Ok(batch);
                }
                Ok(Ok(_)) => {
                    last_error = ActorError::Malformed("actor produced no messages".to_string());
                }
                Ok(Err(e)) => {
                    tracing::debug!(actor = actor.id(), attempt, error = %e, "actor attempt failed");
                    last_error = e;
                }
                Err(_elapsed) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(CallFailure::Deadline);
                    }
                    last_error = ActorError::Timeout;
                }
            }
        }
        Err(CallFailure::Actor(last_error))
    }
}
