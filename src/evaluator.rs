use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::env::{EnvironmentState, ToolRegistry};
use crate::messages::{Sender, ToolCall};
use crate::orchestrator::TrialResult;
use crate::tasks::Task;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardWeights {
    pub action: f64,
    pub communication: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            action: 0.6,
            communication: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCheck {
    pub state_match: bool,
    pub calls_matched: bool,
    pub forbidden_called: Vec<String>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationCheck {
    pub found: Vec<String>,
    pub missing: Vec<String>,
    pub score: f64,
}

/// Score plus diagnostic breakdown for one trial. Deterministic in its
/// inputs; no randomness anywhere in scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardInfo {
    pub reward: f64,
    pub action: ActionCheck,
    pub communication: CommunicationCheck,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl RewardInfo {
    /// The zero reward recorded for trials that failed outright.
    pub fn zero(reason: impl Into<String>) -> Self {
        Self {
            reward: 0.0,
            action: ActionCheck {
                state_match: false,
                calls_matched: false,
                forbidden_called: Vec::new(),
                score: 0.0,
            },
            communication: CommunicationCheck {
                found: Vec::new(),
                missing: Vec::new(),
                score: 0.0,
            },
            failures: vec![reason.into()],
        }
    }
}

pub struct Evaluator {
    weights: RewardWeights,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            weights: RewardWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: RewardWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Scores a completed trial against the task ground truth. Action
    /// correctness is judged against the environment end state (expected
    /// actions replayed on a fresh copy of the initial state), not against
    /// conversational phrasing; communication correctness checks that the
    /// designated facts reached the user as text.
    pub fn evaluate(&self, task: &Task, registry: &ToolRegistry, result: &TrialResult) -> RewardInfo {
        let truth = &task.ground_truth;
        if truth.is_empty() {
            return RewardInfo {
                reward: 1.0,
                action: ActionCheck {
                    state_match: true,
                    calls_matched: true,
                    forbidden_called: Vec::new(),
                    score: 1.0,
                },
                communication: CommunicationCheck {
                    found: Vec::new(),
                    missing: Vec::new(),
                    score: 1.0,
                },
                failures: Vec::new(),
            };
        }

        let mut failures = Vec::new();
        let action = self.check_actions(task, registry, result, &mut failures);
        let communication = self.check_communication(task, result, &mut failures);

        let action_active = !truth.expected_actions.is_empty() || !truth.forbidden_tools.is_empty();
        let communication_active = !truth.communicate_facts.is_empty();
        let mut action_weight = if action_active { self.weights.action } else { 0.0 };
        let mut communication_weight = if communication_active {
            self.weights.communication
        } else {
            0.0
        };
        let sum = action_weight + communication_weight;
        if sum <= 0.0 {
            action_weight = 0.0;
            communication_weight = 0.0;
        } else {
            action_weight /= sum;
            communication_weight /= sum;
        }

        RewardInfo {
            reward: action_weight * action.score + communication_weight * communication.score,
            action,
            communication,
            failures,
        }
    }

    fn check_actions(
        &self,
        task: &Task,
        registry: &ToolRegistry,
        result: &TrialResult,
        failures: &mut Vec<String>,
    ) -> ActionCheck {
        let truth = &task.ground_truth;

        // Replay the expected actions on a fresh copy of the initial state
        // to obtain the gold end state.
        let mut gold = EnvironmentState::new(task.initial_state.clone());
        for (i, action) in truth.expected_actions.iter().enumerate() {
            let call = ToolCall::new(format!("gold_{i}"), &action.name, action.arguments.clone());
            if let Err(e) = registry.invoke(&mut gold, &call) {
                tracing::warn!(tool = %action.name, error = %e, "gold action failed to replay");
            }
        }
        let state_match = gold.hash() == result.final_state.hash();
        if !state_match {
            failures.push("environment end state does not match gold end state".to_string());
        }

        let transcript_calls = result.conversation.tool_call_sequence();

        // Every expected call must appear in order, matched by name and
        // argument subset.
        let mut cursor = 0usize;
        let mut calls_matched = true;
        for expected in &truth.expected_actions {
            let mut found = false;
            while cursor < transcript_calls.len() {
                let actual = transcript_calls[cursor];
                cursor += 1;
                if actual.name == expected.name
                    && value_is_subset(&expected.arguments, &actual.arguments)
                {
                    found = true;
                    break;
                }
            }
            if !found {
                calls_matched = false;
                failures.push(format!("missing required call: {}", expected.name));
            }
        }

        let forbidden_called: Vec<String> = transcript_calls
            .iter()
            .filter(|call| truth.forbidden_tools.iter().any(|t| t == &call.name))
            .map(|call| call.name.clone())
            .collect();
        for name in &forbidden_called {
            failures.push(format!("forbidden tool called: {name}"));
        }

        let score = if state_match && calls_matched && forbidden_called.is_empty() {
            1.0
        } else {
            0.0
        };
        ActionCheck {
            state_match,
            calls_matched,
            forbidden_called,
            score,
        }
    }

    fn check_communication(
        &self,
        task: &Task,
        result: &TrialResult,
        failures: &mut Vec<String>,
    ) -> CommunicationCheck {
        let truth = &task.ground_truth;
        let spoken: String = result
            .conversation
            .texts_from(Sender::Agent)
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for fact in &truth.communicate_facts {
            if spoken.contains(&fact.to_lowercase()) {
                found.push(fact.clone());
            } else {
                failures.push(format!("fact not communicated to user: {fact}"));
                missing.push(fact.clone());
            }
        }

        let total = truth.communicate_facts.len();
        let score = if total == 0 {
            1.0
        } else {
            found.len() as f64 / total as f64
        };
        CommunicationCheck {
            found,
            missing,
            score,
        }
    }
}

/// Every key in `expected` must be present in `actual` with a matching
/// value; nested objects recurse, everything else compares for equality.
pub fn value_is_subset(expected: &Value, actual: &Value) -> bool {
    let (Value::Object(expected), Value::Object(actual)) = (expected, actual) else {
        return expected == actual;
    };
    expected
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|av| value_is_subset(v, av)))
}
