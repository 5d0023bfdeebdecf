use std::{
    fs,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
    sync::Arc,
};

use futures_util::{stream, StreamExt};

use crate::actors::Actor;
use crate::cache::ResponseCache;
use crate::env::ToolRegistry;
use crate::error::ConfigError;
use crate::evaluator::{Evaluator, RewardInfo};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, TerminationReason, TrialResult};
use crate::tasks::Task;

/// Runs N independent trials of a task with bounded concurrency. Every trial
/// gets its own orchestrator and its own deep copy of the initial state; the
/// response cache is the only resource shared between trials.
pub struct TrialRunner {
    agent: Arc<dyn Actor>,
    user: Arc<dyn Actor>,
    registry: Arc<ToolRegistry>,
    cache: Option<Arc<dyn ResponseCache>>,
    config: OrchestratorConfig,
    evaluator: Evaluator,
}

impl TrialRunner {
    pub fn new(agent: Arc<dyn Actor>, user: Arc<dyn Actor>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            agent,
            user,
            registry,
            cache: None,
            config: OrchestratorConfig::default(),
            evaluator: Evaluator::new(),
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

    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    fn orchestrator(&self) -> Orchestrator {
        let mut orchestrator = Orchestrator::new(
            Arc::clone(&self.agent),
            Arc::clone(&self.user),
            Arc::clone(&self.registry),
        )
        .with_config(self.config.clone());
        if let Some(cache) = &self.cache {
            orchestrator = orchestrator.with_cache(Arc::clone(cache));
        }
        orchestrator
    }

    fn score(&self, task: &Task, result: &TrialResult) -> RewardInfo {
        match result.termination {
            TerminationReason::ProtocolViolation | TerminationReason::ActorFailure => {
                RewardInfo::zero(
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("{:?}", result.termination)),
                )
            }
            _ => self.evaluator.evaluate(task, &self.registry, result),
        }
    }

    /// Output order matches trial index regardless of completion order, and
    /// a single trial's failure never aborts its siblings.
    pub async fn run_trials(&self, task: &Task, n: usize, concurrency: usize) -> Vec<TrialResult> {
        let concurrency = concurrency.max(1);
        let mut indexed: Vec<(usize, TrialResult)> = stream::iter(0..n)
            .map(|index| {
                let orchestrator = self.orchestrator();
                async move {
                    let mut result = orchestrator.run(task).await;
                    result.reward = Some(self.score(task, &result));
                    tracing::info!(
                        trial = index,
                        task = %task.id,
                        termination = ?result.termination,
                        reward = result.reward.as_ref().map(|r| r.reward),
                        "trial finished"
                    );
                    (index, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }
}

/// Persists trial results as JSONL, one record per trial; each record embeds
/// the ordered message list, so a stored trial can be re-scored or replayed
/// without re-running it.
pub fn write_results(path: impl AsRef<Path>, results: &[TrialResult]) -> Result<(), ConfigError> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for result in results {
        serde_json::to_writer(&mut writer, result)
            .map_err(|e| ConfigError::TaskFile(e.to_string()))?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_results(path: impl AsRef<Path>) -> Result<Vec<TrialResult>, ConfigError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut results = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        results.push(
            serde_json::from_str(&line).map_err(|e| ConfigError::TaskFile(e.to_string()))?,
        );
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::ScriptedActor;
    use crate::env::{DomainError, ToolDef};
    use crate::messages::Sender;
    use crate::providers::scripted::ScriptedResponse;
    use serde_json::json;

    fn counter_registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDef::new(
                    "bump",
                    json!({
                        "type": "object",
                        "properties": {"by": {"type": "integer"}},
                        "required": ["by"],
                        "additionalProperties": false
                    }),
                ),
                |state, args| {
                    let by = args["by"].as_i64().unwrap_or(0);
                    if by < 0 {
                        return Err(DomainError::rejected("bump", "negative increments refused"));
                    }
                    let counter = state["counter"].as_i64().unwrap_or(0) + by;
                    state["counter"] = json!(counter);
                    Ok(json!({"counter": counter}))
                },
            )
            .unwrap();
        Arc::new(registry)
    }

    fn task() -> Task {
        Task {
            id: "bump-01".to_string(),
            description: None,
            initial_state: json!({"counter": 0}),
            persona: "tester".to_string(),
            scenario: "bump the counter by two".to_string(),
            first_speaker: crate::tasks::FirstSpeaker::User,
            max_steps: 20,
            ground_truth: crate::tasks::GroundTruth {
                expected_actions: vec![crate::tasks::ExpectedAction {
                    name: "bump".to_string(),
                    arguments: json!({"by": 2}),
                }],
                forbidden_tools: Vec::new(),
                communicate_facts: vec!["counter is 2".to_string()],
            },
        }
    }

    fn runner() -> TrialRunner {
        let user = Arc::new(ScriptedActor::new(
            Sender::User,
            vec![
                ScriptedResponse::text("bump by two please"),
                ScriptedResponse::text("thanks ###STOP###"),
            ],
        ));
        let agent = Arc::new(ScriptedActor::new(
            Sender::Agent,
            vec![
                ScriptedResponse::tool_call("bump", json!({"by": 2})),
                ScriptedResponse::text("done, counter is 2"),
            ],
        ));
        TrialRunner::new(agent, user, counter_registry())
    }

    #[tokio::test]
    async fn concurrent_trials_match_sequential_trials() {
        let task = task();
        let sequential = runner().run_trials(&task, 4, 1).await;
        let concurrent = runner().run_trials(&task, 4, 4).await;

        assert_eq!(sequential.len(), 4);
        assert_eq!(concurrent.len(), 4);
        for (a, b) in sequential.iter().zip(&concurrent) {
            assert_eq!(a.conversation, b.conversation);
            assert_eq!(a.final_state, b.final_state);
            assert_eq!(a.reward, b.reward);
        }
        // Trials never observe each other's mutations.
        for result in &concurrent {
            assert_eq!(result.final_state.data()["counter"], json!(2));
        }
    }

    #[tokio::test]
    async fn every_trial_is_scored() {
        let task = task();
        let results = runner().run_trials(&task, 3, 2).await;
        for result in &results {
            let reward = result.reward.as_ref().unwrap();
            assert_eq!(reward.reward, 1.0);
        }
    }

    #[tokio::test]
    async fn failing_trials_are_recorded_not_dropped() {
        let task = task();
        // Agent script is empty, so every trial dies with ActorFailure.
        let user = Arc::new(ScriptedActor::new(
            Sender::User,
            vec![ScriptedResponse::text("hello")],
        ));
        let agent = Arc::new(ScriptedActor::new(Sender::Agent, vec![]));
        let runner = TrialRunner::new(agent, user, counter_registry());

        let results = runner.run_trials(&task, 3, 3).await;
        assert_eq!(results.len(), 3);
        for result in &results {
            assert_eq!(result.termination, TerminationReason::ActorFailure);
            assert_eq!(result.reward.as_ref().unwrap().reward, 0.0);
        }
    }

    #[tokio::test]
    async fn results_roundtrip_through_jsonl() {
        let task = task();
        let results = runner().run_trials(&task, 2, 2).await;

        let path = std::env::temp_dir().join(format!(
            "dialogsim-test-{}-roundtrip.jsonl",
            std::process::id()
        ));
        write_results(&path, &results).unwrap();
        let loaded = read_results(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.len(), results.len());
        for (a, b) in results.iter().zip(&loaded) {
            assert_eq!(a.conversation, b.conversation);
            assert_eq!(a.reward, b.reward);
            assert_eq!(a.termination, b.termination);
        }
    }
}
