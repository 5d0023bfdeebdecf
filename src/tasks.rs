use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstSpeaker {
    Agent,
    User,
}

impl Default for FirstSpeaker {
    fn default() -> Self {
        Self::Agent
    }
}

/// A required domain action: tool name plus an argument subset that must
/// appear in the actual call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedAction {
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundTruth {
    #[serde(default)]
    pub expected_actions: Vec<ExpectedAction>,
    #[serde(default)]
    pub forbidden_tools: Vec<String>,
    /// Facts the agent must state to the user, checked as case-insensitive
    /// substrings over agent Text messages.
    #[serde(default)]
    pub communicate_facts: Vec<String>,
}

impl GroundTruth {
    pub fn is_empty(&self) -> bool {
        self.expected_actions.is_empty()
            && self.forbidden_tools.is_empty()
            && self.communicate_facts.is_empty()
    }
}

/// Immutable benchmark task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub initial_state: Value,
    pub persona: String,
    pub scenario: String,
    #[serde(default)]
    pub first_speaker: FirstSpeaker,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub ground_truth: GroundTruth,
}

fn default_max_steps() -> usize {
    40
}

/// Loads one task per YAML/JSON file; a directory loads every matching file,
/// sorted by task id.
pub fn load_tasks(path: impl AsRef<Path>) -> Result<Vec<Task>, ConfigError> {
    let path = path.as_ref();
    if path.is_dir() {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                tasks.push(load_task_file(&p)?);
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    } else {
        Ok(vec![load_task_file(path)?])
    }
}

fn load_task_file(path: &Path) -> Result<Task, ConfigError> {
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let task: Task = if ext == "json" {
        serde_json::from_slice(&bytes)
            .map_err(|e| ConfigError::TaskFile(format!("{}: {e}", path.display())))?
    } else {
        serde_yaml::from_slice(&bytes)
            .map_err(|e| ConfigError::TaskFile(format!("{}: {e}", path.display())))?
    };
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml_task() {
        let yaml = r#"
id: cancel-01
initial_state:
  reservations:
    R1: {status: confirmed}
persona: frequent flyer
scenario: cancel reservation R1
ground_truth:
  expected_actions:
    - name: cancel_reservation
      arguments: {reservation_id: R1}
  communicate_facts: ["5-7 business days"]
"#;
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.id, "cancel-01");
        assert_eq!(task.first_speaker, FirstSpeaker::Agent);
        assert_eq!(task.max_steps, 40);
        assert_eq!(task.ground_truth.expected_actions.len(), 1);
        assert!(!task.ground_truth.is_empty());
    }

    #[test]
    fn empty_ground_truth_defaults() {
        let yaml = r#"
id: chat-01
initial_state: {}
persona: curious
scenario: ask about baggage rules
"#;
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert!(task.ground_truth.is_empty());
    }
}
