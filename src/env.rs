use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ConfigError;
use crate::messages::ToolCall;

/// A tool rejected the request. State is guaranteed untouched.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum DomainError {
    #[error("unknown tool: {name}{}", .suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    UnknownTool {
        name: String,
        suggestion: Option<String>,
    },

    #[error("invalid arguments for '{tool}': {}", .errors.join("; "))]
    InvalidArguments { tool: String, errors: Vec<String> },

    #[error("'{tool}' rejected: {message}")]
    Rejected { tool: String, message: String },
}

impl DomainError {
    pub fn rejected(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Mutable domain record owned by exactly one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    data: Value,
}

impl EnvironmentState {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Canonical content hash: sha256 over a key-sorted rendering, so two
    /// states compare equal independent of map insertion order.
    pub fn hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut rendered = String::new();
        write_canonical(&mut rendered, &self.data);
        hex::encode(Sha256::digest(rendered.as_bytes()))
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(key.clone()));
                write_canonical(out, val);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// One changed location between two state snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub changes: Vec<StateChange>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Structured difference between two snapshots, as JSON-pointer paths.
pub fn diff(initial: &EnvironmentState, final_state: &EnvironmentState) -> StateDelta {
    let mut delta = StateDelta::default();
    diff_value("", &initial.data, &final_state.data, &mut delta.changes);
    delta
}

fn diff_value(path: &str, before: &Value, after: &Value, out: &mut Vec<StateChange>) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeMap<&String, ()> =
                a.keys().chain(b.keys()).map(|k| (k, ())).collect();
            for key in keys.keys() {
                let child = format!("{path}/{key}");
                match (a.get(*key), b.get(*key)) {
                    (Some(x), Some(y)) => diff_value(&child, x, y, out),
                    (Some(x), None) => out.push(StateChange {
                        path: child,
                        before: Some(x.clone()),
                        after: None,
                    }),
                    (None, Some(y)) => out.push(StateChange {
                        path: child,
                        before: None,
                        after: Some(y.clone()),
                    }),
                    (None, None) => unreachable!(),
                }
            }
        }
        _ if before != after => out.push(StateChange {
            path: path.to_string(),
            before: Some(before.clone()),
            after: Some(after.clone()),
        }),
        _ => {}
    }
}

/// Declared shape of a domain tool, exposed to the agent's provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
    /// Declared by the domain; the adapter never retries either way.
    #[serde(default)]
    pub idempotent: bool,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters,
            idempotent: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

pub type ToolHandler =
    Arc<dyn Fn(&mut Value, &Value) -> Result<Value, DomainError> + Send + Sync>;

struct ToolEntry {
    def: ToolDef,
    schema: JSONSchema,
    handler: ToolHandler,
}

/// Name -> schema -> handler registry, resolved at task-load time.
#[derive(Default)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, def: ToolDef, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(&mut Value, &Value) -> Result<Value, DomainError> + Send + Sync + 'static,
    {
        if self.entries.contains_key(&def.name) {
            return Err(ConfigError::DuplicateTool(def.name));
        }
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&def.parameters)
            .map_err(|e| ConfigError::InvalidToolSchema {
                name: def.name.clone(),
                message: e.to_string(),
            })?;
        self.entries.insert(
            def.name.clone(),
            ToolEntry {
                def,
                schema,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn definitions(&self) -> Vec<&ToolDef> {
        self.entries.values().map(|entry| &entry.def).collect()
    }

    /// Executes one call against `state`. Arguments are schema-checked first;
    /// the handler runs on a scratch copy that is committed only on success,
    /// so any `DomainError` leaves `state` byte-for-byte unchanged.
    pub fn invoke(
        &self,
        state: &mut EnvironmentState,
        call: &ToolCall,
    ) -> Result<Value, DomainError> {
        let entry = self.entries.get(&call.name).ok_or_else(|| {
            DomainError::UnknownTool {
                name: call.name.clone(),
                suggestion: self.closest_name(&call.name),
            }
        })?;

        if let Err(errors) = entry.schema.validate(&call.arguments) {
            return Err(DomainError::InvalidArguments {
                tool: call.name.clone(),
                errors: errors.map(|e| e.to_string()).collect(),
            });
        }

        let mut scratch = state.data.clone();
        let result = (entry.handler)(&mut scratch, &call.arguments)?;
        state.data = scratch;
        Ok(result)
    }

    fn closest_name(&self, wanted: &str) -> Option<String> {
        self.entries
            .keys()
            .map(|name| (strsim::levenshtein(wanted, name), name))
            .min()
            .filter(|(distance, _)| *distance <= 3)
            .map(|(_, name)| name.clone())
    }
}

/// Everything a domain supplies to the core: tools plus the policy document
/// the agent prompt is built from. The policy text is opaque here.
pub struct Domain {
    pub name: String,
    pub registry: ToolRegistry,
    pub policy: String,
}

pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema.schema).expect("schema serialization should not fail")
}
