use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub mod events;
pub mod frame;
pub mod plan;
pub mod rewind;

pub const NEW_THREAD_SENTINEL: &str = "new";
pub const LEGACY_NEW_THREAD_SENTINEL: &str = "-1";
pub const INTERRUPT_USER_MESSAGE: &str = "I interrupt the workflow.";

/// True when `thread_id` names a thread that has not been created yet.
pub fn is_new_thread_sentinel(thread_id: &str) -> bool {
    matches!(
        thread_id.trim(),
        NEW_THREAD_SENTINEL | LEGACY_NEW_THREAD_SENTINEL
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Originator {
    EndUser,
    Orchestrator,
    Worker(String),
    System,
}

impl Originator {
    pub fn kind(&self) -> &'static str {
        match self {
            Originator::EndUser => "end_user",
            Originator::Orchestrator => "orchestrator",
            Originator::Worker(_) => "worker",
            Originator::System => "system",
        }
    }

    pub fn worker_name(&self) -> Option<&str> {
        match self {
            Originator::Worker(name) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn is_end_user(&self) -> bool {
        matches!(self, Originator::EndUser)
    }

    pub fn from_parts(kind: &str, name: Option<&str>) -> Result<Self, String> {
        match kind {
            "end_user" => Ok(Originator::EndUser),
            "orchestrator" => Ok(Originator::Orchestrator),
            "system" => Ok(Originator::System),
            "worker" => match name.map(str::trim) {
                Some(name) if !name.is_empty() => Ok(Originator::Worker(name.to_string())),
                _ => Err("worker originator requires a name".to_string()),
            },
            other => Err(format!("Unknown originator: {other}")),
        }
    }
}

impl fmt::Display for Originator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Originator::EndUser => f.write_str("user"),
            Originator::Worker(name) => f.write_str(name),
            other => f.write_str(other.kind()),
        }
    }
}

impl FromStr for Originator {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "user" | "end_user" | "end-user" | "human" => Ok(Originator::EndUser),
            "orchestrator" => Ok(Originator::Orchestrator),
            "system" => Ok(Originator::System),
            "" => Err("Empty originator".to_string()),
            _ => Ok(Originator::Worker(input.trim().to_string())),
        }
    }
}

/// A message as stored in a thread's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_index: u64,
    pub originator: Originator,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_rewind_before: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// A message that has not been assigned an index yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub originator: Originator,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NewMessage {
    pub fn new(originator: Originator, content: impl Into<Value>) -> Self {
        Self {
            originator,
            content: content.into(),
            extra: Map::new(),
        }
    }

    pub fn end_user(text: impl Into<String>) -> Self {
        Self::new(Originator::EndUser, Value::String(text.into()))
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn into_message(self, message_index: u64, created_at: DateTime<Utc>) -> Message {
        Message {
            message_index,
            originator: self.originator,
            content: self.content,
            extra: self.extra,
            can_rewind_before: None,
            created_at,
        }
    }
}

/// Deserialize an ID that can be either a string or a number into a String
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

pub(crate) fn deserialize_deps<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Vec<Value> = Vec::deserialize(deserializer)?;
    let mut deps = Vec::new();
    for val in v {
        if let Some(s) = val.as_str() {
            deps.push(s.to_string());
        } else if let Some(i) = val.as_i64() {
            deps.push(i.to_string());
        } else if let Some(u) = val.as_u64() {
            deps.push(u.to_string());
        }
    }
    Ok(deps)
}
