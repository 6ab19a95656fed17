use crate::plan::{Plan, PlanDelta};
use crate::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageUpdate,
    HistoryReset,
    RewindStatus,
    RewindUpdate,
    Error,
    Interrupted,
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageUpdate => "message_update",
            EventKind::HistoryReset => "history_reset",
            EventKind::RewindStatus => "rewind_status",
            EventKind::RewindUpdate => "rewind_update",
            EventKind::Error => "error",
            EventKind::Interrupted => "interrupted",
            EventKind::Done => "done",
        }
    }

    /// Terminal kinds end the run that holds the active claim.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Error | EventKind::Interrupted | EventKind::Done
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub cursor: u64,
    pub thread_id: String,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RewindStatus {
    #[default]
    Ready,
    Pending,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdatePayload {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_delta: Option<PlanDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResetPayload {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub plan: Option<Plan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindStatusPayload {
    pub status: RewindStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindUpdatePayload {
    pub rewindable_indices: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

/// Typed view of what gets published; the bus stores `(kind, payload)`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    MessageUpdate(MessageUpdatePayload),
    HistoryReset(HistoryResetPayload),
    RewindStatus(RewindStatusPayload),
    RewindUpdate(RewindUpdatePayload),
    Error(ErrorPayload),
    Interrupted,
    Done,
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::MessageUpdate(_) => EventKind::MessageUpdate,
            EventBody::HistoryReset(_) => EventKind::HistoryReset,
            EventBody::RewindStatus(_) => EventKind::RewindStatus,
            EventBody::RewindUpdate(_) => EventKind::RewindUpdate,
            EventBody::Error(_) => EventKind::Error,
            EventBody::Interrupted => EventKind::Interrupted,
            EventBody::Done => EventKind::Done,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        EventBody::Error(ErrorPayload {
            error: detail.into(),
        })
    }

    pub fn into_parts(self) -> Result<(EventKind, Value), serde_json::Error> {
        let kind = self.kind();
        let payload = match self {
            EventBody::MessageUpdate(payload) => serde_json::to_value(payload)?,
            EventBody::HistoryReset(payload) => serde_json::to_value(payload)?,
            EventBody::RewindStatus(payload) => serde_json::to_value(payload)?,
            EventBody::RewindUpdate(payload) => serde_json::to_value(payload)?,
            EventBody::Error(payload) => serde_json::to_value(payload)?,
            EventBody::Interrupted | EventBody::Done => Value::Object(Default::default()),
        };
        Ok((kind, payload))
    }
}

/// Which run currently holds the global claim, as shown to every observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActiveState {
    pub active_thread_id: Option<String>,
    pub active_run_name: Option<String>,
    pub active_run_label: Option<String>,
}

impl ActiveState {
    pub fn is_idle(&self) -> bool {
        self.active_thread_id.is_none()
    }
}
