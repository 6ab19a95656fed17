use crate::{deserialize_deps, deserialize_id, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PLAN_KEY: &str = "plan";
pub const PLAN_UPDATE_KEY: &str = "plan_update";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Skipped,
    Failed,
    Blocked,
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Blocked
    }
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Done => "done",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
            StepStatus::Blocked => "blocked",
        }
    }

    /// Done and skipped steps satisfy anything that depends on them.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped)
    }

    fn sort_rank(&self) -> u8 {
        match self {
            StepStatus::InProgress => 0,
            StepStatus::Done => 1,
            StepStatus::Skipped => 2,
            StepStatus::Pending => 3,
            StepStatus::Failed => 4,
            StepStatus::Blocked => 5,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" | "inprogress" => Ok(StepStatus::InProgress),
            "done" | "completed" => Ok(StepStatus::Done),
            "skipped" => Ok(StepStatus::Skipped),
            "failed" => Ok(StepStatus::Failed),
            "blocked" => Ok(StepStatus::Blocked),
            _ => Err(format!("Unknown step status: {input}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, deserialize_with = "deserialize_deps")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Plan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Client timestamps are ignored. A step keeps the previous plan's
    /// `last_updated` only while its content is unchanged.
    fn stamp_against(&mut self, previous: Option<&Plan>, now: DateTime<Utc>) {
        for step in &mut self.steps {
            let kept = previous
                .and_then(|plan| plan.step(&step.id))
                .filter(|prev| prev.same_content(step))
                .and_then(|prev| prev.last_updated);
            step.last_updated = Some(kept.unwrap_or(now));
        }
    }
}

impl PlanStep {
    fn same_content(&self, other: &PlanStep) -> bool {
        self.status == other.status
            && self.outcome == other.outcome
            && self.title == other.title
            && self.description == other.description
            && self.depends_on == other.depends_on
            && self.rationale == other.rationale
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepUpdate {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlanUpdate {
    #[serde(default)]
    pub step_updates: Vec<StepUpdate>,
}

/// Steps that changed between two plan snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlanDelta {
    #[serde(default)]
    pub updated: Vec<PlanStep>,
    #[serde(default)]
    pub added: Vec<PlanStep>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl PlanDelta {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("duplicate step id: {id}")]
    DuplicateStep { id: String },
    #[error("step {id} depends on itself")]
    SelfDependency { id: String },
    #[error("step {id} depends on unknown step {dependency}")]
    UnknownDependency { id: String, dependency: String },
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("plan_update without an existing plan")]
    NoPlanToUpdate,
    #[error("malformed {key}: {detail}")]
    Malformed { key: &'static str, detail: String },
}

/// Reports every step whose `last_updated` advanced, except steps that only
/// moved from blocked to pending because their dependencies cleared.
pub fn plan_delta(previous: Option<&Plan>, current: &Plan) -> PlanDelta {
    let Some(previous) = previous else {
        return PlanDelta {
            added: current.steps.clone(),
            ..PlanDelta::default()
        };
    };

    let before: HashMap<&str, &PlanStep> = previous
        .steps
        .iter()
        .map(|step| (step.id.as_str(), step))
        .collect();
    let mut delta = PlanDelta::default();

    for step in &current.steps {
        match before.get(step.id.as_str()) {
            None => delta.added.push(step.clone()),
            Some(prev) => {
                let advanced = step.last_updated > prev.last_updated;
                let unblocked =
                    prev.status == StepStatus::Blocked && step.status == StepStatus::Pending;
                if advanced && !unblocked {
                    delta.updated.push(step.clone());
                }
            }
        }
    }

    let current_ids: HashSet<&str> = current.steps.iter().map(|step| step.id.as_str()).collect();
    delta.removed = previous
        .steps
        .iter()
        .filter(|step| !current_ids.contains(step.id.as_str()))
        .map(|step| step.id.clone())
        .collect();
    delta
}

pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    let mut ids = HashSet::new();
    for step in &plan.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(PlanError::DuplicateStep {
                id: step.id.clone(),
            });
        }
    }

    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in &plan.steps {
        for dependency in &step.depends_on {
            if dependency == &step.id {
                return Err(PlanError::SelfDependency {
                    id: step.id.clone(),
                });
            }
            if !ids.contains(dependency.as_str()) {
                return Err(PlanError::UnknownDependency {
                    id: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        edges.insert(
            step.id.as_str(),
            step.depends_on.iter().map(String::as_str).collect(),
        );
    }

    let mut finished = HashSet::new();
    let mut stack = Vec::new();
    for id in edges.keys() {
        if let Some(path) = find_cycle(*id, &edges, &mut finished, &mut stack) {
            return Err(PlanError::Cycle { path });
        }
    }
    Ok(())
}

fn find_cycle<'a>(
    id: &'a str,
    edges: &BTreeMap<&'a str, Vec<&'a str>>,
    finished: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if finished.contains(id) {
        return None;
    }
    if let Some(start) = stack.iter().position(|entry| *entry == id) {
        let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
        path.push(id.to_string());
        return Some(path);
    }
    stack.push(id);
    for dependency in edges.get(id).into_iter().flatten() {
        if let Some(path) = find_cycle(*dependency, edges, finished, stack) {
            return Some(path);
        }
    }
    stack.pop();
    finished.insert(id);
    None
}

/// Applies status updates by id. Returns ids that matched no step.
pub fn apply_plan_update(
    plan: &mut Plan,
    update: &PlanUpdate,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut unknown = Vec::new();
    for step_update in &update.step_updates {
        let Some(step) = plan.steps.iter_mut().find(|step| step.id == step_update.id) else {
            unknown.push(step_update.id.clone());
            continue;
        };
        step.status = step_update.status;
        if step_update.outcome.is_some() {
            step.outcome = step_update.outcome.clone();
        }
        step.last_updated = Some(now);
    }
    refresh_blocked(plan, now);
    sort_plan(plan);
    unknown
}

/// Recomputes pending/blocked from dependency state. Other statuses are left alone.
pub fn refresh_blocked(plan: &mut Plan, now: DateTime<Utc>) {
    let statuses: HashMap<String, StepStatus> = plan
        .steps
        .iter()
        .map(|step| (step.id.clone(), step.status))
        .collect();

    for step in &mut plan.steps {
        if !matches!(step.status, StepStatus::Pending | StepStatus::Blocked) {
            continue;
        }
        let waiting = step.depends_on.iter().any(|dependency| {
            !statuses
                .get(dependency)
                .is_some_and(StepStatus::satisfies_dependents)
        });
        let next = if waiting {
            StepStatus::Blocked
        } else {
            StepStatus::Pending
        };
        if next != step.status {
            step.status = next;
            step.last_updated = Some(now);
        }
    }
}

pub fn sort_plan(plan: &mut Plan) {
    plan.steps.sort_by(|a, b| {
        a.status
            .sort_rank()
            .cmp(&b.status.sort_rank())
            .then_with(|| a.last_updated.cmp(&b.last_updated))
            .then_with(|| compare_ids(&a.id, &b.id))
    });
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

pub fn plan_from_extra(extra: &Map<String, Value>) -> Result<Option<Plan>, PlanError> {
    extra
        .get(PLAN_KEY)
        .map(|value| {
            serde_json::from_value(value.clone()).map_err(|err| PlanError::Malformed {
                key: PLAN_KEY,
                detail: err.to_string(),
            })
        })
        .transpose()
}

/// Accepts either `{"step_updates": [...]}` or a bare list of step updates.
pub fn plan_update_from_extra(
    extra: &Map<String, Value>,
) -> Result<Option<PlanUpdate>, PlanError> {
    let Some(value) = extra.get(PLAN_UPDATE_KEY) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Array(_) => serde_json::from_value(value.clone())
            .map(|step_updates| PlanUpdate { step_updates }),
        _ => serde_json::from_value(value.clone()),
    };
    parsed.map(Some).map_err(|err| PlanError::Malformed {
        key: PLAN_UPDATE_KEY,
        detail: err.to_string(),
    })
}

/// Resolves plan-bearing `extra` before a message is stored. A full plan is
/// validated and normalised; a bare update is applied to `current`. Either
/// way the resolved plan is written back under `extra.plan`.
pub fn ingest_plan(
    current: Option<&Plan>,
    extra: &mut Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<Option<Plan>, PlanError> {
    let resolved = if let Some(mut plan) = plan_from_extra(extra)? {
        validate_plan(&plan)?;
        refresh_blocked(&mut plan, now);
        plan.stamp_against(current, now);
        sort_plan(&mut plan);
        plan
    } else if let Some(update) = plan_update_from_extra(extra)? {
        let mut plan = current.cloned().ok_or(PlanError::NoPlanToUpdate)?;
        apply_plan_update(&mut plan, &update, now);
        plan
    } else {
        return Ok(None);
    };

    let encoded = serde_json::to_value(&resolved).map_err(|err| PlanError::Malformed {
        key: PLAN_KEY,
        detail: err.to_string(),
    })?;
    extra.insert(PLAN_KEY.to_string(), encoded);
    Ok(Some(resolved))
}

/// The plan carried by the latest message whose `extra.plan` parses.
pub fn derive_plan(messages: &[Message]) -> Option<Plan> {
    messages
        .iter()
        .rev()
        .find_map(|message| plan_from_extra(&message.extra).ok().flatten())
}
