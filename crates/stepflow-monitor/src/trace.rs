//! Trace and trace-group aggregates.
//!
//! A [`Trace`] owns its steps, and each [`TraceStep`] owns its operation
//! records. Groups are persisted as a [`GroupRecord`] holding member trace
//! ids; the [`TraceGroup`] view with member traces is assembled on read.

use serde::{Deserialize, Serialize};

use crate::event::{ObservabilityEvent, OperationKind, StepError};

/// Flow name used when a step name has no usable prefix.
pub const UNKNOWN_FLOW: &str = "unknown-flow";

// ─────────────────────────────────────────────────────────────────────────────
// Trace
// ─────────────────────────────────────────────────────────────────────────────

/// Status of a trace execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    /// At least one step has not finished.
    Running,
    /// Every step finished and none failed.
    Completed,
    /// Every step finished and at least one failed.
    Failed,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Running => "running",
            TraceStatus::Completed => "completed",
            TraceStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceStatus::Completed | TraceStatus::Failed)
    }
}

impl std::str::FromStr for TraceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TraceStatus::Running),
            "completed" => Ok(TraceStatus::Completed),
            "failed" => Ok(TraceStatus::Failed),
            other => Err(format!("unknown trace status: {other}")),
        }
    }
}

/// Trigger kind that started a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPointType {
    Api,
    Cron,
    Event,
}

impl EntryPointType {
    /// Guesses the trigger kind from the first step's name.
    pub fn infer(step_name: &str) -> Self {
        if step_name.contains("api") || step_name.contains("endpoint") {
            EntryPointType::Api
        } else if step_name.contains("cron") || step_name.contains("schedule") {
            EntryPointType::Cron
        } else {
            EntryPointType::Event
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    #[serde(rename = "type")]
    pub kind: EntryPointType,
    pub step_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMetadata {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub error_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_child_trace: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_context: Option<serde_json::Value>,
}

/// The record of one logical workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    pub flow_name: String,
    pub status: TraceStatus,
    /// Unix timestamp (milliseconds) of the first step start.
    pub start_time: i64,
    /// Milliseconds from start to the last step end, once every step finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub entry_point: EntryPoint,
    pub steps: Vec<TraceStep>,
    pub metadata: TraceMetadata,
}

impl Trace {
    /// Creates an empty running trace seeded from its first event.
    pub fn from_event(event: &ObservabilityEvent) -> Self {
        Self {
            id: event.trace_id.clone(),
            correlation_id: event.correlation_id.clone(),
            parent_trace_id: event.parent_trace_id.clone(),
            flow_name: flow_name_of(&event.step_name),
            status: TraceStatus::Running,
            start_time: event.timestamp,
            duration: None,
            entry_point: EntryPoint {
                kind: EntryPointType::infer(&event.step_name),
                step_name: event.step_name.clone(),
            },
            steps: Vec::new(),
            metadata: TraceMetadata {
                is_child_trace: Some(event.parent_trace_id.is_some()),
                ..Default::default()
            },
        }
    }

    pub fn step(&self, name: &str) -> Option<&TraceStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut TraceStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// True when every step has completed or failed.
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Starts the named step, or restarts it in place if it already exists.
    pub fn start_step(&mut self, name: &str, timestamp: i64) {
        let offset = timestamp - self.start_time;
        match self.step_mut(name) {
            Some(step) => step.restart(offset),
            None => self.steps.push(TraceStep::running(name, offset)),
        }
        self.metadata.total_steps = self.steps.len();
        self.status = TraceStatus::Running;
    }
}

/// Token before the first `-` of a step name.
fn flow_name_of(step_name: &str) -> String {
    match step_name.split('-').next() {
        Some(prefix) if !prefix.is_empty() => prefix.to_string(),
        _ => UNKNOWN_FLOW.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Steps
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// Per-step operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub state: u32,
    pub emit: u32,
    pub stream: u32,
}

/// Operation and log records of a step, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDetails {
    pub state_operations: Vec<StateOperation>,
    pub emit_operations: Vec<EmitOperation>,
    pub stream_operations: Vec<StreamOperation>,
    pub logs: Vec<LogEntry>,
}

/// One step's execution within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub name: String,
    pub status: StepStatus,
    /// Milliseconds after the trace start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub operations: OperationCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StepDetails>,
}

impl TraceStep {
    pub fn running(name: impl Into<String>, start_offset: i64) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Running,
            start_time: Some(start_offset),
            duration: None,
            operations: OperationCounts::default(),
            error: None,
            details: Some(StepDetails::default()),
        }
    }

    /// Resets status, counters and details for a re-run of the same step.
    pub fn restart(&mut self, start_offset: i64) {
        self.status = StepStatus::Running;
        self.start_time = Some(start_offset);
        self.operations = OperationCounts::default();
        self.details = Some(StepDetails::default());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation records
// ─────────────────────────────────────────────────────────────────────────────

/// Kind segment of a synthesized operation record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    State,
    Emit,
    Stream,
    Log,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::State => "state",
            RecordKind::Emit => "emit",
            RecordKind::Stream => "stream",
            RecordKind::Log => "log",
        }
    }
}

/// `<trace>-<step>-<kind>-<ordinal>`
pub fn record_id(trace_id: &str, step_name: &str, kind: RecordKind, ordinal: usize) -> String {
    format!("{}-{}-{}-{}", trace_id, step_name, kind.as_str(), ordinal)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateOperation {
    pub id: String,
    pub timestamp: i64,
    pub operation: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitOperation {
    pub id: String,
    pub timestamp: i64,
    pub topic: String,
    pub success: bool,
    /// Reserved; never populated by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOperation {
    pub id: String,
    pub timestamp: i64,
    pub operation: OperationKind,
    pub stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A log line to attach to a step; the id is assigned on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NewLogEntry {
    pub fn new(timestamp: i64, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Groups
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Active,
    Completed,
    Failed,
    /// Reserved; no transition into it exists yet.
    Stalled,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Completed => "completed",
            GroupStatus::Failed => "failed",
            GroupStatus::Stalled => "stalled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub total_traces: usize,
    pub completed_traces: usize,
    pub active_traces: usize,
    pub total_steps: usize,
    pub average_step_duration: f64,
    pub gaps_count: usize,
    pub total_gap_duration: i64,
}

/// Persisted form of a trace group: member traces are referenced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub id: String,
    pub correlation_id: String,
    pub name: String,
    pub status: GroupStatus,
    pub start_time: i64,
    pub last_activity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<i64>,
    pub trace_ids: Vec<String>,
    pub metadata: GroupMetadata,
}

impl GroupRecord {
    /// Creates an active group whose only member is `seed`.
    pub fn seeded(correlation_id: impl Into<String>, seed: &Trace) -> Self {
        let correlation_id = correlation_id.into();
        Self {
            id: correlation_id.clone(),
            correlation_id,
            name: format!("{} Flow", seed.flow_name),
            status: GroupStatus::Active,
            start_time: seed.start_time,
            last_activity: seed.start_time,
            total_duration: None,
            trace_ids: vec![seed.id.clone()],
            metadata: GroupMetadata {
                total_traces: 1,
                active_traces: 1,
                ..Default::default()
            },
        }
    }

    pub fn contains(&self, trace_id: &str) -> bool {
        self.trace_ids.iter().any(|id| id == trace_id)
    }

    /// Adds a member; returns false if it was already present.
    pub fn add_member(&mut self, trace_id: &str) -> bool {
        if self.contains(trace_id) {
            return false;
        }
        self.trace_ids.push(trace_id.to_string());
        true
    }

    /// Drops a member; returns false if it was not present.
    pub fn remove_member(&mut self, trace_id: &str) -> bool {
        let before = self.trace_ids.len();
        self.trace_ids.retain(|id| id != trace_id);
        self.trace_ids.len() != before
    }

    /// Recomputes the metadata from the current member traces.
    pub fn recompute(&mut self, members: &[Trace]) {
        let completed: Vec<&Trace> = members.iter().filter(|t| t.status.is_terminal()).collect();
        let active = members
            .iter()
            .filter(|t| t.status == TraceStatus::Running)
            .count();

        self.metadata.total_traces = members.len();
        self.metadata.completed_traces = completed.len();
        self.metadata.active_traces = active;
        self.metadata.total_steps = members.iter().map(|t| t.metadata.total_steps).sum();

        let durations: Vec<i64> = completed.iter().filter_map(|t| t.duration).collect();
        if !durations.is_empty() {
            self.metadata.average_step_duration =
                durations.iter().sum::<i64>() as f64 / durations.len() as f64;
        }

        if active == 0 && !completed.is_empty() {
            self.status = if members.iter().any(|t| t.status == TraceStatus::Failed) {
                GroupStatus::Failed
            } else {
                GroupStatus::Completed
            };
            self.total_duration = Some(self.last_activity - self.start_time);
        }
    }
}

/// A set of traces linked by a correlation id, with member traces joined in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceGroup {
    pub id: String,
    pub correlation_id: String,
    pub name: String,
    pub status: GroupStatus,
    pub start_time: i64,
    pub last_activity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<i64>,
    pub traces: Vec<Trace>,
    pub metadata: GroupMetadata,
}

impl TraceGroup {
    /// Joins a record with its member traces, in membership order.
    pub fn from_record(record: GroupRecord, traces: Vec<Trace>) -> Self {
        Self {
            id: record.id,
            correlation_id: record.correlation_id,
            name: record.name,
            status: record.status,
            start_time: record.start_time,
            last_activity: record.last_activity,
            total_duration: record.total_duration,
            traces,
            metadata: record.metadata,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

/// Inclusive start-time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

/// Search parameters; every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFilter {
    /// Substring of the flow name.
    #[serde(default)]
    pub flow_name: Option<String>,
    #[serde(default)]
    pub status: Option<TraceStatus>,
    /// Substring of any step name.
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub start_time: Option<TimeRange>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSearchResult {
    pub traces: Vec<Trace>,
    pub groups: Vec<TraceGroup>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub total_traces: usize,
    pub total_groups: usize,
    pub running_traces: usize,
    pub completed_traces: usize,
    pub failed_traces: usize,
    pub active_groups: usize,
    pub average_duration: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(id: &str, status: TraceStatus, duration: i64) -> Trace {
        let mut trace = Trace::from_event(&ObservabilityEvent::step_start(id, "orders-step", 1000));
        trace.start_step("orders-step", 1000);
        trace.status = status;
        trace.duration = Some(duration);
        trace
    }

    #[test]
    fn test_flow_name_and_entry_point() {
        let trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "user-api-step", 10));
        assert_eq!(trace.flow_name, "user");
        assert_eq!(trace.entry_point.kind, EntryPointType::Api);

        let trace = Trace::from_event(&ObservabilityEvent::step_start("t2", "-daily", 10));
        assert_eq!(trace.flow_name, UNKNOWN_FLOW);

        assert_eq!(EntryPointType::infer("nightly-schedule"), EntryPointType::Cron);
        assert_eq!(EntryPointType::infer("billing-cron"), EntryPointType::Cron);
        assert_eq!(EntryPointType::infer("http-endpoint"), EntryPointType::Api);
        assert_eq!(EntryPointType::infer("on-order-created"), EntryPointType::Event);
    }

    #[test]
    fn test_restart_step_keeps_single_entry() {
        let mut trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1000));
        trace.start_step("a", 1000);
        trace.steps[0].operations.state = 3;
        trace.steps[0].status = StepStatus::Failed;

        trace.start_step("a", 1400);

        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.metadata.total_steps, 1);
        assert_eq!(trace.steps[0].status, StepStatus::Running);
        assert_eq!(trace.steps[0].start_time, Some(400));
        assert_eq!(trace.steps[0].operations, OperationCounts::default());
    }

    #[test]
    fn test_record_id_format() {
        assert_eq!(record_id("t1", "a", RecordKind::Stream, 2), "t1-a-stream-2");
    }

    #[test]
    fn test_group_recompute_waits_for_active_members() {
        let running = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1000));
        let done = finished("t2", TraceStatus::Completed, 300);

        let mut group = GroupRecord::seeded("c1", &running);
        group.add_member("t2");
        group.recompute(&[running.clone(), done.clone()]);

        assert_eq!(group.status, GroupStatus::Active);
        assert_eq!(group.metadata.active_traces, 1);
        assert_eq!(group.metadata.completed_traces, 1);
        assert_eq!(group.metadata.average_step_duration, 300.0);
        assert!(group.total_duration.is_none());
    }

    #[test]
    fn test_group_recompute_fails_when_any_member_failed() {
        let ok = finished("t1", TraceStatus::Completed, 100);
        let bad = finished("t2", TraceStatus::Failed, 300);

        let mut group = GroupRecord::seeded("c1", &ok);
        group.add_member("t2");
        group.last_activity = ok.start_time + 750;
        group.recompute(&[ok, bad]);

        assert_eq!(group.status, GroupStatus::Failed);
        assert_eq!(group.metadata.average_step_duration, 200.0);
        assert_eq!(group.total_duration, Some(750));
    }

    #[test]
    fn test_group_membership_is_unique() {
        let seed = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1));
        let mut group = GroupRecord::seeded("c1", &seed);
        assert!(!group.add_member("t1"));
        assert!(group.add_member("t2"));
        assert!(group.remove_member("t1"));
        assert!(!group.remove_member("t1"));
        assert_eq!(group.trace_ids, vec!["t2".to_string()]);
    }

    #[test]
    fn test_trace_serializes_camel_case() {
        let trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "cron-job", 5));
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["flowName"], "cron");
        assert_eq!(value["entryPoint"]["type"], "cron");
        assert_eq!(value["metadata"]["totalSteps"], 0);
    }
}
