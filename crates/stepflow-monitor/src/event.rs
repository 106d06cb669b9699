//! Instrumentation events emitted by running steps.

use serde::{Deserialize, Serialize};

/// Step name used by correlation events that are not tied to a step.
pub const SYSTEM_STEP: &str = "system";

/// Kind of instrumentation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StepStart,
    StepEnd,
    StateOp,
    EmitOp,
    StreamOp,
    CorrelationStart,
    CorrelationContinue,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StepStart => "step_start",
            EventType::StepEnd => "step_end",
            EventType::StateOp => "state_op",
            EventType::EmitOp => "emit_op",
            EventType::StreamOp => "stream_op",
            EventType::CorrelationStart => "correlation_start",
            EventType::CorrelationContinue => "correlation_continue",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State or stream operation performed by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Get,
    Set,
    Delete,
    Clear,
}

/// How a trace came to be linked to a correlation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrelationMethod {
    Automatic,
    #[default]
    Manual,
    StateBased,
    EventBased,
}

/// Error code reported by a step; producers send either a string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

/// Error attached to a failed step or operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }
}

/// Event-specific fields. Which keys are meaningful depends on the event type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_method: Option<CorrelationMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_context: Option<serde_json::Value>,
}

/// A single instrumentation event, as produced by the per-step logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityEvent {
    pub event_type: EventType,
    pub trace_id: String,
    pub step_name: String,
    /// Unix timestamp (milliseconds).
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    /// Elapsed time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl ObservabilityEvent {
    pub fn new(
        event_type: EventType,
        trace_id: impl Into<String>,
        step_name: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type,
            trace_id: trace_id.into(),
            step_name: step_name.into(),
            timestamp,
            correlation_id: None,
            parent_trace_id: None,
            duration: None,
            metadata: EventMetadata::default(),
        }
    }

    pub fn step_start(trace_id: impl Into<String>, step_name: impl Into<String>, timestamp: i64) -> Self {
        Self::new(EventType::StepStart, trace_id, step_name, timestamp)
    }

    pub fn step_end(
        trace_id: impl Into<String>,
        step_name: impl Into<String>,
        timestamp: i64,
        duration: u64,
        success: bool,
    ) -> Self {
        let mut event = Self::new(EventType::StepEnd, trace_id, step_name, timestamp);
        event.duration = Some(duration);
        event.metadata.success = Some(success);
        event
    }

    pub fn state_op(
        trace_id: impl Into<String>,
        step_name: impl Into<String>,
        timestamp: i64,
        operation: OperationKind,
        key: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(EventType::StateOp, trace_id, step_name, timestamp);
        event.metadata.operation = Some(operation);
        event.metadata.key = Some(key.into());
        event.metadata.success = Some(true);
        event
    }

    pub fn emit_op(
        trace_id: impl Into<String>,
        step_name: impl Into<String>,
        timestamp: i64,
        topic: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(EventType::EmitOp, trace_id, step_name, timestamp);
        event.metadata.topic = Some(topic.into());
        event.metadata.success = Some(true);
        event
    }

    pub fn stream_op(
        trace_id: impl Into<String>,
        step_name: impl Into<String>,
        timestamp: i64,
        operation: OperationKind,
        stream_name: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(EventType::StreamOp, trace_id, step_name, timestamp);
        event.metadata.operation = Some(operation);
        event.metadata.stream_name = Some(stream_name.into());
        event.metadata.success = Some(true);
        event
    }

    pub fn correlation_start(
        trace_id: impl Into<String>,
        correlation_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let mut event = Self::new(EventType::CorrelationStart, trace_id, SYSTEM_STEP, timestamp);
        event.correlation_id = Some(correlation_id.into());
        event
    }

    pub fn correlation_continue(
        trace_id: impl Into<String>,
        correlation_id: impl Into<String>,
        parent_trace_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let mut event = Self::new(EventType::CorrelationContinue, trace_id, SYSTEM_STEP, timestamp);
        event.correlation_id = Some(correlation_id.into());
        event.parent_trace_id = Some(parent_trace_id.into());
        event
    }

    /// Marks the event as failed with the given error.
    pub fn with_error(mut self, error: StepError) -> Self {
        self.metadata.success = Some(false);
        self.metadata.error = Some(error);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_parent_trace_id(mut self, parent_trace_id: impl Into<String>) -> Self {
        self.parent_trace_id = Some(parent_trace_id.into());
        self
    }

    /// Whether the operation or step succeeded; absent counts as success.
    pub fn succeeded(&self) -> bool {
        self.metadata.success.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_event() {
        let event: ObservabilityEvent = serde_json::from_value(json!({
            "eventType": "stream_op",
            "traceId": "t1",
            "stepName": "orders-process",
            "timestamp": 1700000000000i64,
            "metadata": { "operation": "set", "streamName": "orders", "success": false,
                          "error": { "message": "boom", "code": 503 } }
        }))
        .unwrap();

        assert_eq!(event.event_type, EventType::StreamOp);
        assert_eq!(event.metadata.operation, Some(OperationKind::Set));
        assert_eq!(event.metadata.stream_name.as_deref(), Some("orders"));
        assert!(!event.succeeded());
        assert_eq!(
            event.metadata.error.unwrap().code,
            Some(ErrorCode::Number(503))
        );
    }

    #[test]
    fn test_metadata_is_optional() {
        let event: ObservabilityEvent = serde_json::from_value(json!({
            "eventType": "correlation_continue",
            "traceId": "t2",
            "stepName": "system",
            "timestamp": 1,
            "correlationId": "c1",
            "parentTraceId": "t1"
        }))
        .unwrap();

        assert_eq!(event.metadata, EventMetadata::default());
        assert_eq!(event.parent_trace_id.as_deref(), Some("t1"));
        assert!(event.succeeded());
    }

    #[test]
    fn test_correlation_method_names() {
        let method: CorrelationMethod = serde_json::from_value(json!("state-based")).unwrap();
        assert_eq!(method, CorrelationMethod::StateBased);
        assert_eq!(EventType::CorrelationStart.to_string(), "correlation_start");
    }

    #[test]
    fn test_rejects_unknown_event_type() {
        let result = serde_json::from_value::<ObservabilityEvent>(json!({
            "eventType": "heartbeat",
            "traceId": "t1",
            "stepName": "x",
            "timestamp": 1
        }));
        assert!(result.is_err());
    }
}
