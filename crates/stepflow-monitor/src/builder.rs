//! Incremental trace assembly.
//!
//! [`TraceBuilder`] applies one [`ObservabilityEvent`] at a time to the stored
//! aggregates. Events that reference a trace, step or group that does not
//! exist are ignored: they may arrive after eviction or before creation.
//! Each cycle holds the trace's lock, and then the group's lock when the
//! group is touched.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::event::{EventType, ObservabilityEvent};
use crate::lock::KeyedLocks;
use crate::store::StoreError;
use crate::stream::ObservabilityStream;
use crate::trace::{
    record_id, EmitOperation, GroupRecord, LogEntry, NewLogEntry, RecordKind, StateOperation,
    StepStatus, StreamOperation, Trace, TraceStatus,
};

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub traces_evicted: usize,
    pub groups_deleted: usize,
}

pub struct TraceBuilder {
    stream: Arc<ObservabilityStream>,
    trace_locks: KeyedLocks,
    group_locks: KeyedLocks,
}

impl TraceBuilder {
    pub fn new(stream: Arc<ObservabilityStream>) -> Self {
        Self {
            stream,
            trace_locks: KeyedLocks::new(),
            group_locks: KeyedLocks::new(),
        }
    }

    /// Applies a single event to the aggregate store.
    pub async fn apply(&self, event: &ObservabilityEvent) -> Result<(), StoreError> {
        let _guard = self.trace_locks.lock(&event.trace_id).await;

        tracing::debug!(
            trace_id = %event.trace_id,
            step = %event.step_name,
            event_type = %event.event_type,
            "Applying observability event"
        );

        match event.event_type {
            EventType::StepStart => self.handle_step_start(event).await,
            EventType::StepEnd => self.handle_step_end(event).await,
            EventType::StateOp | EventType::EmitOp | EventType::StreamOp => {
                self.handle_operation(event).await
            }
            EventType::CorrelationStart => self.handle_correlation_start(event).await,
            EventType::CorrelationContinue => self.handle_correlation_continue(event).await,
        }
    }

    async fn handle_step_start(&self, event: &ObservabilityEvent) -> Result<(), StoreError> {
        let mut trace = match self.stream.get_trace(&event.trace_id).await? {
            Some(trace) => trace,
            None => {
                tracing::debug!(trace_id = %event.trace_id, "Creating trace");
                Trace::from_event(event)
            }
        };

        trace.start_step(&event.step_name, event.timestamp);

        self.stream.save_trace(&trace).await?;
        self.refresh_group(&trace).await
    }

    async fn handle_step_end(&self, event: &ObservabilityEvent) -> Result<(), StoreError> {
        let Some(mut trace) = self.stream.get_trace(&event.trace_id).await? else {
            return Ok(());
        };
        let Some(step) = trace.step_mut(&event.step_name) else {
            return Ok(());
        };
        // Duplicate or late end events are dropped.
        if step.status != StepStatus::Running {
            return Ok(());
        }

        let success = event.metadata.success == Some(true);
        step.status = if success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        step.duration = event.duration;
        if !success {
            if let Some(error) = &event.metadata.error {
                step.error = Some(error.clone());
            }
        }

        if success {
            trace.metadata.completed_steps += 1;
        } else {
            trace.metadata.error_count += 1;
        }

        if trace.all_steps_terminal() {
            trace.status = if trace.metadata.error_count > 0 {
                TraceStatus::Failed
            } else {
                TraceStatus::Completed
            };
            trace.duration = Some(event.timestamp - trace.start_time);
        }

        self.stream.save_trace(&trace).await?;
        self.refresh_group(&trace).await
    }

    async fn handle_operation(&self, event: &ObservabilityEvent) -> Result<(), StoreError> {
        let Some(mut trace) = self.stream.get_trace(&event.trace_id).await? else {
            return Ok(());
        };
        let Some(step) = trace.step_mut(&event.step_name) else {
            return Ok(());
        };
        let Some(details) = step.details.as_mut() else {
            return Ok(());
        };

        let meta = &event.metadata;
        let success = event.succeeded();

        match event.event_type {
            EventType::StateOp => {
                step.operations.state += 1;
                details.state_operations.push(StateOperation {
                    id: record_id(
                        &event.trace_id,
                        &event.step_name,
                        RecordKind::State,
                        details.state_operations.len(),
                    ),
                    timestamp: event.timestamp,
                    operation: meta.operation.unwrap_or_default(),
                    key: meta.key.clone(),
                    duration: event.duration,
                    success,
                    error: meta.error.clone(),
                });
            }
            EventType::EmitOp => {
                step.operations.emit += 1;
                details.emit_operations.push(EmitOperation {
                    id: record_id(
                        &event.trace_id,
                        &event.step_name,
                        RecordKind::Emit,
                        details.emit_operations.len(),
                    ),
                    timestamp: event.timestamp,
                    topic: meta.topic.clone().unwrap_or_else(|| "unknown".to_string()),
                    success,
                    target_steps: None,
                    error: meta.error.clone(),
                });
            }
            EventType::StreamOp => {
                step.operations.stream += 1;
                details.stream_operations.push(StreamOperation {
                    id: record_id(
                        &event.trace_id,
                        &event.step_name,
                        RecordKind::Stream,
                        details.stream_operations.len(),
                    ),
                    timestamp: event.timestamp,
                    operation: meta.operation.unwrap_or_default(),
                    stream_name: meta.stream_name.clone().unwrap_or_else(|| "unknown".to_string()),
                    duration: event.duration,
                    success,
                    error: meta.error.clone(),
                });
            }
            _ => return Ok(()),
        }

        // Operations never touch group aggregates.
        self.stream.save_trace(&trace).await
    }

    async fn handle_correlation_start(&self, event: &ObservabilityEvent) -> Result<(), StoreError> {
        let Some(correlation_id) = event.correlation_id.as_deref() else {
            tracing::debug!(trace_id = %event.trace_id, "correlation_start without correlation id");
            return Ok(());
        };
        let Some(mut trace) = self.stream.get_trace(&event.trace_id).await? else {
            return Ok(());
        };

        trace.correlation_id = Some(correlation_id.to_string());
        if let Some(context) = &event.metadata.correlation_context {
            trace.metadata.correlation_context = Some(context.clone());
        }
        self.stream.save_trace(&trace).await?;

        let _guard = self.group_locks.lock(correlation_id).await;
        let mut record = match self.stream.get_group(correlation_id).await? {
            Some(record) => record,
            None => {
                tracing::debug!(correlation_id, trace_id = %trace.id, "Creating trace group");
                GroupRecord::seeded(correlation_id, &trace)
            }
        };

        let added = record.add_member(&trace.id);
        let members = self.stream.members(&record).await?;
        if added {
            record.recompute(&members);
        }
        self.stream.save_group(&record, &members).await
    }

    async fn handle_correlation_continue(
        &self,
        event: &ObservabilityEvent,
    ) -> Result<(), StoreError> {
        let (Some(correlation_id), Some(parent_trace_id)) =
            (event.correlation_id.as_deref(), event.parent_trace_id.as_deref())
        else {
            tracing::debug!(trace_id = %event.trace_id, "correlation_continue without ids");
            return Ok(());
        };
        let Some(mut trace) = self.stream.get_trace(&event.trace_id).await? else {
            return Ok(());
        };

        trace.correlation_id = Some(correlation_id.to_string());
        trace.parent_trace_id = Some(parent_trace_id.to_string());
        trace.metadata.is_child_trace = Some(true);
        self.stream.save_trace(&trace).await?;

        // Joining an unknown correlation id does not create the group.
        let _guard = self.group_locks.lock(correlation_id).await;
        let Some(mut record) = self.stream.get_group(correlation_id).await? else {
            tracing::debug!(correlation_id, trace_id = %trace.id, "No group to continue");
            return Ok(());
        };
        if !record.add_member(&trace.id) {
            return Ok(());
        }

        let members = self.stream.members(&record).await?;
        record.recompute(&members);
        self.stream.save_group(&record, &members).await
    }

    /// Recomputes the group of an updated trace, if it has one.
    async fn refresh_group(&self, trace: &Trace) -> Result<(), StoreError> {
        let Some(correlation_id) = trace.correlation_id.as_deref() else {
            return Ok(());
        };

        let _guard = self.group_locks.lock(correlation_id).await;
        let Some(mut record) = self.stream.get_group(correlation_id).await? else {
            return Ok(());
        };

        record.last_activity = now_ms();
        let members = self.stream.members(&record).await?;
        record.recompute(&members);
        self.stream.save_group(&record, &members).await
    }

    /// Appends a log line to a step's details.
    pub async fn add_log_entry(
        &self,
        trace_id: &str,
        step_name: &str,
        entry: NewLogEntry,
    ) -> Result<(), StoreError> {
        let _guard = self.trace_locks.lock(trace_id).await;

        let Some(mut trace) = self.stream.get_trace(trace_id).await? else {
            return Ok(());
        };
        let Some(details) = trace
            .step_mut(step_name)
            .and_then(|step| step.details.as_mut())
        else {
            return Ok(());
        };

        details.logs.push(LogEntry {
            id: record_id(trace_id, step_name, RecordKind::Log, details.logs.len()),
            timestamp: entry.timestamp,
            level: entry.level,
            message: entry.message,
            metadata: entry.metadata,
        });

        self.stream.save_trace(&trace).await
    }

    /// Deletes every trace that started before `cutoff` and detaches it from its group.
    ///
    /// A failure on one trace is logged and the pass continues with the next.
    pub async fn evict_older_than(&self, cutoff: i64) -> Result<EvictionReport, StoreError> {
        let mut report = EvictionReport::default();

        let stale: Vec<Trace> = self
            .stream
            .all_traces()
            .await?
            .into_iter()
            .filter(|t| t.start_time < cutoff)
            .collect();

        for trace in stale {
            match self.evict_trace(&trace).await {
                Ok(Some(group_deleted)) => {
                    report.traces_evicted += 1;
                    if group_deleted {
                        report.groups_deleted += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(trace_id = %trace.id, "Failed to evict trace: {}", e),
            }
            self.trace_locks.forget(&trace.id);
        }

        Ok(report)
    }

    /// Returns `None` if the trace was already gone, else whether its group was deleted.
    ///
    /// Group membership comes from the deleted record, not the scan snapshot.
    async fn evict_trace(&self, stale: &Trace) -> Result<Option<bool>, StoreError> {
        let _guard = self.trace_locks.lock(&stale.id).await;

        let Some(trace) = self.stream.delete_trace(&stale.id).await? else {
            return Ok(None);
        };
        tracing::debug!(trace_id = %trace.id, start_time = trace.start_time, "Evicted trace");

        let Some(correlation_id) = trace.correlation_id.as_deref() else {
            return Ok(Some(false));
        };

        let group_guard = self.group_locks.lock(correlation_id).await;
        let Some(mut record) = self.stream.get_group(correlation_id).await? else {
            return Ok(Some(false));
        };

        record.remove_member(&trace.id);
        if record.trace_ids.is_empty() {
            self.stream.delete_group(correlation_id).await?;
            drop(group_guard);
            self.group_locks.forget(correlation_id);
            return Ok(Some(true));
        }

        let members = self.stream.members(&record).await?;
        record.recompute(&members);
        self.stream.save_group(&record, &members).await?;
        Ok(Some(false))
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
