//! Filtering, ordering and summary statistics over stored aggregates.

use crate::trace::{GroupStatus, Trace, TraceFilter, TraceGroup, TraceSearchResult, TraceStats, TraceStatus};

/// Applies `filter` to the given traces and groups.
///
/// Traces sort newest-first by start time, groups by last activity. `total`
/// counts every matching trace before truncation to the limit.
pub fn search(
    traces: Vec<Trace>,
    groups: Vec<TraceGroup>,
    filter: &TraceFilter,
    default_limit: usize,
) -> TraceSearchResult {
    let limit = filter.limit.unwrap_or(default_limit);

    let mut traces: Vec<Trace> = traces.into_iter().filter(|t| trace_matches(t, filter)).collect();
    let mut groups: Vec<TraceGroup> = groups.into_iter().filter(|g| group_matches(g, filter)).collect();

    traces.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    groups.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

    let total = traces.len();
    let has_more = traces.len() > limit || groups.len() > limit;

    traces.truncate(limit);
    groups.truncate(limit);

    TraceSearchResult {
        traces,
        groups,
        total,
        has_more,
    }
}

fn trace_matches(trace: &Trace, filter: &TraceFilter) -> bool {
    if let Some(flow) = &filter.flow_name {
        if !trace.flow_name.contains(flow.as_str()) {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if trace.status != status {
            return false;
        }
    }
    if let Some(step) = &filter.step_name {
        if !trace.steps.iter().any(|s| s.name.contains(step.as_str())) {
            return false;
        }
    }
    if let Some(cid) = &filter.correlation_id {
        if trace.correlation_id.as_deref() != Some(cid.as_str()) {
            return false;
        }
    }
    if let Some(range) = &filter.start_time {
        if range.from.is_some_and(|from| trace.start_time < from) {
            return false;
        }
        if range.to.is_some_and(|to| trace.start_time > to) {
            return false;
        }
    }
    true
}

/// Groups match on status (by name) and correlation id only.
fn group_matches(group: &TraceGroup, filter: &TraceFilter) -> bool {
    if let Some(status) = filter.status {
        if group.status.as_str() != status.as_str() {
            return false;
        }
    }
    if let Some(cid) = &filter.correlation_id {
        if &group.id != cid {
            return false;
        }
    }
    true
}

pub fn stats(traces: &[Trace], groups: &[TraceGroup]) -> TraceStats {
    let count = |status: TraceStatus| traces.iter().filter(|t| t.status == status).count();

    let durations: Vec<i64> = traces.iter().filter_map(|t| t.duration).collect();
    let average_duration = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<i64>() as f64 / durations.len() as f64
    };

    TraceStats {
        total_traces: traces.len(),
        total_groups: groups.len(),
        running_traces: count(TraceStatus::Running),
        completed_traces: count(TraceStatus::Completed),
        failed_traces: count(TraceStatus::Failed),
        active_groups: groups.iter().filter(|g| g.status == GroupStatus::Active).count(),
        average_duration,
    }
}
