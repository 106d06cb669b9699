//! Public entry point of the trace engine.

use std::sync::Arc;

use serde_json::Value;
use stepflow_config::{MonitorConfig, StoreConfig};
use tokio::sync::broadcast;

use crate::builder::{now_ms, EvictionReport, TraceBuilder};
use crate::error::MonitorError;
use crate::event::{CorrelationMethod, ObservabilityEvent};
use crate::janitor::{spawn_cleanup_task, JanitorHandle};
use crate::search;
use crate::store::{MemoryStore, SqliteStore, StateStore};
use crate::stream::{ObservabilityStream, StreamMessage};
use crate::trace::{NewLogEntry, Trace, TraceFilter, TraceGroup, TraceSearchResult, TraceStats};

/// Ingests observability events and answers queries over the assembled traces.
///
/// Nothing here returns an error to the caller: failures are logged and reads
/// degrade to `None` or empty results.
pub struct ObservabilityService {
    stream: Arc<ObservabilityStream>,
    builder: TraceBuilder,
    config: MonitorConfig,
}

impl ObservabilityService {
    pub fn new(store: Arc<dyn StateStore>, config: MonitorConfig) -> Self {
        let stream = Arc::new(ObservabilityStream::new(store, config.notify_capacity));
        Self {
            builder: TraceBuilder::new(stream.clone()),
            stream,
            config,
        }
    }

    /// Opens the store selected by `config.store`.
    pub fn from_config(config: MonitorConfig) -> Result<Self, MonitorError> {
        let store: Arc<dyn StateStore> = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Sqlite { path } => {
                tracing::info!(path = %path.display(), "Opening trace store");
                Arc::new(SqliteStore::new(path)?)
            }
        };
        Ok(Self::new(store, config))
    }

    /// Starts the background eviction task at `cleanup_interval_ms`.
    ///
    /// Without a janitor, old traces are only evicted by
    /// [`cleanup_old_traces`](Self::cleanup_old_traces) or `evict_on_ingest`.
    pub fn spawn_janitor(self: &Arc<Self>) -> JanitorHandle {
        spawn_cleanup_task(self.clone(), self.config.cleanup_interval_ms)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Receives a [`StreamMessage`] for every trace and group write.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.stream.subscribe()
    }

    /// Applies one event and returns the resulting trace.
    ///
    /// If the event could not be applied, or references a trace that does not
    /// exist, the returned trace is synthesized from the event alone.
    pub async fn process_event(&self, event: &ObservabilityEvent) -> Trace {
        let applied = self.builder.apply(event).await;

        if self.config.evict_on_ingest {
            self.cleanup_old_traces().await;
        }

        let reloaded = match applied {
            Ok(()) => self.stream.get_trace(&event.trace_id).await,
            Err(e) => Err(e),
        };

        match reloaded {
            Ok(Some(trace)) => trace,
            Ok(None) => Trace::from_event(event),
            Err(e) => {
                tracing::error!(
                    trace_id = %event.trace_id,
                    event_type = %event.event_type,
                    "Failed to process observability event: {}",
                    e
                );
                Trace::from_event(event)
            }
        }
    }

    pub async fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        match self.stream.get_trace(trace_id).await {
            Ok(trace) => trace,
            Err(e) => {
                tracing::warn!(trace_id, "Failed to load trace: {}", e);
                None
            }
        }
    }

    /// Same as [`get_trace`](Self::get_trace); step details are always stored inline.
    pub async fn get_trace_with_details(&self, trace_id: &str) -> Option<Trace> {
        self.get_trace(trace_id).await
    }

    pub async fn get_trace_group(&self, correlation_id: &str) -> Option<TraceGroup> {
        match self.load_group(correlation_id).await {
            Ok(group) => group,
            Err(e) => {
                tracing::warn!(correlation_id, "Failed to load trace group: {}", e);
                None
            }
        }
    }

    async fn load_group(&self, correlation_id: &str) -> Result<Option<TraceGroup>, MonitorError> {
        let Some(record) = self.stream.get_group(correlation_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.stream.materialize(record).await?))
    }

    /// Every stored trace, newest first.
    pub async fn get_all_traces(&self) -> Vec<Trace> {
        match self.stream.all_traces().await {
            Ok(mut traces) => {
                traces.sort_by(|a, b| b.start_time.cmp(&a.start_time));
                traces
            }
            Err(e) => {
                tracing::warn!("Failed to list traces: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn get_all_trace_groups(&self) -> Vec<TraceGroup> {
        match self.load_all_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!("Failed to list trace groups: {}", e);
                Vec::new()
            }
        }
    }

    async fn load_all_groups(&self) -> Result<Vec<TraceGroup>, MonitorError> {
        let records = self.stream.all_groups().await?;
        let mut groups = Vec::with_capacity(records.len());
        for record in records {
            groups.push(self.stream.materialize(record).await?);
        }
        Ok(groups)
    }

    pub async fn search_traces(&self, filter: &TraceFilter) -> TraceSearchResult {
        let traces = self.get_all_traces().await;
        let groups = self.get_all_trace_groups().await;
        search::search(traces, groups, filter, self.config.default_search_limit)
    }

    pub async fn get_stats(&self) -> TraceStats {
        let traces = self.get_all_traces().await;
        let groups = self.get_all_trace_groups().await;
        search::stats(&traces, &groups)
    }

    /// Attaches a log line to a running or finished step.
    pub async fn add_log_entry(&self, trace_id: &str, step_name: &str, entry: NewLogEntry) {
        if let Err(e) = self.builder.add_log_entry(trace_id, step_name, entry).await {
            tracing::warn!(trace_id, step = step_name, "Failed to add log entry: {}", e);
        }
    }

    /// Evicts traces older than `max_trace_age_ms`.
    pub async fn cleanup_old_traces(&self) -> EvictionReport {
        let max_age = i64::try_from(self.config.max_trace_age_ms).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(max_age);
        match self.builder.evict_older_than(cutoff).await {
            Ok(report) => {
                if report.traces_evicted > 0 {
                    tracing::info!(
                        traces_evicted = report.traces_evicted,
                        groups_deleted = report.groups_deleted,
                        "Evicted old traces"
                    );
                }
                report
            }
            Err(e) => {
                tracing::error!("Failed to clean up old traces: {}", e);
                EvictionReport::default()
            }
        }
    }

    /// Places a trace at the root of a correlation group, creating the group if needed.
    pub async fn correlate_trace(
        &self,
        trace_id: &str,
        correlation_id: &str,
        method: CorrelationMethod,
        context: Option<Value>,
    ) -> Trace {
        let mut event = ObservabilityEvent::correlation_start(trace_id, correlation_id, now_ms());
        event.metadata.correlation_method = Some(method);
        event.metadata.correlation_context = context;
        self.process_event(&event).await
    }

    /// Links a child trace to its parent's existing correlation group.
    pub async fn continue_correlation(
        &self,
        trace_id: &str,
        correlation_id: &str,
        parent_trace_id: &str,
    ) -> Trace {
        let event = ObservabilityEvent::correlation_continue(
            trace_id,
            correlation_id,
            parent_trace_id,
            now_ms(),
        );
        self.process_event(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::trace::{TraceStats, TraceStatus};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Store whose every call fails.
    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        async fn get(&self, _group_id: &str, _id: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Lock)
        }

        async fn set(&self, _group_id: &str, _id: &str, _data: Value) -> Result<Value, StoreError> {
            Err(StoreError::Lock)
        }

        async fn delete(&self, _group_id: &str, _id: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Lock)
        }

        async fn get_group(&self, _group_id: &str) -> Result<Vec<Value>, StoreError> {
            Err(StoreError::Lock)
        }
    }

    fn service() -> ObservabilityService {
        ObservabilityService::new(Arc::new(MemoryStore::new()), MonitorConfig::default())
    }

    #[tokio::test]
    async fn test_process_event_returns_current_trace() {
        let svc = service();
        let trace = svc
            .process_event(&ObservabilityEvent::step_start("t1", "orders-create", 1000))
            .await;
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.status, TraceStatus::Running);
    }

    #[tokio::test]
    async fn test_process_event_synthesizes_for_unknown_trace() {
        let svc = service();
        let trace = svc
            .process_event(&ObservabilityEvent::step_end("ghost", "a", 1000, 10, true))
            .await;
        assert_eq!(trace.id, "ghost");
        assert!(trace.steps.is_empty());
        assert!(svc.get_trace("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_correlate_trace_helper() {
        let svc = service();
        svc.process_event(&ObservabilityEvent::step_start("t1", "orders-create", now_ms()))
            .await;
        let trace = svc
            .correlate_trace(
                "t1",
                "c1",
                CorrelationMethod::Automatic,
                Some(serde_json::json!({"tenant": "acme"})),
            )
            .await;

        assert_eq!(trace.correlation_id.as_deref(), Some("c1"));
        let group = svc.get_trace_group("c1").await.unwrap();
        assert_eq!(group.traces.len(), 1);
        assert_eq!(group.name, "orders Flow");
    }

    #[tokio::test]
    async fn test_from_config_opens_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig::default().with_store(StoreConfig::Sqlite {
            path: dir.path().join("traces.db"),
        });
        let svc = ObservabilityService::from_config(config).unwrap();
        svc.process_event(&ObservabilityEvent::step_start("t1", "a", 1)).await;
        assert!(svc.get_trace("t1").await.is_some());
    }

    #[tokio::test]
    async fn test_store_failures_degrade() {
        let config = MonitorConfig::default().with_evict_on_ingest(true);
        let svc = ObservabilityService::new(Arc::new(FailingStore), config);

        let event = ObservabilityEvent::step_start("t1", "orders-create", 1000);
        assert_eq!(svc.process_event(&event).await, Trace::from_event(&event));

        assert!(svc.get_trace("t1").await.is_none());
        assert!(svc.get_trace_with_details("t1").await.is_none());
        assert!(svc.get_trace_group("c1").await.is_none());
        assert!(svc.get_all_traces().await.is_empty());
        assert!(svc.get_all_trace_groups().await.is_empty());
        assert_eq!(svc.get_stats().await, TraceStats::default());
        assert_eq!(svc.search_traces(&TraceFilter::default()).await.total, 0);
        assert_eq!(svc.cleanup_old_traces().await, EvictionReport::default());
        svc.add_log_entry("t1", "orders-create", NewLogEntry::new(1, Default::default(), "x"))
            .await;
    }

    #[tokio::test]
    async fn test_huge_max_age_evicts_nothing() {
        let config = MonitorConfig::default().with_max_trace_age_ms(u64::MAX);
        let svc = ObservabilityService::new(Arc::new(MemoryStore::new()), config);
        svc.process_event(&ObservabilityEvent::step_start("t1", "a", 0)).await;

        assert_eq!(svc.cleanup_old_traces().await, EvictionReport::default());
        assert!(svc.get_trace("t1").await.is_some());

        let config = MonitorConfig::default().with_max_trace_age_ms(1 << 63);
        let svc = ObservabilityService::new(Arc::new(MemoryStore::new()), config);
        svc.process_event(&ObservabilityEvent::step_start("t1", "a", 0)).await;
        assert_eq!(svc.cleanup_old_traces().await.traces_evicted, 0);
    }

    #[tokio::test]
    async fn test_evict_on_ingest_runs_before_reload() {
        let config = MonitorConfig::default()
            .with_max_trace_age_ms(1000)
            .with_evict_on_ingest(true);
        let svc = ObservabilityService::new(Arc::new(MemoryStore::new()), config);

        let event = ObservabilityEvent::step_start("old", "a", now_ms() - 5000);
        let trace = svc.process_event(&event).await;

        assert!(svc.get_trace("old").await.is_none());
        assert_eq!(trace, Trace::from_event(&event));
        assert!(trace.steps.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_janitor_uses_configured_interval() {
        let config = MonitorConfig::default()
            .with_max_trace_age_ms(1000)
            .with_cleanup_interval_ms(10);
        let svc = Arc::new(ObservabilityService::new(Arc::new(MemoryStore::new()), config));
        svc.process_event(&ObservabilityEvent::step_start("stale", "a", now_ms() - 60_000))
            .await;
        svc.process_event(&ObservabilityEvent::step_start("fresh", "a", now_ms()))
            .await;

        let janitor = svc.spawn_janitor();
        assert!(janitor.is_running());
        for _ in 0..100 {
            if svc.get_trace("stale").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        janitor.shutdown().await;

        assert!(svc.get_trace("stale").await.is_none());
        assert!(svc.get_trace("fresh").await.is_some());
    }
}
