//! Trace assembly for step-based workflows.
//!
//! Steps emit [`ObservabilityEvent`]s as they run. [`ObservabilityService`]
//! folds those events into [`Trace`] aggregates (steps, operation records,
//! logs) and links traces that share a correlation id into [`TraceGroup`]s.
//! Aggregates live in a [`StateStore`]; every write is also pushed to
//! subscribers as a [`StreamMessage`].
//!
//! Old traces are evicted by [`ObservabilityService::spawn_janitor`], by
//! explicit `cleanup_old_traces` calls, or after every event when
//! `evict_on_ingest` is set.

mod builder;
mod error;
mod event;
mod janitor;
mod lock;
mod search;
mod service;
mod store;
mod stream;
mod trace;

pub use builder::{now_ms, EvictionReport};
pub use error::MonitorError;
pub use event::{
    CorrelationMethod, ErrorCode, EventMetadata, EventType, ObservabilityEvent, OperationKind,
    StepError, SYSTEM_STEP,
};
pub use janitor::{spawn_cleanup_task, JanitorHandle};
pub use service::ObservabilityService;
pub use store::{MemoryStore, SqliteStore, StateStore, StoreError, GROUPS, TRACES};
pub use stream::StreamMessage;
pub use trace::{
    EmitOperation, EntryPoint, EntryPointType, GroupMetadata, GroupRecord, GroupStatus, LogEntry,
    LogLevel, NewLogEntry, OperationCounts, StateOperation, StepDetails, StepStatus,
    StreamOperation, TimeRange, Trace, TraceFilter, TraceGroup, TraceMetadata, TraceSearchResult,
    TraceStats, TraceStatus, TraceStep, UNKNOWN_FLOW,
};

pub use stepflow_config::{MonitorConfig, StoreConfig};
