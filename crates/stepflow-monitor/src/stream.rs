//! Typed access to traces and groups with push notification on write.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::store::{StateStore, StoreError, GROUPS, TRACES};
use crate::trace::{GroupRecord, Trace, TraceGroup};

/// Notification pushed on the observability channel after every persisted write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    ObservabilityEvent(Trace),
    ObservabilityGroupEvent(TraceGroup),
}

/// Reads and writes aggregates through a [`StateStore`].
pub struct ObservabilityStream {
    store: Arc<dyn StateStore>,
    sender: broadcast::Sender<StreamMessage>,
}

impl ObservabilityStream {
    pub fn new(store: Arc<dyn StateStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { store, sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.sender.subscribe()
    }

    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<Trace>, StoreError> {
        decode(self.store.get(TRACES, trace_id).await?)
    }

    pub async fn save_trace(&self, trace: &Trace) -> Result<(), StoreError> {
        self.store
            .set(TRACES, &trace.id, serde_json::to_value(trace)?)
            .await?;
        self.publish(StreamMessage::ObservabilityEvent(trace.clone()));
        Ok(())
    }

    pub async fn delete_trace(&self, trace_id: &str) -> Result<Option<Trace>, StoreError> {
        decode(self.store.delete(TRACES, trace_id).await?)
    }

    pub async fn all_traces(&self) -> Result<Vec<Trace>, StoreError> {
        Ok(decode_all(TRACES, self.store.get_group(TRACES).await?))
    }

    pub async fn get_group(&self, correlation_id: &str) -> Result<Option<GroupRecord>, StoreError> {
        decode(self.store.get(GROUPS, correlation_id).await?)
    }

    /// Persists the record and publishes the materialized group.
    pub async fn save_group(&self, record: &GroupRecord, members: &[Trace]) -> Result<(), StoreError> {
        self.store
            .set(GROUPS, &record.correlation_id, serde_json::to_value(record)?)
            .await?;
        let view = TraceGroup::from_record(record.clone(), members.to_vec());
        self.publish(StreamMessage::ObservabilityGroupEvent(view));
        Ok(())
    }

    pub async fn delete_group(&self, correlation_id: &str) -> Result<Option<GroupRecord>, StoreError> {
        decode(self.store.delete(GROUPS, correlation_id).await?)
    }

    pub async fn all_groups(&self) -> Result<Vec<GroupRecord>, StoreError> {
        Ok(decode_all(GROUPS, self.store.get_group(GROUPS).await?))
    }

    /// Loads the member traces of a group, skipping ids with no stored trace.
    pub async fn members(&self, record: &GroupRecord) -> Result<Vec<Trace>, StoreError> {
        let mut traces = Vec::with_capacity(record.trace_ids.len());
        for id in &record.trace_ids {
            if let Some(trace) = self.get_trace(id).await? {
                traces.push(trace);
            }
        }
        Ok(traces)
    }

    /// Joins a group record with its live member traces.
    pub async fn materialize(&self, record: GroupRecord) -> Result<TraceGroup, StoreError> {
        let traces = self.members(&record).await?;
        Ok(TraceGroup::from_record(record, traces))
    }

    fn publish(&self, message: StreamMessage) {
        // No receivers is the common case.
        let _ = self.sender.send(message);
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Option<Value>) -> Result<Option<T>, StoreError> {
    value.map(serde_json::from_value).transpose().map_err(Into::into)
}

/// Decodes a namespace scan. Records that no longer decode are logged and skipped.
fn decode_all<T: serde::de::DeserializeOwned>(namespace: &str, values: Vec<Value>) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(namespace, "Skipping undecodable record: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ObservabilityEvent;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_save_trace_notifies_subscribers() {
        let stream = ObservabilityStream::new(Arc::new(MemoryStore::new()), 8);
        let mut rx = stream.subscribe();

        let trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1));
        stream.save_trace(&trace).await.unwrap();

        match rx.recv().await.unwrap() {
            StreamMessage::ObservabilityEvent(t) => assert_eq!(t.id, "t1"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(stream.get_trace("t1").await.unwrap(), Some(trace));
    }

    #[tokio::test]
    async fn test_save_without_subscribers() {
        let stream = ObservabilityStream::new(Arc::new(MemoryStore::new()), 8);
        let trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1));
        stream.save_trace(&trace).await.unwrap();
    }

    #[tokio::test]
    async fn test_materialize_skips_missing_members() {
        let stream = ObservabilityStream::new(Arc::new(MemoryStore::new()), 8);
        let trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1));
        stream.save_trace(&trace).await.unwrap();

        let mut record = GroupRecord::seeded("c1", &trace);
        record.add_member("gone");
        stream.save_group(&record, &[trace.clone()]).await.unwrap();

        let stored = stream.get_group("c1").await.unwrap().unwrap();
        let group = stream.materialize(stored).await.unwrap();
        assert_eq!(group.traces, vec![trace]);
    }

    #[tokio::test]
    async fn test_scan_skips_undecodable_records() {
        let store = Arc::new(MemoryStore::new());
        let stream = ObservabilityStream::new(store.clone(), 8);
        let trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1));
        stream.save_trace(&trace).await.unwrap();
        store
            .set(TRACES, "junk", serde_json::json!({"id": "junk"}))
            .await
            .unwrap();
        store
            .set(GROUPS, "junk", serde_json::json!(42))
            .await
            .unwrap();

        assert_eq!(stream.all_traces().await.unwrap(), vec![trace]);
        assert!(stream.all_groups().await.unwrap().is_empty());
    }

    #[test]
    fn test_message_wire_shape() {
        let trace = Trace::from_event(&ObservabilityEvent::step_start("t1", "a", 1));
        let value = serde_json::to_value(StreamMessage::ObservabilityEvent(trace)).unwrap();
        assert_eq!(value["type"], "observability_event");
        assert_eq!(value["data"]["id"], "t1");
    }
}
