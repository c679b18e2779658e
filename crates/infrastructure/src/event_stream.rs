use async_trait::async_trait;
use chaos_core::models::TraceEvent;
use chaos_core::traits::{CoordinationStore, EventPublisher};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

/// 将结构化事件追加到协调存储中的事件流
pub struct StreamEventPublisher {
    store: Arc<dyn CoordinationStore>,
    stream_key: String,
    max_len: u64,
}

impl StreamEventPublisher {
    pub fn new(store: Arc<dyn CoordinationStore>, stream_key: impl Into<String>, max_len: u64) -> Self {
        Self {
            store,
            stream_key: stream_key.into(),
            max_len,
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

#[async_trait]
impl EventPublisher for StreamEventPublisher {
    async fn publish(&self, event: TraceEvent) {
        let fields = event.to_stream_fields();
        match self
            .store
            .stream_append(&self.stream_key, &fields, self.max_len)
            .await
        {
            Ok(id) => {
                counter!("trace_events_published_total", "event" => event.event_name.as_str())
                    .increment(1);
                debug!(
                    stream = %self.stream_key,
                    entry_id = %id,
                    event = %event.event_name,
                    trace_id = %event.trace_id,
                    "Published trace event"
                );
            }
            Err(e) => {
                counter!("trace_events_publish_errors_total").increment(1);
                warn!(
                    stream = %self.stream_key,
                    event = %event.event_name,
                    trace_id = %event.trace_id,
                    "Failed to publish trace event: {}",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryCoordinationStore;
    use chaos_core::models::EventName;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_appends_to_stream() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let publisher = StreamEventPublisher::new(store.clone(), "events", 100);

        publisher
            .publish(TraceEvent::new(EventName::NamespaceLocked, "trace-1", json!({"namespace": "ns-0"})))
            .await;
        publisher
            .publish(TraceEvent::new(EventName::NamespaceReleased, "trace-1", json!({})))
            .await;

        assert_eq!(store.stream_len("events").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store.set_unavailable(true);
        let publisher = StreamEventPublisher::new(store.clone(), "events", 100);

        publisher
            .publish(TraceEvent::new(EventName::TaskStarted, "trace-2", json!({})))
            .await;

        store.set_unavailable(false);
        assert_eq!(store.stream_len("events").await.unwrap(), 0);
    }
}
