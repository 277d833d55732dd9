//! The event filter: formats and forwards cluster events that pass a reason
//! filter and postdate agent startup.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use tokio::sync::mpsc;

use super::Watcher;
use crate::state::SharedState;

/// Forwards selected cluster events as formatted text.
///
/// The filter is matched against `Event.reason`, the stable machine-readable
/// field. Events created at or before the agent's init timestamp are dropped:
/// the agent reports what happens while it watches, not cluster history.
pub struct EventWatcher {
    state: Arc<SharedState>,
    tx: mpsc::Sender<String>,
    filter: Vec<String>,
}

impl EventWatcher {
    /// Builds the filter. An empty `filter` forwards every fresh event.
    pub fn new(state: Arc<SharedState>, tx: mpsc::Sender<String>, filter: Vec<String>) -> Self {
        Self { state, tx, filter }
    }

    fn in_filter(&self, reason: &str) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|wanted| wanted == reason)
    }

    fn format(&self, event: &Event) -> String {
        let timestamp = event
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339())
            .unwrap_or_default();
        format!(
            "cluster: {}\nnamespace: {}\nobject: {}\nreason: {}\nmessage: {}\ntimestamp: {}",
            self.state.cluster(),
            event.metadata.namespace.as_deref().unwrap_or_default(),
            event.involved_object.name.as_deref().unwrap_or_default(),
            event.reason.as_deref().unwrap_or_default(),
            event.message.as_deref().unwrap_or_default(),
            timestamp,
        )
    }
}

#[async_trait]
impl Watcher<Event> for EventWatcher {
    async fn apply(&mut self, event: &Event) {
        let Some(created) = event.metadata.creation_timestamp.as_ref() else {
            return;
        };
        if created.0 <= self.state.init_timestamp() {
            return;
        }
        let Some(reason) = event.reason.as_deref() else {
            return;
        };
        if !self.in_filter(reason) {
            return;
        }
        let _ = self.tx.send(self.format(event)).await;
    }

    /// Cluster events are write-once; nothing to clean up.
    async fn delete(&mut self, _event: &Event) {}
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::*;

    fn event(reason: &str, message: &str, created: chrono::DateTime<Utc>) -> Event {
        serde_json::from_value(json!({
            "metadata": {
                "name": format!("{reason}.176"),
                "namespace": "ns",
                "creationTimestamp": created.to_rfc3339(),
            },
            "involvedObject": {"kind": "Pod", "name": "web-1"},
            "reason": reason,
            "message": message,
        }))
        .expect("event fixture")
    }

    async fn watcher_under_test(filter: &[&str]) -> (EventWatcher, mpsc::Receiver<String>) {
        let state = SharedState::new("c1");
        let (tx, rx) = mpsc::channel(8);
        let watcher = EventWatcher::new(state, tx, filter.iter().map(|s| s.to_string()).collect());
        (watcher, rx)
    }

    #[tokio::test]
    async fn events_created_before_startup_are_dropped() {
        let (mut watcher, mut rx) = watcher_under_test(&[]).await;
        let stale = watcher.state.init_timestamp() - Duration::nanoseconds(1);
        watcher.apply(&event("NodeNotReady", "node gone", stale)).await;
        assert!(rx.try_recv().is_err(), "stale event must be dropped");

        // The boundary itself is also dropped: strictly-newer events pass.
        let boundary = watcher.state.init_timestamp();
        watcher.apply(&event("NodeNotReady", "node gone", boundary)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_filtered_reasons_pass() {
        let (mut watcher, mut rx) = watcher_under_test(&["FailedScheduling"]).await;
        let fresh = Utc::now() + Duration::seconds(5);
        watcher
            .apply(&event("FailedScheduling", "0/3 nodes available", fresh))
            .await;
        watcher.apply(&event("ImagePulled", "pulled", fresh)).await;

        let text = rx.try_recv().expect("one event passes");
        assert!(text.contains("FailedScheduling"));
        assert!(text.contains("cluster: c1"));
        assert!(text.contains("object: web-1"));
        assert!(rx.try_recv().is_err(), "exactly one event passes");
    }

    #[tokio::test]
    async fn an_empty_filter_forwards_every_fresh_event() {
        let (mut watcher, mut rx) = watcher_under_test(&[]).await;
        let fresh = Utc::now() + Duration::seconds(5);
        watcher.apply(&event("NodeReady", "ready", fresh)).await;
        assert!(rx.try_recv().is_ok());
    }
}
