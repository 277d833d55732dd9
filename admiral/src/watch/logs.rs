//! The log controller: dispatches pod lifecycle transitions onto log streams.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Watcher;
use crate::{
    backend::RawLog,
    config::WatcherSpec,
    error::Error,
    state::{SharedState, StreamId, StreamState},
    stream::log::{KubeLogSource, LogStream},
};

const POD_RUNNING: &str = "Running";
const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

/// Owns the map of active log streams and enforces at most one stream task
/// per (namespace, pod, container) identity.
pub struct LogWatcher {
    state: Arc<SharedState>,
    tx: mpsc::Sender<RawLog>,
    pod_annotation: Option<String>,
    ignore_annotation: Option<String>,
    time_key_annotation: Option<String>,
    ignore_containers: Vec<String>,
    apps: Vec<String>,
    backoff: Duration,
    token: CancellationToken,
    /// Shared with the per-stream supervisor tasks, which clean dead entries
    /// out after a panic.
    streams: Arc<Mutex<HashMap<StreamId, CancellationToken>>>,
}

impl LogWatcher {
    /// Builds the controller from its watcher configuration.
    pub fn new(
        spec: &WatcherSpec,
        state: Arc<SharedState>,
        tx: mpsc::Sender<RawLog>,
        token: CancellationToken,
    ) -> Self {
        Self {
            state,
            tx,
            pod_annotation: spec.pod_annotation.clone(),
            ignore_annotation: spec.ignore_container_annotation.clone(),
            time_key_annotation: spec.time_key_annotation.clone(),
            ignore_containers: spec.ignore_containers.clone(),
            apps: spec.apps.clone(),
            backoff: spec.backoff(),
            token,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Watches a stream task's handle. A panicked task is reported and its
    /// identity released, so the next informer event can start over.
    fn supervise(&self, id: StreamId, handle: JoinHandle<()>) {
        let state = Arc::clone(&self.state);
        let streams = Arc::clone(&self.streams);
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                state.error(Error::StreamRead {
                    id: id.clone(),
                    source: std::io::Error::other(err),
                });
                streams.lock().remove(&id);
                state.delete(id);
            }
        });
    }

    /// Whether this pod is ours to watch at all.
    fn selected(&self, pod: &Pod) -> bool {
        if let Some(key) = &self.pod_annotation {
            if !pod.annotations().contains_key(key) {
                return false;
            }
        }
        if !self.apps.is_empty() {
            let app = pod.labels().get("app");
            if !app.is_some_and(|app| self.apps.iter().any(|wanted| wanted == app)) {
                return false;
            }
        }
        true
    }

    fn ignored(&self, annotation_csv: &str, container: &str) -> bool {
        self.ignore_containers.iter().any(|c| c == container)
            || annotation_csv.split(',').map(str::trim).any(|c| c == container)
    }

    fn start_containers(&mut self, pod: &Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let annotations = pod.annotations();
        let ignore_csv = self
            .ignore_annotation
            .as_ref()
            .and_then(|key| annotations.get(key))
            .cloned()
            .unwrap_or_default();
        let time_key = self
            .time_key_annotation
            .as_ref()
            .and_then(|key| annotations.get(key))
            .cloned();

        for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
            if self.ignored(&ignore_csv, &container.name) {
                continue;
            }
            let id = StreamId::log(namespace.as_str(), name.as_str(), container.name.as_str());
            if self.streams.lock().contains_key(&id) {
                continue;
            }
            if self.state.get(&id) == Some(StreamState::Running) {
                continue;
            }
            info!(%id, "starting log stream");
            self.state.set(id.clone(), StreamState::Running);

            let child = self.token.child_token();
            let source = KubeLogSource::new(self.state.client(), container.name.as_str());
            let stream = LogStream::new(
                id.clone(),
                pod.labels(),
                time_key.clone(),
                Arc::clone(&self.state),
                self.tx.clone(),
                Box::new(source),
                child.clone(),
            )
            .with_backoff(self.backoff);
            self.streams.lock().insert(id.clone(), child);
            let handle = tokio::spawn(stream.run());
            self.supervise(id, handle);
        }
    }

    /// Advisory: streams drain what they already read, then stop re-opening.
    fn finish_containers(&mut self, pod: &Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
            let id = StreamId::log(namespace.as_str(), name.as_str(), container.name.as_str());
            if self.streams.lock().contains_key(&id) {
                info!(%id, "finishing log stream");
                self.state.set(id, StreamState::Finished);
            }
        }
    }

    /// Forceful: the upstream read is cancelled and the registry entry removed,
    /// so a re-created pod starts a fresh lifecycle.
    fn delete_containers(&mut self, pod: &Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
            let id = StreamId::log(namespace.as_str(), name.as_str(), container.name.as_str());
            if let Some(stream_token) = self.streams.lock().remove(&id) {
                info!(%id, "deleting log stream");
                stream_token.cancel();
                self.state.delete(id);
            }
        }
    }
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

#[async_trait]
impl Watcher<Pod> for LogWatcher {
    async fn apply(&mut self, pod: &Pod) {
        if !self.selected(pod) {
            return;
        }
        match phase(pod) {
            Some(POD_RUNNING) => self.start_containers(pod),
            Some(POD_SUCCEEDED | POD_FAILED) => self.finish_containers(pod),
            _ => {}
        }
    }

    async fn delete(&mut self, pod: &Pod) {
        if !self.selected(pod) {
            return;
        }
        self.delete_containers(pod);
    }

    async fn shutdown(&mut self) {
        for (id, stream_token) in self.streams.lock().drain() {
            stream_token.cancel();
            self.state.set(id, StreamState::Deleted);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::WatcherKind;

    fn spec() -> WatcherSpec {
        serde_json::from_value(json!({
            "type": "logs",
            "podAnnotation": "admiral.io/watch",
            "ignoreContainerAnnotation": "admiral.io/ignore",
        }))
        .expect("watcher spec")
    }

    fn pod(name: &str, phase: &str, annotations: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "ns",
                "labels": {"app": "demo"},
                "annotations": annotations,
            },
            "spec": {
                "containers": [
                    {"name": "app", "image": "app:1"},
                    {"name": "sidecar", "image": "sidecar:1"},
                ],
            },
            "status": {"phase": phase},
        }))
        .expect("pod fixture")
    }

    async fn watcher_under_test() -> (LogWatcher, Arc<SharedState>, mpsc::Receiver<RawLog>) {
        let state = SharedState::new("test-cluster");
        let (tx, rx) = mpsc::channel(8);
        let watcher = LogWatcher::new(&spec(), Arc::clone(&state), tx, CancellationToken::new());
        (watcher, state, rx)
    }

    #[tokio::test]
    async fn at_most_one_stream_per_identity() {
        let (mut watcher, state, _rx) = watcher_under_test().await;
        let running = pod(
            "web-1",
            "Running",
            json!({"admiral.io/watch": "", "admiral.io/ignore": "sidecar"}),
        );
        watcher.apply(&running).await;
        watcher.apply(&running).await;

        assert_eq!(watcher.streams.lock().len(), 1);
        state.settled().await;
        let id = StreamId::log("ns", "web-1", "app");
        assert_eq!(state.get(&id), Some(StreamState::Running));
    }

    #[tokio::test]
    async fn ignore_annotation_and_cluster_list_skip_containers() {
        let (mut watcher, _state, _rx) = watcher_under_test().await;
        watcher.ignore_containers = vec!["app".to_string()];
        let running = pod(
            "web-1",
            "Running",
            json!({"admiral.io/watch": "", "admiral.io/ignore": "sidecar"}),
        );
        watcher.apply(&running).await;
        assert!(watcher.streams.lock().is_empty(), "both containers are ignored");
    }

    #[tokio::test]
    async fn pods_without_the_filter_annotation_are_invisible() {
        let (mut watcher, _state, _rx) = watcher_under_test().await;
        let unmarked = pod("web-1", "Running", json!({}));
        watcher.apply(&unmarked).await;
        assert!(watcher.streams.lock().is_empty());
    }

    #[tokio::test]
    async fn finished_pods_mark_streams_finished() {
        let (mut watcher, state, _rx) = watcher_under_test().await;
        let marked = json!({"admiral.io/watch": ""});
        watcher.apply(&pod("web-1", "Running", marked.clone())).await;
        watcher.apply(&pod("web-1", "Succeeded", marked)).await;

        state.settled().await;
        let id = StreamId::log("ns", "web-1", "app");
        assert_eq!(state.get(&id), Some(StreamState::Finished));
    }

    #[tokio::test]
    async fn deleted_pods_remove_registry_entries() {
        let (mut watcher, state, _rx) = watcher_under_test().await;
        let marked = json!({"admiral.io/watch": ""});
        watcher.apply(&pod("web-1", "Running", marked.clone())).await;
        watcher.delete(&pod("web-1", "Running", marked)).await;

        state.settled().await;
        let id = StreamId::log("ns", "web-1", "app");
        assert_eq!(state.get(&id), None);
        assert!(watcher.streams.lock().is_empty());
    }

    #[tokio::test]
    async fn shutdown_marks_everything_deleted() {
        let (mut watcher, state, _rx) = watcher_under_test().await;
        watcher
            .apply(&pod("web-1", "Running", json!({"admiral.io/watch": ""})))
            .await;
        watcher.shutdown().await;

        state.settled().await;
        let id = StreamId::log("ns", "web-1", "app");
        assert_eq!(state.get(&id), Some(StreamState::Deleted));
        assert!(watcher.streams.lock().is_empty());
    }

    #[tokio::test]
    async fn panicking_stream_tasks_are_reported_and_released() {
        let (watcher, state, _rx) = watcher_under_test().await;
        let (err_tx, mut err_rx) = mpsc::channel(8);
        state.set_error_sink(err_tx);

        let id = StreamId::log("ns", "web-1", "app");
        state.set(id.clone(), StreamState::Running);
        watcher
            .streams
            .lock()
            .insert(id.clone(), CancellationToken::new());
        let handle = tokio::spawn(async { panic!("bad container") });
        watcher.supervise(id.clone(), handle);

        assert!(matches!(
            err_rx.recv().await.expect("panic is reported"),
            Error::StreamRead { .. }
        ));
        state.settled().await;
        assert!(watcher.streams.lock().is_empty());
        assert_eq!(state.get(&id), None, "identity is free to restart");
    }

    #[test]
    fn watcher_spec_fixture_is_a_logs_watcher() {
        assert_eq!(spec().kind, WatcherKind::Logs);
    }
}
