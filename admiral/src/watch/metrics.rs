//! The metric controller: one scraper per running pod.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Watcher;
use crate::{
    config::WatcherSpec,
    error::Error,
    state::{SharedState, StreamId, StreamState},
    stream::metric::{MetricBatch, MetricStream},
};

const POD_RUNNING: &str = "Running";
const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

/// Owns the map of active metric streams, keyed on pod name.
pub struct MetricWatcher {
    state: Arc<SharedState>,
    tx: mpsc::Sender<MetricBatch>,
    pod_annotation: Option<String>,
    apps: Vec<String>,
    token: CancellationToken,
    /// Shared with the per-stream supervisor tasks, which clean dead entries
    /// out after a panic.
    streams: Arc<Mutex<HashMap<StreamId, CancellationToken>>>,
}

impl MetricWatcher {
    /// Builds the controller from its watcher configuration.
    pub fn new(
        spec: &WatcherSpec,
        state: Arc<SharedState>,
        tx: mpsc::Sender<MetricBatch>,
        token: CancellationToken,
    ) -> Self {
        Self {
            state,
            tx,
            pod_annotation: spec.pod_annotation.clone(),
            apps: spec.apps.clone(),
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
                state.error(Error::Scrape {
                    id: id.clone(),
                    reason: err.to_string(),
                });
                streams.lock().remove(&id);
                state.delete(id);
            }
        });
    }

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

    fn start_stream(&mut self, pod: &Pod) {
        let name = pod.name_any();
        let id = StreamId::metric(name.as_str());
        if self.streams.lock().contains_key(&id) {
            return;
        }
        if self.state.get(&id) == Some(StreamState::Running) {
            return;
        }
        let Some(node) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) else {
            debug!(pod = %name, "pod has no node yet, skipping metric stream");
            return;
        };
        let containers = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .map(|container| container.name.clone())
            .collect();

        info!(%id, %node, "starting metric stream");
        self.state.set(id.clone(), StreamState::Running);
        let child = self.token.child_token();
        let stream = MetricStream::new(
            id.clone(),
            pod.namespace().unwrap_or_default(),
            node,
            containers,
            Arc::clone(&self.state),
            self.tx.clone(),
            child.clone(),
        );
        self.streams.lock().insert(id.clone(), child);
        let handle = tokio::spawn(stream.run());
        self.supervise(id, handle);
    }

    fn finish_stream(&mut self, pod: &Pod) {
        let id = StreamId::metric(pod.name_any().as_str());
        if self.streams.lock().contains_key(&id) {
            info!(%id, "finishing metric stream");
            self.state.set(id, StreamState::Finished);
        }
    }

    fn delete_stream(&mut self, pod: &Pod) {
        let id = StreamId::metric(pod.name_any().as_str());
        if let Some(stream_token) = self.streams.lock().remove(&id) {
            info!(%id, "deleting metric stream");
            stream_token.cancel();
            self.state.delete(id);
        }
    }
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

#[async_trait]
impl Watcher<Pod> for MetricWatcher {
    async fn apply(&mut self, pod: &Pod) {
        if !self.selected(pod) {
            return;
        }
        match phase(pod) {
            Some(POD_RUNNING) => self.start_stream(pod),
            Some(POD_SUCCEEDED | POD_FAILED) => self.finish_stream(pod),
            _ => {}
        }
    }

    async fn delete(&mut self, pod: &Pod) {
        if !self.selected(pod) {
            return;
        }
        self.delete_stream(pod);
    }

    async fn shutdown(&mut self) {
        for (id, stream_token) in self.streams.lock().drain() {
            stream_token.cancel();
            self.state.set(id, StreamState::Deleted);
        }
    }
}
