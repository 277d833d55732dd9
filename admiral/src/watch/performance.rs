//! The performance controller: probes a target once per whitelisted container.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::info;

use super::Watcher;
use crate::{
    backend::http::{get, HttpClient},
    state::SharedState,
};

/// Fires one HTTP probe per (app, container) the first time the container is
/// seen Running, and reports the result on the text channel.
pub struct PerformanceWatcher {
    state: Arc<SharedState>,
    tx: mpsc::Sender<String>,
    apps: Vec<String>,
    target_url: String,
    client: HttpClient,
    tested: HashSet<String>,
}

impl PerformanceWatcher {
    /// Builds the prober. Pods outside the `apps` whitelist are never probed.
    pub fn new(
        state: Arc<SharedState>,
        tx: mpsc::Sender<String>,
        apps: Vec<String>,
        target_url: String,
        client: HttpClient,
    ) -> Self {
        Self {
            state,
            tx,
            apps,
            target_url,
            client,
            tested: HashSet::new(),
        }
    }

    fn app_of<'a>(&self, pod: &'a Pod) -> Option<&'a String> {
        let app = pod.labels().get("app")?;
        self.apps.contains(app).then_some(app)
    }
}

#[async_trait]
impl Watcher<Pod> for PerformanceWatcher {
    async fn apply(&mut self, pod: &Pod) {
        let Some(app) = self.app_of(pod) else {
            return;
        };
        let running = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running");
        if !running {
            return;
        }
        let app = app.clone();
        for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
            let key = format!("{app}.{}", container.name);
            if !self.tested.insert(key.clone()) {
                continue;
            }
            info!(target = %self.target_url, %key, "running performance probe");
            match get(&self.client, &self.target_url).await {
                Ok((status, _body)) => {
                    let report =
                        format!("performance probe {key}: {status} from {}", self.target_url);
                    let _ = self.tx.send(report).await;
                }
                Err(err) => self.state.error(err),
            }
        }
    }

    async fn delete(&mut self, _pod: &Pod) {}
}
