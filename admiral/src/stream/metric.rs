//! Per-pod resource metric scraping.
//!
//! One [`MetricStream`] per pod polls the node's `resource` and `cadvisor`
//! exposition endpoints through the API-server proxy, decodes the series that
//! concern this pod, and emits a labeled [`MetricBatch`] per tick.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use kube::Client;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::decode::{decode_metrics, ScrapeScope};
use crate::{
    error::Error,
    state::{SharedState, StreamId, StreamState},
};

const SCRAPE_ENDPOINTS: [&str; 2] = ["resource", "cadvisor"];
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);
const SCRAPE_JITTER_MS: u64 = 250;

/// Default pause between scrape ticks.
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(1);

/// One sampled value with its nanosecond epoch timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metric {
    /// Sample value. CPU is nanoseconds of usage; memory and network are raw.
    pub value: u64,
    /// Nanoseconds since the epoch.
    pub timestamp_ns: i64,
}

/// CPU and memory working set of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeMetrics {
    /// Cumulative CPU usage in nanoseconds.
    pub cpu: Metric,
    /// Working set in bytes.
    pub memory: Metric,
}

/// The eight per-pod network counters, restricted to the primary interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct NetworkMetrics {
    pub rx_bytes: Metric,
    pub rx_errors: Metric,
    pub rx_packets: Metric,
    pub rx_packets_dropped: Metric,
    pub tx_bytes: Metric,
    pub tx_errors: Metric,
    pub tx_packets: Metric,
    pub tx_packets_dropped: Metric,
}

/// CPU and memory of a single container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerMetrics {
    /// Cumulative CPU usage in nanoseconds.
    pub cpu: Metric,
    /// Working set in bytes.
    pub memory: Metric,
}

/// Resource usage of one pod and its containers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodMetrics {
    /// Namespace the pod lives in.
    pub namespace: String,
    /// Cumulative CPU usage in nanoseconds.
    pub cpu: Metric,
    /// Working set in bytes.
    pub memory: Metric,
    /// Network counters for `eth0`.
    pub network: NetworkMetrics,
    /// Per-container usage, keyed on container name.
    pub containers: HashMap<String, ContainerMetrics>,
}

/// One decoded scrape, keyed on node and pod names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricBatch {
    /// Node-level series.
    pub nodes: HashMap<String, NodeMetrics>,
    /// Pod-level series.
    pub pods: HashMap<String, PodMetrics>,
}

/// Long-lived scraper for one pod.
pub struct MetricStream {
    id: StreamId,
    namespace: String,
    node: String,
    containers: Vec<String>,
    state: Arc<SharedState>,
    tx: mpsc::Sender<MetricBatch>,
    token: CancellationToken,
    interval: Duration,
}

impl MetricStream {
    /// Builds a scraper for `pod` running on `node`.
    pub fn new(
        id: StreamId,
        namespace: impl Into<String>,
        node: impl Into<String>,
        containers: Vec<String>,
        state: Arc<SharedState>,
        tx: mpsc::Sender<MetricBatch>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            namespace: namespace.into(),
            node: node.into(),
            containers,
            state,
            tx,
            token,
            interval: DEFAULT_SCRAPE_INTERVAL,
        }
    }

    /// Scrapes until the registry no longer says Running or the token fires.
    pub async fn run(self) {
        let Some(client) = self.state.client() else {
            self.state
                .error(Error::ClusterClient("no cluster client registered".into()));
            return;
        };
        info!(id = %self.id, node = %self.node, "starting metric stream");

        loop {
            let pause = self.interval + scrape_jitter();
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
            if self.state.get(&self.id) != Some(StreamState::Running) {
                break;
            }

            let mut batch = self.seed_batch();
            let scope = ScrapeScope {
                node: &self.node,
                pod: self.id.pod(),
                namespace: &self.namespace,
            };
            let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);

            let mut scraped = 0;
            for endpoint in SCRAPE_ENDPOINTS {
                match self.scrape(&client, endpoint).await {
                    Ok(text) => match decode_metrics(&text, &scope, now_ns, &mut batch) {
                        Ok(applied) => {
                            debug!(id = %self.id, endpoint, applied, "decoded scrape");
                            scraped += 1;
                        }
                        Err(err) => self.state.error(err),
                    },
                    Err(err) => self.state.error(err),
                }
            }
            if scraped == 0 {
                continue;
            }
            if self.tx.send(batch).await.is_err() {
                break;
            }
        }
        info!(id = %self.id, "metric stream terminated");
    }

    /// A batch pre-labeled with this pod's node, name and containers, so the
    /// decoder only fills values for series that belong here.
    fn seed_batch(&self) -> MetricBatch {
        let mut batch = MetricBatch::default();
        batch.nodes.insert(self.node.clone(), NodeMetrics::default());
        batch.pods.insert(
            self.id.pod().to_string(),
            PodMetrics {
                namespace: self.namespace.clone(),
                containers: self
                    .containers
                    .iter()
                    .map(|name| (name.clone(), ContainerMetrics::default()))
                    .collect(),
                ..PodMetrics::default()
            },
        );
        batch
    }

    async fn scrape(&self, client: &Client, endpoint: &str) -> Result<String, Error> {
        let path = format!("/api/v1/nodes/{}/proxy/metrics/{endpoint}", self.node);
        let request = http::Request::get(path.as_str())
            .body(Vec::new())
            .map_err(|err| Error::Scrape {
                id: self.id.clone(),
                reason: format!("building request for {path}: {err}"),
            })?;
        match tokio::time::timeout(SCRAPE_TIMEOUT, client.request_text(request)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(err)) => Err(Error::Scrape {
                id: self.id.clone(),
                reason: format!("{endpoint}: {err}"),
            }),
            Err(_) => Err(Error::Scrape {
                id: self.id.clone(),
                reason: format!("{endpoint}: timed out after {SCRAPE_TIMEOUT:?}"),
            }),
        }
    }
}

fn scrape_jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..SCRAPE_JITTER_MS))
}
