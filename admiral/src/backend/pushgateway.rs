//! Prometheus push-gateway adapter for metric batches.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
};

use http::Method;
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::sync::mpsc;

use super::http::{send, HttpClient};
use crate::{
    error::Error,
    state::SharedState,
    stream::metric::{Metric, MetricBatch, NetworkMetrics},
};

/// Holds one synthetic gauge per (metric kind, label tuple) and pushes each
/// sample to the gateway with job/metric grouping.
///
/// Everything is modelled as a gauge, network counters included, so samples
/// can be set to whatever the scrape reported. A failed push is reported and
/// the adapter moves on.
pub struct PushGateway {
    url: String,
    client: HttpClient,
    rx: mpsc::Receiver<MetricBatch>,
    state: Arc<SharedState>,
    gauges: HashMap<String, GaugeCell>,
}

struct GaugeCell {
    registry: Registry,
    gauge: Gauge,
}

impl PushGateway {
    /// Builds the adapter against the gateway base URL.
    pub fn new(
        url: &str,
        client: HttpClient,
        rx: mpsc::Receiver<MetricBatch>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            rx,
            state,
            gauges: HashMap::new(),
        }
    }

    /// Drains the metric-batch channel until it closes.
    pub async fn stream(mut self) {
        while let Some(batch) = self.rx.recv().await {
            self.push_batch(batch).await;
        }
    }

    async fn push_batch(&mut self, batch: MetricBatch) {
        for (name, node) in &batch.nodes {
            let labels = [("name", name.as_str())];
            self.push_gauge("node_cpu", NODE_CPU_HELP, &labels, name, node.cpu.value)
                .await;
            self.push_gauge("node_memory", NODE_MEMORY_HELP, &labels, name, node.memory.value)
                .await;
        }
        for (name, pod) in &batch.pods {
            let namespace = pod.namespace.as_str();
            let labels = [("name", name.as_str()), ("namespace", namespace)];
            self.push_gauge("pod_cpu", POD_CPU_HELP, &labels, name, pod.cpu.value)
                .await;
            self.push_gauge("pod_memory", POD_MEMORY_HELP, &labels, name, pod.memory.value)
                .await;
            for (counter, metric) in network_counters(&pod.network) {
                self.push_gauge(counter, NETWORK_HELP, &labels, name, metric.value)
                    .await;
            }
            for (container, metrics) in &pod.containers {
                let labels = [
                    ("name", container.as_str()),
                    ("pod", name.as_str()),
                    ("namespace", namespace),
                ];
                self.push_gauge(
                    "container_cpu",
                    CONTAINER_CPU_HELP,
                    &labels,
                    container,
                    metrics.cpu.value,
                )
                .await;
                self.push_gauge(
                    "container_memory",
                    CONTAINER_MEMORY_HELP,
                    &labels,
                    container,
                    metrics.memory.value,
                )
                .await;
            }
        }
    }

    /// Looks the gauge up (or creates it with its constant labels), sets the
    /// sample and pushes it with `job`/`metric` grouping.
    async fn push_gauge(
        &mut self,
        gauge: &str,
        help: &str,
        labels: &[(&str, &str)],
        job: &str,
        value: u64,
    ) {
        let cell = match lookup_gauge(&mut self.gauges, gauge, help, labels) {
            Ok(cell) => cell,
            Err(err) => {
                self.state.error(err);
                return;
            }
        };
        cell.gauge.set(value as f64);
        let body = match encode(&cell.registry) {
            Ok(body) => body,
            Err(err) => {
                self.state.error(err);
                return;
            }
        };
        let url = format!("{}/metrics/job/{job}/metric/{gauge}", self.url);
        match send(
            &self.client,
            Method::PUT,
            &url,
            Some(TEXT_FORMAT),
            body.into_bytes(),
        )
        .await
        {
            Ok((status, _)) if status.is_success() => {}
            Ok((status, body)) => self.state.error(Error::BackendStatus {
                status: status.as_u16(),
                body,
            }),
            Err(err) => self.state.error(err),
        }
    }
}

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

const NODE_CPU_HELP: &str = "Cumulative node CPU usage in nanoseconds.";
const NODE_MEMORY_HELP: &str = "Node working set in bytes.";
const POD_CPU_HELP: &str = "Cumulative pod CPU usage in nanoseconds.";
const POD_MEMORY_HELP: &str = "Pod working set in bytes.";
const CONTAINER_CPU_HELP: &str = "Cumulative container CPU usage in nanoseconds.";
const CONTAINER_MEMORY_HELP: &str = "Container working set in bytes.";
const NETWORK_HELP: &str = "Pod network counter for the primary interface.";

fn lookup_gauge<'a>(
    gauges: &'a mut HashMap<String, GaugeCell>,
    gauge: &str,
    help: &str,
    labels: &[(&str, &str)],
) -> Result<&'a GaugeCell, Error> {
    let key = std::iter::once(gauge)
        .chain(labels.iter().map(|(_, value)| *value))
        .collect::<Vec<_>>()
        .join("/");
    match gauges.entry(key) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(slot) => {
            let mut opts = Opts::new(gauge, help);
            for (name, value) in labels {
                opts = opts.const_label(*name, *value);
            }
            let gauge = Gauge::with_opts(opts)
                .map_err(|err| Error::BackendTransport(format!("building gauge: {err}")))?;
            let registry = Registry::new();
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|err| Error::BackendTransport(format!("registering gauge: {err}")))?;
            Ok(slot.insert(GaugeCell { registry, gauge }))
        }
    }
}

fn encode(registry: &Registry) -> Result<String, Error> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .map_err(|err| Error::BackendTransport(format!("encoding gauge: {err}")))?;
    String::from_utf8(buf).map_err(|err| Error::BackendTransport(format!("encoding gauge: {err}")))
}

fn network_counters(network: &NetworkMetrics) -> [(&'static str, Metric); 8] {
    [
        ("pod_network_receive_bytes", network.rx_bytes),
        ("pod_network_receive_errors", network.rx_errors),
        ("pod_network_receive_packets", network.rx_packets),
        ("pod_network_receive_packets_dropped", network.rx_packets_dropped),
        ("pod_network_transmit_bytes", network.tx_bytes),
        ("pod_network_transmit_errors", network.tx_errors),
        ("pod_network_transmit_packets", network.tx_packets),
        ("pod_network_transmit_packets_dropped", network.tx_packets_dropped),
    ]
}
