//! Decoding of kubelet text-exposition pages into [`MetricBatch`] values.
//!
//! Only a fixed set of series names is recognized. A series line matches a
//! name when the text equals it exactly or is immediately followed by a label
//! block, which is consulted to scope container series to the right pod and
//! to keep network counters from interfaces other than `eth0`.

use super::metric::{Metric, MetricBatch, PodMetrics};
use crate::error::Error;

const NODE_CPU: &str = "node_cpu_usage_seconds_total";
const NODE_MEMORY: &str = "node_memory_working_set_bytes";
const POD_CPU: &str = "pod_cpu_usage_seconds_total";
const POD_MEMORY: &str = "pod_memory_working_set_bytes";
const CONTAINER_CPU: &str = "container_cpu_usage_seconds_total";
const CONTAINER_MEMORY: &str = "container_memory_working_set_bytes";
const NETWORK_INTERFACE: &str = "eth0";

/// Names the workload a scrape belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeScope<'a> {
    /// Node whose kubelet was scraped.
    pub node: &'a str,
    /// Pod this metric stream is bound to.
    pub pod: &'a str,
    /// The pod's namespace.
    pub namespace: &'a str,
}

/// Applies every recognized series in `text` to `batch`, returning how many
/// samples were applied.
///
/// Series with an exposition timestamp carry it as milliseconds; it is scaled
/// to nanoseconds. Series without one get `now_ns`. CPU seconds are scaled to
/// nanoseconds; memory and network values pass through as unsigned integers.
/// Malformed lines are skipped; a page that applies nothing yields
/// [`Error::Decode`], so the caller treats the endpoint as failed for the
/// tick instead of emitting a zeroed batch.
pub fn decode_metrics(
    text: &str,
    scope: &ScrapeScope<'_>,
    now_ns: i64,
    batch: &mut MetricBatch,
) -> Result<usize, Error> {
    let mut applied = 0usize;
    let mut malformed = 0usize;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, labels, rest)) = split_series(line) else {
            malformed += 1;
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(value) = parts.next().and_then(|v| v.parse::<f64>().ok()) else {
            malformed += 1;
            continue;
        };
        let timestamp_ns = parts
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .map(|ms| ms * 1_000_000)
            .unwrap_or(now_ns);

        match name {
            NODE_CPU => {
                if let Some(node) = batch.nodes.get_mut(scope.node) {
                    node.cpu = Metric {
                        value: cpu_nanos(value),
                        timestamp_ns,
                    };
                    applied += 1;
                }
            }
            NODE_MEMORY => {
                if let Some(node) = batch.nodes.get_mut(scope.node) {
                    node.memory = Metric {
                        value: value as u64,
                        timestamp_ns,
                    };
                    applied += 1;
                }
            }
            POD_CPU => {
                if pod_in_scope(labels, scope) {
                    if let Some(pod) = batch.pods.get_mut(scope.pod) {
                        pod.cpu = Metric {
                            value: cpu_nanos(value),
                            timestamp_ns,
                        };
                        applied += 1;
                    }
                }
            }
            POD_MEMORY => {
                if pod_in_scope(labels, scope) {
                    if let Some(pod) = batch.pods.get_mut(scope.pod) {
                        pod.memory = Metric {
                            value: value as u64,
                            timestamp_ns,
                        };
                        applied += 1;
                    }
                }
            }
            CONTAINER_CPU | CONTAINER_MEMORY => {
                if !pod_in_scope(labels, scope) {
                    continue;
                }
                let Some(container) = label_value(labels, "container") else {
                    continue;
                };
                if let Some(metrics) = batch
                    .pods
                    .get_mut(scope.pod)
                    .and_then(|pod| pod.containers.get_mut(container))
                {
                    let metric = if name == CONTAINER_CPU {
                        &mut metrics.cpu
                    } else {
                        &mut metrics.memory
                    };
                    *metric = Metric {
                        value: if name == CONTAINER_CPU {
                            cpu_nanos(value)
                        } else {
                            value as u64
                        },
                        timestamp_ns,
                    };
                    applied += 1;
                }
            }
            other => {
                if !is_network_series(other) {
                    continue;
                }
                if label_value(labels, "interface") != Some(NETWORK_INTERFACE) {
                    continue;
                }
                if !pod_in_scope(labels, scope) {
                    continue;
                }
                if let Some(metric) = batch
                    .pods
                    .get_mut(scope.pod)
                    .and_then(|pod| network_counter(pod, other))
                {
                    *metric = Metric {
                        value: value as u64,
                        timestamp_ns,
                    };
                    applied += 1;
                }
            }
        }
    }

    if applied == 0 {
        return Err(Error::Decode(format!(
            "no recognized series applied ({malformed} malformed lines)"
        )));
    }
    Ok(applied)
}

fn cpu_nanos(seconds: f64) -> u64 {
    (seconds * 1e9) as u64
}

/// Splits a series line into (name, label block, value-and-timestamp rest).
fn split_series(line: &str) -> Option<(&str, &str, &str)> {
    match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            if close < open {
                return None;
            }
            Some((&line[..open], &line[open + 1..close], &line[close + 1..]))
        }
        None => {
            let space = line.find(char::is_whitespace)?;
            Some((&line[..space], "", &line[space..]))
        }
    }
}

fn label_value<'a>(labels: &'a str, key: &str) -> Option<&'a str> {
    labels.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"'))
    })
}

/// Series with pod/namespace labels only count when they name this scope's
/// pod; label-less series (the node page) always pass.
fn pod_in_scope(labels: &str, scope: &ScrapeScope<'_>) -> bool {
    label_value(labels, "pod").is_none_or(|pod| pod == scope.pod)
        && label_value(labels, "namespace").is_none_or(|ns| ns == scope.namespace)
}

fn is_network_series(name: &str) -> bool {
    matches!(
        name,
        "container_network_receive_bytes_total"
            | "container_network_receive_errors_total"
            | "container_network_receive_packets_total"
            | "container_network_receive_packets_dropped_total"
            | "container_network_transmit_bytes_total"
            | "container_network_transmit_errors_total"
            | "container_network_transmit_packets_total"
            | "container_network_transmit_packets_dropped_total"
    )
}

fn network_counter<'a>(pod: &'a mut PodMetrics, name: &str) -> Option<&'a mut Metric> {
    let network = &mut pod.network;
    Some(match name {
        "container_network_receive_bytes_total" => &mut network.rx_bytes,
        "container_network_receive_errors_total" => &mut network.rx_errors,
        "container_network_receive_packets_total" => &mut network.rx_packets,
        "container_network_receive_packets_dropped_total" => &mut network.rx_packets_dropped,
        "container_network_transmit_bytes_total" => &mut network.tx_bytes,
        "container_network_transmit_errors_total" => &mut network.tx_errors,
        "container_network_transmit_packets_total" => &mut network.tx_packets,
        "container_network_transmit_packets_dropped_total" => &mut network.tx_packets_dropped,
        _ => return None,
    })
}
