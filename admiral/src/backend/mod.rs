//! Backend adapters: the sink-side half of each watcher pipeline.
//!
//! Every adapter drains one typed channel until it closes, serializes each
//! item and transmits it. Transport failures never crash an adapter; they are
//! reported on the shared error channel and the adapter resumes waiting on
//! its input. Delivery is at-most-once by design: a degraded sink must not
//! grow memory.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    config::{BackendKind, BackendSpec},
    error::Error,
    state::SharedState,
    stream::metric::MetricBatch,
};

pub mod gchat;
pub mod http;
pub mod local;
pub mod loki;
pub mod pushgateway;

pub use gchat::GChat;
pub use local::Local;
pub use loki::Loki;
pub use pushgateway::PushGateway;

/// One log line, annotated and ready for a backend.
///
/// Metadata is a private copy taken when the record was built; later changes
/// to the pod's labels do not affect emitted records. Keys and values are
/// normalized at construction: every `.`, `\`, `-` and `/` becomes `_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// The trimmed log line.
    pub line: String,
    /// Normalized label snapshot plus the injected `pod` and `namespace` keys.
    pub metadata: BTreeMap<String, String>,
    /// Nanoseconds since the epoch, as a decimal string.
    pub timestamp: String,
}

impl RawLog {
    /// Builds a record from a line, a metadata snapshot and a timestamp.
    pub fn new(line: String, metadata: &BTreeMap<String, String>, timestamp_ns: i64) -> Self {
        Self {
            line,
            metadata: format_log_metadata(metadata),
            timestamp: timestamp_ns.to_string(),
        }
    }
}

/// Copies `metadata`, replacing `.`, `\`, `-` and `/` with `_` in every key
/// and value so the result is safe for label-based stores.
pub fn format_log_metadata(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    fn normalize(s: &str) -> String {
        s.chars()
            .map(|c| match c {
                '.' | '\\' | '-' | '/' => '_',
                other => other,
            })
            .collect()
    }
    metadata
        .iter()
        .map(|(k, v)| (normalize(k), normalize(v)))
        .collect()
}

/// The closed set of backend adapters.
pub enum Backend {
    /// Log-store push.
    Loki(Loki),
    /// Chat webhook push.
    GChat(GChat),
    /// Standard output.
    Local(Local),
    /// Prometheus push gateway.
    PushGateway(PushGateway),
}

impl Backend {
    /// Drains the adapter's input channel until it closes.
    pub async fn stream(self) {
        match self {
            Backend::Loki(adapter) => adapter.stream().await,
            Backend::GChat(adapter) => adapter.stream().await,
            Backend::Local(adapter) => adapter.stream().await,
            Backend::PushGateway(adapter) => adapter.stream().await,
        }
    }

    /// Adapter for a logs watcher, consuming the raw-log channel.
    ///
    /// Returns `None` when the backend is disabled; the receiver is dropped
    /// and producers observe a closed channel.
    pub fn for_logs(
        spec: &BackendSpec,
        rx: mpsc::Receiver<RawLog>,
        http: &http::HttpClient,
        state: &Arc<SharedState>,
    ) -> Result<Option<Self>, Error> {
        match spec.kind {
            BackendKind::Loki => Ok(Some(Backend::Loki(Loki::new(
                &spec.url,
                http.clone(),
                rx,
                Arc::clone(state),
            )))),
            BackendKind::Local => Ok(Some(Backend::Local(Local::logs(rx)))),
            BackendKind::Disabled => Ok(None),
            other => Err(Error::Config(format!(
                "backend type {other:?} cannot consume log records"
            ))),
        }
    }

    /// Adapter for an events or performance watcher, consuming the text channel.
    pub fn for_text(
        spec: &BackendSpec,
        rx: mpsc::Receiver<String>,
        http: &http::HttpClient,
        state: &Arc<SharedState>,
    ) -> Result<Option<Self>, Error> {
        match spec.kind {
            BackendKind::Gchat => Ok(Some(Backend::GChat(GChat::new(
                &spec.url,
                http.clone(),
                rx,
                Arc::clone(state),
            )))),
            BackendKind::Local => Ok(Some(Backend::Local(Local::events(rx)))),
            BackendKind::Disabled => Ok(None),
            other => Err(Error::Config(format!(
                "backend type {other:?} cannot consume event text"
            ))),
        }
    }

    /// Adapter for a metrics watcher, consuming the metric-batch channel.
    pub fn for_metrics(
        spec: &BackendSpec,
        rx: mpsc::Receiver<MetricBatch>,
        http: &http::HttpClient,
        state: &Arc<SharedState>,
    ) -> Result<Option<Self>, Error> {
        match spec.kind {
            BackendKind::Pushgateway => Ok(Some(Backend::PushGateway(PushGateway::new(
                &spec.url,
                http.clone(),
                rx,
                Arc::clone(state),
            )))),
            BackendKind::Disabled => Ok(None),
            other => Err(Error::Config(format!(
                "backend type {other:?} cannot consume metric batches"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_normalization_strips_label_hostile_characters() {
        let mut metadata = BTreeMap::new();
        metadata.insert("app.kubernetes.io/name".to_string(), "my-app".to_string());
        metadata.insert("pod".to_string(), r"weird\value/1.0".to_string());

        let normalized = format_log_metadata(&metadata);
        for (k, v) in &normalized {
            for forbidden in ['.', '\\', '-', '/'] {
                assert!(!k.contains(forbidden), "key {k:?} contains {forbidden:?}");
                assert!(!v.contains(forbidden), "value {v:?} contains {forbidden:?}");
            }
        }
        assert_eq!(
            normalized.get("app_kubernetes_io_name").map(String::as_str),
            Some("my_app")
        );
    }

    #[test]
    fn raw_log_copies_and_normalizes_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("release".to_string(), "v1.2-rc/3".to_string());

        let record = RawLog::new("hello".into(), &metadata, 42);
        // Mutating the source after emission must not affect the record.
        metadata.insert("release".to_string(), "changed".to_string());

        assert_eq!(record.metadata.get("release").map(String::as_str), Some("v1_2_rc_3"));
        assert_eq!(record.timestamp, "42");
    }
}
