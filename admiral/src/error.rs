//! Error taxonomy for the telemetry pipeline.

use thiserror::Error;

use crate::state::StreamId;

/// Possible failures across the watchers, stream tasks and backends.
///
/// [`Error::Config`] and [`Error::ClusterClient`] are fatal during startup and
/// propagate to the CLI. Everything else is recoverable: it is pushed onto the
/// shared error channel and drained by a single logger task.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or incomplete configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The cluster client could not be constructed, or was never registered.
    #[error("cluster client unavailable: {0}")]
    ClusterClient(String),

    /// Opening the upstream follow-read failed. The stream task backs off and retries.
    #[error("failed to open log stream {id}: {source}")]
    StreamOpen {
        /// Identity of the stream that failed to open.
        id: StreamId,
        /// Underlying client error.
        #[source]
        source: kube::Error,
    },

    /// The upstream read failed mid-stream. The stream task backs off and retries.
    #[error("log stream {id} failed mid-read: {source}")]
    StreamRead {
        /// Identity of the stream that failed.
        id: StreamId,
        /// Underlying read error.
        #[source]
        source: std::io::Error,
    },

    /// A node metrics scrape failed. The tick is retried on the next interval.
    #[error("metrics scrape for {id} failed: {reason}")]
    Scrape {
        /// Identity of the metric stream whose scrape failed.
        id: StreamId,
        /// Why the scrape failed (transport, timeout or bad request).
        reason: String,
    },

    /// The scraped exposition payload could not be decoded. The tick is skipped.
    #[error("failed to decode metrics exposition: {0}")]
    Decode(String),

    /// The HTTP round-trip to a backend sink failed. The item is dropped.
    #[error("backend transport failed: {0}")]
    BackendTransport(String),

    /// A backend sink answered outside its success set. The item is dropped.
    #[error("backend returned status {status}: {body}")]
    BackendStatus {
        /// HTTP status code returned by the sink.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
}
