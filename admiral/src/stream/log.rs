//! Per-container log streaming.
//!
//! One [`LogStream`] task owns the upstream follow-read for a single
//! (namespace, pod, container) identity: it parses lines, annotates them with
//! a metadata snapshot, emits them on the shared raw-log channel, and
//! re-opens broken upstream reads with a `since` cursor so nothing produced
//! during the backoff window is lost.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, LogParams},
    Client,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    backend::RawLog,
    error::Error,
    state::{SharedState, StreamId, StreamState},
};

/// Default sleep before a broken upstream read is re-opened.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// Lines read from one upstream session.
pub type LogLines = BoxStream<'static, std::io::Result<String>>;

/// Where a log stream reads from. The production implementation follows the
/// container's logs through the API server; tests script their own sessions.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Opens a follow-read, optionally resuming from `since`.
    async fn open(&self, id: &StreamId, since: Option<DateTime<Utc>>) -> Result<LogLines, Error>;
}

/// Follow-reads a container's logs with timestamps enabled.
pub struct KubeLogSource {
    client: Option<Client>,
    container: String,
}

impl KubeLogSource {
    /// Binds the source to whatever client is registered right now.
    pub fn new(client: Option<Client>, container: impl Into<String>) -> Self {
        Self {
            client,
            container: container.into(),
        }
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn open(&self, id: &StreamId, since: Option<DateTime<Utc>>) -> Result<LogLines, Error> {
        let Some(client) = &self.client else {
            return Err(Error::ClusterClient("no cluster client registered".into()));
        };
        let api: Api<Pod> = Api::namespaced(client.clone(), id.namespace());
        let params = LogParams {
            container: Some(self.container.clone()),
            follow: true,
            timestamps: true,
            since_time: since,
            ..LogParams::default()
        };
        let reader = api
            .log_stream(id.pod(), &params)
            .await
            .map_err(|source| Error::StreamOpen {
                id: id.clone(),
                source,
            })?;
        Ok(reader.lines().boxed())
    }
}

enum Session {
    /// The token fired, the registry moved past Running, or the raw-log
    /// channel closed: stop for good.
    Stop,
    /// The upstream ended or broke: re-open from the failure instant.
    Reopen(DateTime<Utc>),
}

/// Long-lived reader for one container's logs.
pub struct LogStream {
    id: StreamId,
    metadata: BTreeMap<String, String>,
    time_key: Option<String>,
    state: Arc<SharedState>,
    tx: mpsc::Sender<RawLog>,
    source: Box<dyn LogSource>,
    backoff: Duration,
    token: CancellationToken,
}

impl LogStream {
    /// Builds a stream task. `pod_labels` is snapshotted here; the `pod` and
    /// `namespace` keys are injected on top.
    pub fn new(
        id: StreamId,
        pod_labels: &BTreeMap<String, String>,
        time_key: Option<String>,
        state: Arc<SharedState>,
        tx: mpsc::Sender<RawLog>,
        source: Box<dyn LogSource>,
        token: CancellationToken,
    ) -> Self {
        let mut metadata = pod_labels.clone();
        metadata.insert("pod".to_string(), id.pod().to_string());
        metadata.insert("namespace".to_string(), id.namespace().to_string());
        Self {
            id,
            metadata,
            time_key,
            state,
            tx,
            source,
            backoff: DEFAULT_BACKOFF,
            token,
        }
    }

    /// Overrides the re-open backoff window.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs the stream to termination.
    pub async fn run(self) {
        info!(id = %self.id, "starting log stream");
        let mut since: Option<DateTime<Utc>> = None;
        loop {
            if !self.running() {
                break;
            }
            // The open itself can hang on a slow API server, so it races the
            // token like every other suspension point.
            let opened = tokio::select! {
                _ = self.token.cancelled() => break,
                opened = self.source.open(&self.id, since) => opened,
            };
            let mut lines = match opened {
                Ok(lines) => lines,
                Err(err @ Error::ClusterClient(_)) => {
                    self.state.error(err);
                    break;
                }
                Err(err) => {
                    self.state.error(err);
                    since = Some(Utc::now());
                    if !self.backoff_still_running().await {
                        break;
                    }
                    continue;
                }
            };
            info!(id = %self.id, "log stream open");
            match self.read(&mut lines).await {
                Session::Stop => break,
                Session::Reopen(cursor) => {
                    since = Some(cursor);
                    if !self.backoff_still_running().await {
                        break;
                    }
                }
            }
        }
        info!(id = %self.id, "log stream terminated");
    }

    /// Reads one open session until it ends, breaks, or the task must stop.
    async fn read(&self, lines: &mut LogLines) -> Session {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Session::Stop,
                next = lines.next() => match next {
                    Some(Ok(line)) => {
                        if self.emit(line).await.is_err() {
                            return Session::Stop;
                        }
                        if !self.running() {
                            return Session::Stop;
                        }
                    }
                    Some(Err(source)) => {
                        self.state.error(Error::StreamRead {
                            id: self.id.clone(),
                            source,
                        });
                        return Session::Reopen(Utc::now());
                    }
                    None => return Session::Reopen(Utc::now()),
                }
            }
        }
    }

    /// Annotates one line and blocking-sends it to the backend channel; the
    /// send is the back-pressure point of the whole pipeline.
    async fn emit(&self, line: String) -> Result<(), ()> {
        let payload = strip_upstream_timestamp(&line).trim();
        if payload.is_empty() {
            return Ok(());
        }
        let timestamp_ns = self.record_timestamp(payload);
        let record = RawLog::new(payload.to_string(), &self.metadata, timestamp_ns);
        self.tx.send(record).await.map_err(|_| ())
    }

    /// JSON lines may carry their own clock under the configured time key;
    /// everything else is stamped with the wall clock.
    fn record_timestamp(&self, payload: &str) -> i64 {
        if payload.starts_with('{') {
            if let Some(key) = &self.time_key {
                if let Ok(serde_json::Value::Object(fields)) =
                    serde_json::from_str::<serde_json::Value>(payload)
                {
                    if let Some(serde_json::Value::String(raw)) = fields.get(key) {
                        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                            if let Some(ns) = parsed.with_timezone(&Utc).timestamp_nanos_opt() {
                                return ns;
                            }
                        }
                    }
                }
            }
        }
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    async fn backoff_still_running(&self) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(self.backoff) => self.running(),
        }
    }

    fn running(&self) -> bool {
        matches!(self.state.get(&self.id), Some(StreamState::Running))
    }
}

/// Upstream reads have timestamps enabled, so every line arrives prefixed
/// with the kubelet's RFC3339 clock. The prefix is not part of the payload.
fn strip_upstream_timestamp(line: &str) -> &str {
    if let Some((first, rest)) = line.split_once(' ') {
        if DateTime::parse_from_rfc3339(first).is_ok() {
            return rest;
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use futures::stream;

    use super::*;

    /// Scripted upstream: each open pops one session; a session is a list of
    /// line results, optionally followed by a hang instead of EOF.
    #[derive(Default)]
    struct ScriptedSource {
        sessions: Mutex<Vec<ScriptedSession>>,
        opens: AtomicUsize,
        sinces: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    struct ScriptedSession {
        lines: Vec<std::io::Result<String>>,
        hang_after: bool,
    }

    impl ScriptedSource {
        fn new(sessions: Vec<ScriptedSession>) -> Self {
            Self {
                sessions: Mutex::new(sessions),
                ..Self::default()
            }
        }

        fn lines(items: &[&str]) -> ScriptedSession {
            ScriptedSession {
                lines: items.iter().map(|s| Ok(s.to_string())).collect(),
                hang_after: false,
            }
        }

        fn lines_then_hang(items: &[&str]) -> ScriptedSession {
            ScriptedSession {
                lines: items.iter().map(|s| Ok(s.to_string())).collect(),
                hang_after: true,
            }
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogSource for &'static ScriptedSource {
        async fn open(
            &self,
            _id: &StreamId,
            since: Option<DateTime<Utc>>,
        ) -> Result<LogLines, Error> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.sinces.lock().unwrap().push(since);
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.is_empty() {
                return Ok(stream::pending().boxed());
            }
            let session = sessions.remove(0);
            let lines = stream::iter(session.lines);
            if session.hang_after {
                Ok(lines.chain(stream::pending()).boxed())
            } else {
                Ok(lines.boxed())
            }
        }
    }

    fn leak(source: ScriptedSource) -> &'static ScriptedSource {
        Box::leak(Box::new(source))
    }

    struct Fixture {
        state: Arc<SharedState>,
        id: StreamId,
        token: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let state = SharedState::new("test-cluster");
        let id = StreamId::log("ns", "pod", "app");
        state.set(id.clone(), StreamState::Running);
        state.settled().await;
        Fixture {
            state,
            id,
            token: CancellationToken::new(),
        }
    }

    fn spawn_stream(
        f: &Fixture,
        source: &'static ScriptedSource,
        time_key: Option<&str>,
        tx: mpsc::Sender<RawLog>,
    ) -> tokio::task::JoinHandle<()> {
        let labels = BTreeMap::from([("app".to_string(), "demo".to_string())]);
        let stream = LogStream::new(
            f.id.clone(),
            &labels,
            time_key.map(str::to_string),
            Arc::clone(&f.state),
            tx,
            Box::new(source),
            f.token.clone(),
        )
        .with_backoff(Duration::from_millis(50));
        tokio::spawn(stream.run())
    }

    #[tokio::test(start_paused = true)]
    async fn eof_reopens_with_a_fresh_cursor_and_loses_nothing() {
        let f = fixture().await;
        let source = leak(ScriptedSource::new(vec![
            ScriptedSource::lines(&["a", "b"]),
            ScriptedSource::lines_then_hang(&["c"]),
        ]));
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_stream(&f, source, None, tx);

        for expected in ["a", "b", "c"] {
            let record = rx.recv().await.expect("record");
            assert_eq!(record.line, expected);
        }
        assert_eq!(source.opens(), 2);
        let sinces = source.sinces.lock().unwrap();
        assert!(sinces[0].is_none());
        assert!(sinces[1].is_some(), "reopen must carry a since cursor");

        f.token.cancel();
        handle.await.expect("task exits");
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_holds_lines_upstream_and_preserves_order() {
        let f = fixture().await;
        let source = leak(ScriptedSource::new(vec![ScriptedSource::lines_then_hang(
            &["1", "2", "3"],
        )]));
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_stream(&f, source, None, tx);

        // Let the task fill the single-slot channel and block on the next send.
        tokio::task::yield_now().await;
        for expected in ["1", "2", "3"] {
            let record = rx.recv().await.expect("record");
            assert_eq!(record.line, expected);
        }
        f.token.cancel();
        handle.await.expect("task exits");
    }

    #[tokio::test(start_paused = true)]
    async fn finished_streams_deliver_in_flight_lines_but_never_reopen() {
        let f = fixture().await;
        let source = leak(ScriptedSource::new(vec![ScriptedSource::lines(&[
            "a", "b",
        ])]));
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_stream(&f, source, None, tx);

        assert_eq!(rx.recv().await.expect("record").line, "a");
        f.state.set(f.id.clone(), StreamState::Finished);
        f.state.settled().await;
        // The already-read line still arrives.
        assert_eq!(rx.recv().await.expect("record").line, "b");

        handle.await.expect("task exits without reopening");
        assert_eq!(source.opens(), 1);
        assert!(rx.recv().await.is_none(), "no further records");
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_a_hung_stream_promptly() {
        let f = fixture().await;
        let source = leak(ScriptedSource::new(vec![ScriptedSource::lines_then_hang(
            &["only"],
        )]));
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_stream(&f, source, None, tx);

        assert_eq!(rx.recv().await.expect("record").line, "only");
        f.token.cancel();
        handle.await.expect("task exits");
        assert!(rx.recv().await.is_none(), "no records after delete");
    }

    #[tokio::test(start_paused = true)]
    async fn delete_interrupts_a_hung_open() {
        struct HangingOpen;
        #[async_trait]
        impl LogSource for HangingOpen {
            async fn open(
                &self,
                _id: &StreamId,
                _since: Option<DateTime<Utc>>,
            ) -> Result<LogLines, Error> {
                std::future::pending().await
            }
        }

        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let labels = BTreeMap::new();
        let stream = LogStream::new(
            f.id.clone(),
            &labels,
            None,
            Arc::clone(&f.state),
            tx,
            Box::new(HangingOpen),
            f.token.clone(),
        );
        let handle = tokio::spawn(stream.run());
        tokio::task::yield_now().await;
        f.token.cancel();
        handle.await.expect("task exits despite the hung open");
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_report_and_reopen() {
        let f = fixture().await;
        let (err_tx, mut err_rx) = mpsc::channel(8);
        f.state.set_error_sink(err_tx);
        let source = leak(ScriptedSource::new(vec![
            ScriptedSession {
                lines: vec![Ok("a".to_string()), Err(std::io::Error::other("reset"))],
                hang_after: false,
            },
            ScriptedSource::lines_then_hang(&["b"]),
        ]));
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_stream(&f, source, None, tx);

        assert_eq!(rx.recv().await.expect("record").line, "a");
        assert_eq!(rx.recv().await.expect("record").line, "b");
        assert!(matches!(
            err_rx.recv().await.expect("error"),
            Error::StreamRead { .. }
        ));
        assert_eq!(source.opens(), 2);

        f.token.cancel();
        handle.await.expect("task exits");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_cluster_client_terminates_immediately() {
        struct NoClient;
        #[async_trait]
        impl LogSource for NoClient {
            async fn open(
                &self,
                _id: &StreamId,
                _since: Option<DateTime<Utc>>,
            ) -> Result<LogLines, Error> {
                Err(Error::ClusterClient("no cluster client registered".into()))
            }
        }

        let f = fixture().await;
        let (err_tx, mut err_rx) = mpsc::channel(8);
        f.state.set_error_sink(err_tx);
        let (tx, _rx) = mpsc::channel(1);
        let labels = BTreeMap::new();
        let stream = LogStream::new(
            f.id.clone(),
            &labels,
            None,
            Arc::clone(&f.state),
            tx,
            Box::new(NoClient),
            f.token.clone(),
        );
        stream.run().await;
        assert!(matches!(
            err_rx.recv().await.expect("error"),
            Error::ClusterClient(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn json_lines_use_the_configured_time_key() {
        let f = fixture().await;
        let line = r#"2024-01-01T00:00:01.000000000Z {"time":"2024-01-01T00:00:00Z","msg":"hi"}"#;
        let source = leak(ScriptedSource::new(vec![ScriptedSource::lines_then_hang(
            &[line],
        )]));
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_stream(&f, source, Some("time"), tx);

        let record = rx.recv().await.expect("record");
        assert_eq!(record.timestamp, "1704067200000000000");
        assert_eq!(record.line, r#"{"time":"2024-01-01T00:00:00Z","msg":"hi"}"#);
        assert_eq!(record.metadata.get("pod").map(String::as_str), Some("pod"));
        assert_eq!(
            record.metadata.get("namespace").map(String::as_str),
            Some("ns")
        );

        f.token.cancel();
        handle.await.expect("task exits");
    }

    #[test]
    fn upstream_timestamp_prefixes_are_stripped() {
        assert_eq!(
            strip_upstream_timestamp("2024-01-01T00:00:00.000000000Z hello world"),
            "hello world"
        );
        assert_eq!(strip_upstream_timestamp("no prefix here"), "no prefix here");
    }
}
