//! Process-wide shared state.
//!
//! One [`SharedState`] exists per process. It records the cluster name, the
//! moment the agent came up (events older than this are discarded), the
//! registry mapping stream identities to their lifecycle state, the cluster
//! client handle, and the aggregate error sink.
//!
//! Registry writes are funnelled through in-process queues consumed by a
//! single task, so writers get a total order; reads take a short-lived lock.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use kube::Client;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// Unique identity of a telemetry stream.
///
/// Log streams are keyed on (namespace, pod, container); metric streams on
/// the pod name alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    namespace: String,
    pod: String,
    container: Option<String>,
}

impl StreamId {
    /// Identity of a container log stream.
    pub fn log(namespace: impl Into<String>, pod: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: Some(container.into()),
        }
    }

    /// Identity of a pod metric stream.
    pub fn metric(pod: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            pod: pod.into(),
            container: None,
        }
    }

    /// Namespace component. Empty for metric streams.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pod component.
    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Container component, when this identifies a log stream.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.namespace, &self.container) {
            (ns, Some(container)) if !ns.is_empty() => write!(f, "{ns}.{}.{container}", self.pod),
            (_, Some(container)) => write!(f, "{}.{container}", self.pod),
            _ => write!(f, "{}", self.pod),
        }
    }
}

/// Lifecycle state of a stream. Transitions are strictly one-way:
/// `Running -> Finished -> Deleted`. The registry writer ignores regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    /// The stream task is reading upstream and emitting records.
    Running,
    /// No new reads are issued; already-buffered lines still drain.
    Finished,
    /// The upstream connection is closed. Terminal.
    Deleted,
}

enum SetOp {
    Set(StreamId, StreamState),
    Barrier(oneshot::Sender<()>),
}

enum DeleteOp {
    Delete(StreamId),
    Barrier(oneshot::Sender<()>),
}

/// Shared mutable state, treated as a singleton for the process lifetime.
pub struct SharedState {
    cluster: String,
    init_timestamp: DateTime<Utc>,
    objects: Arc<Mutex<HashMap<StreamId, StreamState>>>,
    set_tx: mpsc::UnboundedSender<SetOp>,
    delete_tx: mpsc::UnboundedSender<DeleteOp>,
    error_tx: RwLock<Option<mpsc::Sender<Error>>>,
    client: RwLock<Option<Client>>,
}

impl SharedState {
    /// Instantiates the state and spawns the task consuming registry writes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(cluster: impl Into<String>) -> Arc<Self> {
        let (set_tx, set_rx) = mpsc::unbounded_channel();
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        let objects = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(write_loop(Arc::clone(&objects), set_rx, delete_rx));
        Arc::new(Self {
            cluster: cluster.into(),
            init_timestamp: Utc::now(),
            objects,
            set_tx,
            delete_tx,
            error_tx: RwLock::new(None),
            client: RwLock::new(None),
        })
    }

    /// Name of the cluster this agent watches.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// When this state was constructed. Events created at or before this
    /// instant are discarded by the event watcher.
    pub fn init_timestamp(&self) -> DateTime<Utc> {
        self.init_timestamp
    }

    /// Enqueues a registry write. Writes apply in arrival order; a write that
    /// would move a stream backwards in its lifecycle is ignored.
    pub fn set(&self, id: StreamId, state: StreamState) {
        let _ = self.set_tx.send(SetOp::Set(id, state));
    }

    /// Current lifecycle state for `id`, or `None` when unknown.
    pub fn get(&self, id: &StreamId) -> Option<StreamState> {
        self.objects.lock().get(id).copied()
    }

    /// Enqueues removal of `id` from the registry. A subsequent [`set`] for
    /// the same identity starts a fresh lifecycle.
    ///
    /// [`set`]: SharedState::set
    pub fn delete(&self, id: StreamId) {
        let _ = self.delete_tx.send(DeleteOp::Delete(id));
    }

    /// Waits until every write enqueued before this call has been applied.
    pub async fn settled(&self) {
        let (tx, rx) = oneshot::channel();
        if self.set_tx.send(SetOp::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
        let (tx, rx) = oneshot::channel();
        if self.delete_tx.send(DeleteOp::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Non-blocking push onto the shared error channel. A no-op when the sink
    /// is unset, full, or closed: diagnostics must never deadlock the pipeline.
    pub fn error(&self, err: Error) {
        if let Some(tx) = self.error_tx.read().as_ref() {
            let _ = tx.try_send(err);
        }
    }

    /// Installs the aggregate error sink drained by the logger task.
    pub fn set_error_sink(&self, tx: mpsc::Sender<Error>) {
        *self.error_tx.write() = Some(tx);
    }

    /// Drops the error sink so the drainer can observe channel closure.
    pub fn clear_error_sink(&self) {
        *self.error_tx.write() = None;
    }

    /// The cluster client handle, when one has been registered.
    pub fn client(&self) -> Option<Client> {
        self.client.read().clone()
    }

    /// Registers the cluster client. Called once at startup.
    pub fn set_client(&self, client: Client) {
        *self.client.write() = Some(client);
    }
}

async fn write_loop(
    objects: Arc<Mutex<HashMap<StreamId, StreamState>>>,
    mut set_rx: mpsc::UnboundedReceiver<SetOp>,
    mut delete_rx: mpsc::UnboundedReceiver<DeleteOp>,
) {
    loop {
        tokio::select! {
            op = set_rx.recv() => match op {
                Some(SetOp::Set(id, state)) => {
                    let mut objects = objects.lock();
                    let entry = objects.entry(id).or_insert(state);
                    if state >= *entry {
                        *entry = state;
                    }
                }
                Some(SetOp::Barrier(ack)) => {
                    let _ = ack.send(());
                }
                None => break,
            },
            op = delete_rx.recv() => match op {
                Some(DeleteOp::Delete(id)) => {
                    objects.lock().remove(&id);
                }
                Some(DeleteOp::Barrier(ack)) => {
                    let _ = ack.send(());
                }
                None => break,
            },
        }
    }
}
