//! Process wiring: channels, backends, watchers, shutdown.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Event, Pod};
use kube::{Api, Client};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    backend::{self, Backend},
    config::{Config, WatcherKind},
    error::Error,
    state::SharedState,
    watch::{self, EventWatcher, LogWatcher, MetricWatcher, PerformanceWatcher},
};

const ERROR_CHANNEL_CAPACITY: usize = 1024;

/// Cancels `token` on SIGINT or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM, relying on ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    token.cancel();
}

/// Starts every configured watcher (or only those of `only`'s kind) and runs
/// until `token` fires.
///
/// Shutdown order: watcher drivers observe the token and mark their streams
/// deleted; stream tasks exit and drop their channel senders; backend
/// adapters drain what is buffered and return; the error drainer exits last.
pub async fn run(
    config: Config,
    only: Option<WatcherKind>,
    token: CancellationToken,
) -> Result<(), Error> {
    let state = SharedState::new(config.cluster.clone());

    let (error_tx, mut error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
    state.set_error_sink(error_tx);
    let drainer = tokio::spawn(async move {
        while let Some(err) = error_rx.recv().await {
            error!(error = %err, "telemetry pipeline error");
        }
    });

    let client = Client::try_default()
        .await
        .map_err(|err| Error::ClusterClient(err.to_string()))?;
    state.set_client(client.clone());
    let http = backend::http::client()?;

    let buffer = config.globals.buffer.max(1);
    let mut drivers: Vec<JoinHandle<()>> = Vec::new();
    let mut adapters: Vec<JoinHandle<()>> = Vec::new();

    for spec in config
        .watchers
        .iter()
        .filter(|spec| only.is_none_or(|kind| spec.kind == kind))
    {
        let Some(backend_spec) = spec.resolved_backend(&config.globals).cloned() else {
            warn!(kind = ?spec.kind, "watcher has no backend, skipping");
            continue;
        };
        match spec.kind {
            WatcherKind::Logs => {
                let (tx, rx) = mpsc::channel(buffer);
                if let Some(adapter) = Backend::for_logs(&backend_spec, rx, &http, &state)? {
                    adapters.push(tokio::spawn(adapter.stream()));
                }
                let shim = LogWatcher::new(spec, Arc::clone(&state), tx, token.child_token());
                let api: Api<Pod> = Api::all(client.clone());
                drivers.push(tokio::spawn(watch::drive(api, shim, token.clone())));
                info!("log watcher started");
            }
            WatcherKind::Events => {
                let (tx, rx) = mpsc::channel(buffer);
                if let Some(adapter) = Backend::for_text(&backend_spec, rx, &http, &state)? {
                    adapters.push(tokio::spawn(adapter.stream()));
                }
                let shim = EventWatcher::new(Arc::clone(&state), tx, spec.filter.clone());
                let api: Api<Event> = Api::all(client.clone());
                drivers.push(tokio::spawn(watch::drive(api, shim, token.clone())));
                info!("event watcher started");
            }
            WatcherKind::Metrics => {
                let (tx, rx) = mpsc::channel(buffer);
                if let Some(adapter) = Backend::for_metrics(&backend_spec, rx, &http, &state)? {
                    adapters.push(tokio::spawn(adapter.stream()));
                }
                let shim = MetricWatcher::new(spec, Arc::clone(&state), tx, token.child_token());
                let api: Api<Pod> = Api::all(client.clone());
                drivers.push(tokio::spawn(watch::drive(api, shim, token.clone())));
                info!("metric watcher started");
            }
            WatcherKind::Performance => {
                let (tx, rx) = mpsc::channel(buffer);
                if let Some(adapter) = Backend::for_text(&backend_spec, rx, &http, &state)? {
                    adapters.push(tokio::spawn(adapter.stream()));
                }
                let target = spec.target.clone().unwrap_or_default().url;
                let shim = PerformanceWatcher::new(
                    Arc::clone(&state),
                    tx,
                    spec.apps.clone(),
                    target,
                    http.clone(),
                );
                let api: Api<Pod> = Api::all(client.clone());
                drivers.push(tokio::spawn(watch::drive(api, shim, token.clone())));
                info!("performance watcher started");
            }
        }
    }

    if drivers.is_empty() {
        warn!("no watchers configured, exiting");
    }

    for driver in drivers {
        if let Err(err) = driver.await {
            warn!(error = %err, "watcher driver ended abnormally");
        }
    }
    for adapter in adapters {
        if let Err(err) = adapter.await {
            warn!(error = %err, "backend adapter ended abnormally");
        }
    }

    state.clear_error_sink();
    let _ = drainer.await;
    Ok(())
}
