//! Watcher shims bridging the cluster watch layer to stream tasks.
//!
//! The informer contract is the [`Watcher`] trait: object adds and updates
//! arrive merged as `apply`, removals as `delete`. [`drive`] runs a
//! `kube_runtime` watcher over an [`Api`] and dispatches into a shim until
//! the cancellation token fires; the underlying watcher already recovers
//! from watch-stream errors by re-listing.

use std::{fmt::Debug, pin::pin};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{api::Api, runtime::watcher, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod events;
pub mod logs;
pub mod metrics;
pub mod performance;

pub use events::EventWatcher;
pub use logs::LogWatcher;
pub use metrics::MetricWatcher;
pub use performance::PerformanceWatcher;

/// Object-lifecycle callbacks delivered by the informer driver.
#[async_trait]
pub trait Watcher<K>: Send {
    /// An object was added or modified.
    async fn apply(&mut self, obj: &K);
    /// An object was removed.
    async fn delete(&mut self, obj: &K);
    /// The driver is stopping; release every resource the shim owns.
    async fn shutdown(&mut self) {}
}

/// Dispatches watch events for `api` into `shim` until `token` fires.
pub async fn drive<K, W>(api: Api<K>, mut shim: W, token: CancellationToken)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    W: Watcher<K>,
{
    let mut events = pin!(watcher(api, watcher::Config::default()));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj))) => {
                    shim.apply(&obj).await;
                }
                Some(Ok(watcher::Event::Delete(obj))) => shim.delete(&obj).await,
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!(error = %err, "watch stream error"),
                None => break,
            }
        }
    }
    shim.shutdown().await;
}
