//! YAML configuration mapped onto plain structs.
//!
//! The file names the cluster, an optional global backend, and the list of
//! watchers to start. Every watcher may override the backend and carries the
//! knobs for its own kind (annotations and ignore lists for logs, a reason
//! filter for events, a target for performance probes).

use std::{collections::BTreeMap, env, fs, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::Error;

const DEFAULT_CONFIG_FILE: &str = "admiral.yaml";
const CONFIG_PATH_ENV: &str = "ADMIRAL_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Name of the cluster, attached to every emitted event text.
    pub cluster: String,
    /// Settings shared by every watcher unless overridden.
    #[serde(default)]
    pub globals: Globals,
    /// The watchers to start. Monolith mode starts all of them.
    #[serde(default)]
    pub watchers: Vec<WatcherSpec>,
}

/// Watcher-independent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Globals {
    /// Fallback backend for watchers without their own.
    pub backend: Option<BackendSpec>,
    /// Capacity of the bounded channels between stream tasks and backends.
    /// The default of 1 keeps back-pressure tight: a slow backend throttles
    /// upstream reads after a single in-flight record.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            backend: None,
            buffer: default_buffer(),
        }
    }
}

fn default_buffer() -> usize {
    1
}

/// One watcher to run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherSpec {
    /// Which telemetry stream this watcher relays.
    #[serde(rename = "type")]
    pub kind: WatcherKind,
    /// Backend override for this watcher.
    pub backend: Option<BackendSpec>,
    /// Only pods carrying this annotation key are watched. Absent = all pods.
    pub pod_annotation: Option<String>,
    /// Pod annotation key whose comma-separated value lists containers to skip.
    pub ignore_container_annotation: Option<String>,
    /// Pod annotation key whose value names the JSON field holding the log
    /// line's own timestamp.
    pub time_key_annotation: Option<String>,
    /// Containers skipped cluster-wide, regardless of pod annotations.
    #[serde(default)]
    pub ignore_containers: Vec<String>,
    /// When non-empty, only pods whose `app` label is listed here are watched.
    #[serde(default)]
    pub apps: Vec<String>,
    /// Event reasons to forward. Events only; empty forwards everything.
    #[serde(default)]
    pub filter: Vec<String>,
    /// Probe target for performance watchers.
    pub target: Option<TargetSpec>,
    /// How long a broken log stream sleeps before re-opening.
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

impl WatcherSpec {
    /// The backend this watcher writes to, falling back to the global one.
    pub fn resolved_backend<'a>(&'a self, globals: &'a Globals) -> Option<&'a BackendSpec> {
        self.backend.as_ref().or(globals.backend.as_ref())
    }

    /// Backoff window for re-opening broken upstream reads.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds)
    }
}

fn default_backoff_seconds() -> u64 {
    60
}

/// The kinds of telemetry a watcher can relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherKind {
    /// Container stdout/stderr logs.
    Logs,
    /// Filtered cluster events.
    Events,
    /// Node, pod and container resource metrics.
    Metrics,
    /// One-shot performance probes against a target URL.
    Performance,
}

/// Where a watcher ships its output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSpec {
    /// Backend kind. The empty string disables the watcher's output.
    #[serde(rename = "type", default)]
    pub kind: BackendKind,
    /// Endpoint of the sink. Required for everything but `local` and disabled.
    #[serde(default)]
    pub url: String,
    /// Free-form options passed to the adapter.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// The closed set of backend adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Log-store push (Loki wire format).
    Loki,
    /// Chat webhook push.
    Gchat,
    /// Standard output.
    Local,
    /// Prometheus push gateway.
    Pushgateway,
    /// No backend; the watcher's output is dropped.
    #[default]
    #[serde(rename = "")]
    Disabled,
}

/// Configuration file location, in precedence order: the `-f/--file` flag,
/// `$ADMIRAL_CONFIG`, then `./admiral.yaml`.
pub fn config_path(flag: Option<&Path>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

impl Config {
    /// Loads and validates the configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        let config: Self =
            serde_yaml::from_str(&raw).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints the deserializer cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster.is_empty() {
            return Err(Error::Config("cluster name must not be empty".into()));
        }
        for watcher in &self.watchers {
            let backend = watcher.resolved_backend(&self.globals);
            let kinds: &[BackendKind] = match watcher.kind {
                WatcherKind::Logs => &[BackendKind::Loki, BackendKind::Local],
                WatcherKind::Events | WatcherKind::Performance => {
                    &[BackendKind::Gchat, BackendKind::Local]
                }
                WatcherKind::Metrics => &[BackendKind::Pushgateway],
            };
            let Some(spec) = backend else {
                return Err(Error::Config(format!(
                    "{:?} watcher has no backend; set globals.backend or watcher backend",
                    watcher.kind
                )));
            };
            if spec.kind != BackendKind::Disabled && !kinds.contains(&spec.kind) {
                return Err(Error::Config(format!(
                    "backend type {:?} cannot serve a {:?} watcher",
                    spec.kind, watcher.kind
                )));
            }
            let url_required = !matches!(spec.kind, BackendKind::Local | BackendKind::Disabled);
            if url_required && spec.url.is_empty() {
                return Err(Error::Config(format!(
                    "backend for {:?} watcher requires a url",
                    watcher.kind
                )));
            }
            if watcher.kind == WatcherKind::Performance
                && watcher.target.as_ref().is_none_or(|t| t.url.is_empty())
            {
                return Err(Error::Config(
                    "performance watcher requires target.url".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Target of performance probes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetSpec {
    /// URL fetched once per whitelisted container.
    #[serde(default)]
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let yaml = r#"
cluster: c1
globals:
  backend:
    type: loki
    url: http://loki.monitoring:3100
  buffer: 4
watchers:
  - type: logs
    podAnnotation: admiral.io/watch
    ignoreContainerAnnotation: admiral.io/ignore
    timeKeyAnnotation: admiral.io/time-key
    ignoreContainers: [istio-proxy]
  - type: events
    filter: [FailedScheduling, NodeNotReady]
    backend:
      type: gchat
      url: https://chat.example.com/hook
  - type: metrics
    backend:
      type: pushgateway
      url: http://pushgateway.monitoring:9091
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        config.validate().expect("validate");
        assert_eq!(config.cluster, "c1");
        assert_eq!(config.globals.buffer, 4);
        assert_eq!(config.watchers.len(), 3);
        assert_eq!(config.watchers[0].kind, WatcherKind::Logs);
        assert_eq!(
            config.watchers[0].ignore_container_annotation.as_deref(),
            Some("admiral.io/ignore")
        );
        assert_eq!(config.watchers[1].filter.len(), 2);
        assert_eq!(config.watchers[0].backoff(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_watcher_type_is_rejected() {
        let yaml = "cluster: c1\nwatchers:\n  - type: traces\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn missing_backend_url_is_rejected() {
        let yaml = r#"
cluster: c1
watchers:
  - type: logs
    backend:
      type: loki
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn empty_backend_type_disables_output() {
        let yaml = r#"
cluster: c1
watchers:
  - type: logs
    backend:
      type: ""
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        config.validate().expect("disabled backend needs no url");
        assert_eq!(
            config.watchers[0].backend.as_ref().map(|b| b.kind),
            Some(BackendKind::Disabled)
        );
    }

    #[test]
    fn mismatched_backend_kind_is_rejected() {
        let yaml = r#"
cluster: c1
watchers:
  - type: metrics
    backend:
      type: gchat
      url: https://chat.example.com/hook
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
