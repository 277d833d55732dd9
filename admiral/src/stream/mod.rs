//! Long-lived per-workload stream tasks.
//!
//! Each log stream owns one upstream follow-read for a (namespace, pod,
//! container) identity; each metric stream owns the scrape loop for one pod.
//! Tasks publish onto bounded channels with blocking sends, so a slow backend
//! throttles upstream reads.

pub mod decode;
pub mod log;
pub mod metric;
