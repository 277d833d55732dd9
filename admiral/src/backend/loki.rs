//! Log-store push adapter speaking the Loki wire format.

use std::{collections::BTreeMap, sync::Arc};

use http::StatusCode;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    http::{post_json, HttpClient},
    RawLog,
};
use crate::{error::Error, state::SharedState};

/// Pushes every received record to the Loki log-push API.
///
/// Delivery is at-most-once: a record that the sink rejects is reported on
/// the error channel and dropped, bounding memory while the sink is degraded.
pub struct Loki {
    url: String,
    client: HttpClient,
    rx: mpsc::Receiver<RawLog>,
    state: Arc<SharedState>,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<PushStream<'a>>,
}

#[derive(Serialize)]
struct PushStream<'a> {
    stream: &'a BTreeMap<String, String>,
    values: Vec<[&'a str; 2]>,
}

fn push_url(base_url: &str) -> String {
    format!("{}/loki/api/v1/push", base_url.trim_end_matches('/'))
}

fn push_payload(record: &RawLog) -> PushRequest<'_> {
    PushRequest {
        streams: vec![PushStream {
            stream: &record.metadata,
            values: vec![[record.timestamp.as_str(), record.line.as_str()]],
        }],
    }
}

impl Loki {
    /// Builds the adapter against the host's log-push endpoint.
    pub fn new(
        base_url: &str,
        client: HttpClient,
        rx: mpsc::Receiver<RawLog>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            url: push_url(base_url),
            client,
            rx,
            state,
        }
    }

    /// Drains the raw-log channel until it closes.
    pub async fn stream(mut self) {
        while let Some(record) = self.rx.recv().await {
            match post_json(&self.client, &self.url, &push_payload(&record)).await {
                Ok((StatusCode::NO_CONTENT, _)) => {
                    debug!(timestamp = %record.timestamp, "pushed record to loki");
                }
                Ok((status, body)) => self.state.error(Error::BackendStatus {
                    status: status.as_u16(),
                    body,
                }),
                Err(err) => self.state.error(err),
            }
        }
    }
}
