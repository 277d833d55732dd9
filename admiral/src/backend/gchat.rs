//! Chat webhook push adapter.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::http::{post_json, HttpClient};
use crate::{error::Error, state::SharedState};

/// POSTs each received text item to a chat webhook.
pub struct GChat {
    url: String,
    client: HttpClient,
    rx: mpsc::Receiver<String>,
    state: Arc<SharedState>,
}

#[derive(Serialize)]
struct Message<'a> {
    text: &'a str,
}

impl GChat {
    /// Builds the adapter against the webhook URL.
    pub fn new(
        url: &str,
        client: HttpClient,
        rx: mpsc::Receiver<String>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            url: url.to_string(),
            client,
            rx,
            state,
        }
    }

    /// Drains the text channel until it closes.
    pub async fn stream(mut self) {
        while let Some(text) = self.rx.recv().await {
            match post_json(&self.client, &self.url, &Message { text: &text }).await {
                Ok((status, _)) if status.is_success() => {
                    debug!("posted message to webhook");
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

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn message_payload_matches_the_wire_format() {
        let payload = serde_json::to_value(Message { text: "cluster: c1\nreason: NodeNotReady" })
            .expect("serialize");
        assert_json_eq!(payload, json!({"text": "cluster: c1\nreason: NodeNotReady"}));
    }
}
