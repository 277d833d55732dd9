//! Standard-output adapter, mostly useful when trying a configuration out.

use tokio::sync::mpsc;

use super::RawLog;

/// Writes records to stdout. Never errors.
///
/// Depending on the watcher it serves, it consumes the raw-log channel, the
/// event-text channel, or both.
pub struct Local {
    logs: Option<mpsc::Receiver<RawLog>>,
    events: Option<mpsc::Receiver<String>>,
}

impl Local {
    /// Adapter consuming only log records.
    pub fn logs(rx: mpsc::Receiver<RawLog>) -> Self {
        Self {
            logs: Some(rx),
            events: None,
        }
    }

    /// Adapter consuming only event text.
    pub fn events(rx: mpsc::Receiver<String>) -> Self {
        Self {
            logs: None,
            events: Some(rx),
        }
    }

    /// Drains whichever channels are wired until all of them close.
    pub async fn stream(mut self) {
        loop {
            tokio::select! {
                record = recv(&mut self.logs), if self.logs.is_some() => match record {
                    Some(record) => {
                        println!("{}", record.line);
                        println!("{:?}", record.metadata);
                    }
                    None => self.logs = None,
                },
                text = recv(&mut self.events), if self.events.is_some() => match text {
                    Some(text) => println!("{text}"),
                    None => self.events = None,
                },
                else => break,
            }
        }
    }
}

async fn recv<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
