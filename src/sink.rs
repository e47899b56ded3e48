//! Output sinks for records and listener lifecycle events.
//!
//! The listener never prints on its own. Everything it produces goes through
//! a [`RecordSink`] handed to it at construction.

use crate::error::DecodeError;
use crate::listener::{CloseReason, ConnectionId};
use clap::ValueEnum;
use serde::Deserialize;
use std::io::{self, Write};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Lifecycle events reported alongside records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The listener is bound and accepting. Fires once per successful start.
    Ready { addr: SocketAddr },
    ConnectionOpened {
        id: ConnectionId,
        peer: SocketAddr,
    },
    ConnectionClosed {
        id: ConnectionId,
        peer: SocketAddr,
        reason: CloseReason,
        /// Bytes of unterminated input thrown away on close.
        discarded: usize,
    },
    DecodeError {
        id: ConnectionId,
        error: DecodeError,
    },
    AcceptError {
        kind: io::ErrorKind,
        message: String,
    },
    Stopped { addr: SocketAddr },
}

/// Destination for completed records and lifecycle events.
///
/// Called concurrently from every connection task.
pub trait RecordSink: Send + Sync {
    fn record(&self, conn: ConnectionId, record: &str);

    fn event(&self, event: &ListenerEvent);
}

/// Sink selection from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    /// Records and events as log lines
    Log,
    /// Records on stdout, events as log lines
    #[default]
    Stdout,
}

/// Sink that writes everything through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn record(&self, conn: ConnectionId, record: &str) {
        info!(conn = %conn, record, "Record");
    }

    fn event(&self, event: &ListenerEvent) {
        log_event(event);
    }
}

/// Sink that prints one record per line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl RecordSink for StdoutSink {
    fn record(&self, conn: ConnectionId, record: &str) {
        let mut out = io::stdout().lock();
        if let Err(e) = writeln!(out, "{record}") {
            warn!(conn = %conn, error = %e, "Failed to write record to stdout");
        }
    }

    fn event(&self, event: &ListenerEvent) {
        log_event(event);
    }
}

fn log_event(event: &ListenerEvent) {
    match event {
        ListenerEvent::Ready { addr } => info!(addr = %addr, "Listener ready"),
        ListenerEvent::ConnectionOpened { id, peer } => {
            debug!(conn = %id, peer = %peer, "Connection opened")
        }
        ListenerEvent::ConnectionClosed {
            id,
            peer,
            reason,
            discarded,
        } => debug!(
            conn = %id,
            peer = %peer,
            reason = ?reason,
            discarded,
            "Connection closed"
        ),
        ListenerEvent::DecodeError { id, error } => {
            warn!(conn = %id, error = %error, "Dropped undecodable chunk")
        }
        ListenerEvent::AcceptError { kind, message } => {
            warn!(kind = ?kind, error = %message, "Failed to accept connection")
        }
        ListenerEvent::Stopped { addr } => info!(addr = %addr, "Listener stopped"),
    }
}

/// In-memory sink for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    pub struct CollectingSink {
        records: Mutex<Vec<(ConnectionId, String)>>,
        events: Mutex<Vec<ListenerEvent>>,
    }

    impl CollectingSink {
        pub fn records(&self) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|(_, r)| r.clone())
                .collect()
        }

        pub fn events(&self) -> Vec<ListenerEvent> {
            self.events.lock().unwrap().clone()
        }

        /// Poll until `cond` holds, panicking after two seconds.
        pub async fn wait_for<F>(&self, what: &str, cond: F)
        where
            F: Fn(&Self) -> bool,
        {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while !cond(self) {
                if tokio::time::Instant::now() > deadline {
                    panic!(
                        "timed out waiting for {what}; records={:?} events={:?}",
                        self.records(),
                        self.events()
                    );
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    impl RecordSink for CollectingSink {
        fn record(&self, conn: ConnectionId, record: &str) {
            self.records
                .lock()
                .unwrap()
                .push((conn, record.to_string()));
        }

        fn event(&self, event: &ListenerEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
