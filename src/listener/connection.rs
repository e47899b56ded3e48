//! Per-connection read loop and the registry of live connections.
//!
//! Each accepted socket is owned by exactly one [`Connection`], which reads
//! chunks in arrival order, feeds them through its private
//! [`RecordSplitter`], and hands completed records to the sink.

use crate::error::{ConnectionError, SplitError};
use crate::sink::{ListenerEvent, RecordSink};
use crate::splitter::{Delimiter, RecordSplitter, DEFAULT_MAX_RECORD_SIZE};
use bytes::BytesMut;
use clap::ValueEnum;
use serde::Deserialize;
use slab::Slab;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default size of a single read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Identifier of a connection, unique for the lifetime of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading chunks. May emit zero or more records per chunk.
    Open,
    /// Terminal. Socket released, residual input discarded.
    Closed,
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent EOF.
    PeerClosed,
    /// The listener was stopped.
    Shutdown,
    /// Read failed.
    Io(io::ErrorKind),
    /// Undecodable chunk under [`DecodePolicy::Close`].
    Decode,
    /// Unterminated record outgrew `max_record_size`.
    RecordTooLarge,
}

impl From<&ConnectionError> for CloseReason {
    fn from(e: &ConnectionError) -> Self {
        match e {
            ConnectionError::Io(e) => CloseReason::Io(e.kind()),
            ConnectionError::Decode(_) => CloseReason::Decode,
            ConnectionError::RecordTooLarge { .. } => CloseReason::RecordTooLarge,
        }
    }
}

/// What to do with a chunk that is not valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Report it, drop the chunk, keep reading
    #[default]
    Drop,
    /// Report it and close the connection
    Close,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub delimiter: Delimiter,
    pub decode_policy: DecodePolicy,
    pub read_buffer_size: usize,
    pub max_record_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::default(),
            decode_policy: DecodePolicy::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
        }
    }
}

/// A single accepted connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnState,
    splitter: RecordSplitter,
    decode_policy: DecodePolicy,
    read_buffer_size: usize,
}

impl Connection {
    /// Create a new connection in the `Open` state.
    pub fn new(id: ConnectionId, peer: SocketAddr, options: &ConnectionOptions) -> Self {
        Self {
            id,
            peer,
            state: ConnState::Open,
            splitter: RecordSplitter::new(options.delimiter, options.max_record_size),
            decode_policy: options.decode_policy,
            read_buffer_size: options.read_buffer_size.max(1),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Read `stream` until EOF, error, or shutdown.
    ///
    /// Emits `ConnectionOpened` first and `ConnectionClosed` last; any
    /// unterminated tail is discarded on the way out.
    pub async fn run<S>(
        &mut self,
        mut stream: S,
        sink: &dyn RecordSink,
        mut shutdown: watch::Receiver<bool>,
    ) -> CloseReason
    where
        S: AsyncRead + Unpin,
    {
        sink.event(&ListenerEvent::ConnectionOpened {
            id: self.id,
            peer: self.peer,
        });

        let reason = match self.read_loop(&mut stream, sink, &mut shutdown).await {
            Ok(reason) => reason,
            Err(e) => {
                debug!(conn = %self.id, error = %e, "Connection error");
                CloseReason::from(&e)
            }
        };

        let discarded = self.splitter.finish();
        self.state = ConnState::Closed;

        sink.event(&ListenerEvent::ConnectionClosed {
            id: self.id,
            peer: self.peer,
            reason: reason.clone(),
            discarded,
        });

        reason
    }

    async fn read_loop<S>(
        &mut self,
        stream: &mut S,
        sink: &dyn RecordSink,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CloseReason, ConnectionError>
    where
        S: AsyncRead + Unpin,
    {
        let mut chunk = BytesMut::with_capacity(self.read_buffer_size);
        let id = self.id;

        loop {
            chunk.clear();

            let n = tokio::select! {
                biased;
                _ = stopped(shutdown) => return Ok(CloseReason::Shutdown),
                read = stream.read_buf(&mut chunk) => read?,
            };

            if n == 0 {
                trace!(conn = %id, "Connection closed by peer");
                return Ok(CloseReason::PeerClosed);
            }

            trace!(conn = %id, bytes = n, "Received chunk");

            match self.splitter.push(&chunk, |record| sink.record(id, &record)) {
                Ok(()) => {}
                Err(SplitError::Decode(error)) => {
                    sink.event(&ListenerEvent::DecodeError { id, error });
                    if self.decode_policy == DecodePolicy::Close {
                        return Err(ConnectionError::Decode(error));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Resolves once shutdown is signalled. A dropped sender counts as shutdown too.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// A live connection as seen by the listener.
struct LiveConnection {
    id: ConnectionId,
    peer: SocketAddr,
    task: Option<JoinHandle<()>>,
}

/// Registry of live connections using slab allocation.
///
/// Entries are inserted by the accept loop and removed by the connection
/// task itself when it closes, or drained all at once on stop.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<LiveConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Slab::new()),
        }
    }

    /// Register a connection before its task is spawned.
    pub fn insert(&self, id: ConnectionId, peer: SocketAddr) -> usize {
        self.lock().insert(LiveConnection {
            id,
            peer,
            task: None,
        })
    }

    /// Attach the task driving `id`. Dropped if the connection already closed.
    pub fn attach(&self, key: usize, id: ConnectionId, task: JoinHandle<()>) {
        if let Some(conn) = self.lock().get_mut(key).filter(|c| c.id == id) {
            conn.task = Some(task);
        }
    }

    /// Remove `id` if it is still registered under `key`.
    pub fn remove(&self, key: usize, id: ConnectionId) -> bool {
        let mut connections = self.lock();
        if connections.get(key).is_some_and(|c| c.id == id) {
            connections.remove(key);
            true
        } else {
            false
        }
    }

    /// Peer address of a live connection.
    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.lock()
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(_, c)| c.peer)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empty the registry, returning the tasks of every connection in it.
    pub fn drain(&self) -> Vec<JoinHandle<()>> {
        self.lock()
            .drain()
            .filter_map(|c| {
                debug!(conn = %c.id, peer = %c.peer, "Stopping connection");
                c.task
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slab<LiveConnection>> {
        // Nothing panics while the lock is held
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
