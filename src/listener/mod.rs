//! TCP listener that turns inbound byte streams into records.
//!
//! The listener owns the server socket and one task per accepted
//! connection. Connections share nothing with each other; the only shared
//! state is the registry used to find and stop them.
//!
//! ```text
//! start() -> bind -> Ready -> accept loop --spawn--> Connection::run
//!                                                     |
//!                                          chunk -> splitter -> sink
//! stop()  -> shutdown signal -> join accept loop -> join connections
//! ```

mod connection;

pub use connection::{
    CloseReason, ConnState, Connection, ConnectionId, ConnectionOptions, ConnectionRegistry,
    DecodePolicy, DEFAULT_READ_BUFFER_SIZE,
};

use crate::error::BindError;
use crate::sink::{ListenerEvent, RecordSink};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Listener settings beyond the bind address.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub connection: ConnectionOptions,
    pub backlog: i32,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// State that exists only while bound.
struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    connections: Arc<ConnectionRegistry>,
}

/// Accepts connections on `address:port` and splits what they send into records.
pub struct Listener {
    address: String,
    port: u16,
    options: ListenerOptions,
    sink: Arc<dyn RecordSink>,
    running: Option<Running>,
}

impl Listener {
    /// Create a listener. Nothing is bound until [`Listener::start`].
    pub fn new(address: impl Into<String>, port: u16, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            address: address.into(),
            port,
            options: ListenerOptions::default(),
            sink,
            running: None,
        }
    }

    pub fn with_options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind and begin accepting.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested. On failure nothing is left running.
    pub async fn start(&mut self) -> Result<SocketAddr, BindError> {
        if let Some(running) = &self.running {
            return Err(BindError::AlreadyStarted {
                addr: running.local_addr,
            });
        }

        let addr = self.resolve().await?;
        let listener =
            bind(addr, self.options.backlog).map_err(|source| BindError::Io { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError::Io { addr, source })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = Arc::new(ConnectionRegistry::new());

        // Ready goes out before any connection event can
        self.sink.event(&ListenerEvent::Ready { addr: local_addr });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            AcceptContext {
                options: self.options.connection.clone(),
                sink: Arc::clone(&self.sink),
                connections: Arc::clone(&connections),
                shutdown: shutdown_rx,
            },
        ));

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
            connections,
        });

        Ok(local_addr)
    }

    /// Close the server socket and every live connection.
    ///
    /// Returns once all of them are gone. Calling it on a stopped listener
    /// does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.shutdown.send_replace(true);

        // No connection can be registered once the accept loop is gone
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        let tasks = running.connections.drain();
        debug!(connections = tasks.len(), "Waiting for connections to close");
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection task ended abnormally");
            }
        }

        self.sink.event(&ListenerEvent::Stopped {
            addr: running.local_addr,
        });
    }

    /// Bound address, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Number of connections currently open.
    pub fn live_connections(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |r| r.connections.len())
    }

    async fn resolve(&self) -> Result<SocketAddr, BindError> {
        let mut addrs = tokio::net::lookup_host((self.address.as_str(), self.port))
            .await
            .map_err(|source| BindError::Resolve {
                address: self.address.clone(),
                source,
            })?;

        addrs.next().ok_or_else(|| BindError::NoAddress {
            address: self.address.clone(),
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.send_replace(true);
            running.accept_task.abort();
            for task in running.connections.drain() {
                task.abort();
            }
        }
    }
}

/// Everything the accept loop needs besides the socket.
struct AcceptContext {
    options: ConnectionOptions,
    sink: Arc<dyn RecordSink>,
    connections: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
}

async fn accept_loop(listener: TcpListener, mut ctx: AcceptContext) {
    let mut next_id = 1u64;

    loop {
        let (stream, peer) = tokio::select! {
            biased;

            _ = connection::stopped(&mut ctx.shutdown) => break,

            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    ctx.sink.event(&ListenerEvent::AcceptError {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            },
        };

        let id = ConnectionId(next_id);
        next_id += 1;

        let key = ctx.connections.insert(id, peer);
        let mut connection = Connection::new(id, peer, &ctx.options);
        let sink = Arc::clone(&ctx.sink);
        let registry = Arc::clone(&ctx.connections);
        let shutdown = ctx.shutdown.clone();

        let task = tokio::spawn(async move {
            connection.run(stream, sink.as_ref(), shutdown).await;
            registry.remove(key, id);
        });
        ctx.connections.attach(key, id, task);
    }

    info!("Accept loop stopped");
}

/// Create a non-blocking listening socket on `addr`.
///
/// SO_REUSEADDR lets a restart bind over TIME_WAIT sockets but still fails
/// when another socket is listening on the same address.
fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::CollectingSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn started(sink: &Arc<CollectingSink>) -> (Listener, SocketAddr) {
        let mut listener = Listener::new("127.0.0.1", 0, Arc::clone(sink) as Arc<dyn RecordSink>);
        let addr = listener.start().await.unwrap();
        (listener, addr)
    }

    fn count(sink: &CollectingSink, pred: impl Fn(&ListenerEvent) -> bool) -> usize {
        sink.events().iter().filter(|e| pred(e)).count()
    }

    #[tokio::test]
    async fn test_ready_fires_once_with_bound_port() {
        let sink = Arc::new(CollectingSink::default());
        let (mut listener, addr) = started(&sink).await;

        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr(), Some(addr));
        assert_eq!(sink.events(), vec![ListenerEvent::Ready { addr }]);

        listener.stop().await;
        assert_eq!(
            count(&sink, |e| matches!(e, ListenerEvent::Ready { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_records_from_fragmented_writes() {
        let sink = Arc::new(CollectingSink::default());
        let (mut listener, addr) = started(&sink).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.set_nodelay(true).unwrap();
        for part in [&b"hel"[..], &b"lo\r\nwor"[..], &b"ld\r\n"[..]] {
            client.write_all(part).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        sink.wait_for("two records", |s| s.records().len() == 2).await;
        assert_eq!(sink.records(), vec!["hello", "world"]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_peer_close_removes_connection() {
        let sink = Arc::new(CollectingSink::default());
        let (mut listener, addr) = started(&sink).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"done\r\npartial").await.unwrap();
        sink.wait_for("record", |s| s.records() == vec!["done"]).await;
        drop(client);

        sink.wait_for("close event", |s| {
            count(s, |e| {
                matches!(
                    e,
                    ListenerEvent::ConnectionClosed {
                        reason: CloseReason::PeerClosed,
                        ..
                    }
                )
            }) == 1
        })
        .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while listener.live_connections() != 0 {
            assert!(tokio::time::Instant::now() < deadline, "connection not removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.records(), vec!["done"]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let sink = Arc::new(CollectingSink::default());
        let (mut listener, addr) = started(&sink).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"al").await.unwrap();
        b.write_all(b"be").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.write_all(b"pha\r\n").await.unwrap();
        b.write_all(b"ta\r\n").await.unwrap();

        sink.wait_for("two records", |s| s.records().len() == 2).await;
        let mut records = sink.records();
        records.sort();
        assert_eq!(records, vec!["alpha", "beta"]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_live_connections() {
        let sink = Arc::new(CollectingSink::default());
        let (mut listener, addr) = started(&sink).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        sink.wait_for("open event", |s| {
            count(s, |e| matches!(e, ListenerEvent::ConnectionOpened { .. })) == 1
        })
        .await;
        assert_eq!(listener.live_connections(), 1);

        tokio::time::timeout(Duration::from_secs(2), listener.stop())
            .await
            .expect("stop hung on an idle connection");

        assert!(!listener.is_running());
        assert_eq!(listener.live_connections(), 0);
        assert_eq!(
            count(&sink, |e| matches!(
                e,
                ListenerEvent::ConnectionClosed {
                    reason: CloseReason::Shutdown,
                    ..
                }
            )),
            1
        );

        // Server side is gone, so the client sees EOF or a reset
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client read hung");
        assert!(matches!(read, Ok(0) | Err(_)));

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sink = Arc::new(CollectingSink::default());
        let (mut listener, _addr) = started(&sink).await;

        listener.stop().await;
        listener.stop().await;

        assert!(!listener.is_running());
        assert_eq!(listener.local_addr(), None);
        assert_eq!(
            count(&sink, |e| matches!(e, ListenerEvent::Stopped { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let sink = Arc::new(CollectingSink::default());
        let mut listener = Listener::new("127.0.0.1", 0, sink.clone() as Arc<dyn RecordSink>);
        listener.stop().await;
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_occupied_port_fails_without_running() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let sink = Arc::new(CollectingSink::default());
        let mut listener = Listener::new("127.0.0.1", port, sink.clone() as Arc<dyn RecordSink>);

        let err = listener.start().await.unwrap_err();
        assert!(matches!(err, BindError::Io { .. }), "unexpected: {err}");
        assert!(!listener.is_running());
        assert_eq!(listener.live_connections(), 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        let sink = Arc::new(CollectingSink::default());
        let mut listener = Listener::new("not an address", 0, sink as Arc<dyn RecordSink>);

        let err = listener.start().await.unwrap_err();
        assert!(matches!(
            err,
            BindError::Resolve { .. } | BindError::NoAddress { .. }
        ));
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let sink = Arc::new(CollectingSink::default());
        let (mut listener, addr) = started(&sink).await;

        let err = listener.start().await.unwrap_err();
        assert!(matches!(err, BindError::AlreadyStarted { addr: a } if a == addr));

        listener.stop().await;
        // A stopped listener can bind again
        listener.start().await.unwrap();
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_drop_releases_socket() {
        let sink = Arc::new(CollectingSink::default());
        let (listener, addr) = started(&sink).await;
        drop(listener);

        // Let the aborted accept task release the socket
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut again = Listener::new("127.0.0.1", addr.port(), sink as Arc<dyn RecordSink>);
        again.start().await.unwrap();
        again.stop().await;
    }

    #[test]
    fn test_bind_reports_address_in_use() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let first = bind("127.0.0.1:0".parse().unwrap(), DEFAULT_BACKLOG).unwrap();
            let addr = first.local_addr().unwrap();
            let err = bind(addr, DEFAULT_BACKLOG).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        });
    }
}
