//! Live listener fan-out
//!
//! A [`LiveListener`] accepts stream connections in a background task and
//! mirrors every broadcast byte sequence to all of them. Delivery is best
//! effort: a connection whose write fails or times out is dropped and never
//! retried, so a slow consumer cannot hold up the caller for longer than the
//! write timeout.

use nettrace_core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::ListenAddress;

/// Default bound on a single write to a connection
///
/// [`LiveListener::broadcast`] blocks its caller for at most this long per
/// stalled connection.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One accepted consumer
enum Connection {
    Tcp(std::net::TcpStream),
    Unix(UnixStream),
}

impl Connection {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => (&*stream).write_all(bytes),
            Connection::Unix(stream) => (&*stream).write_all(bytes),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Connection::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Connection::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
    }
}

/// State shared between the listener handle and its accept task
struct Shared {
    /// Live connections keyed by accept order
    connections: RwLock<HashMap<u64, Connection>>,
    /// Bytes every new connection receives before anything else
    preamble: Mutex<Vec<u8>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl Shared {
    /// Replay the preamble and join the broadcast set
    ///
    /// Holding the preamble lock across both steps keeps a concurrent
    /// [`LiveListener::append_preamble`] from slipping in between.
    fn admit(&self, connection: Connection, peer: &str) {
        let preamble = self.preamble.lock();
        if !preamble.is_empty() {
            if let Err(e) = connection.send(&preamble) {
                debug!(peer = %peer, error = %e, "Dropping listener connection during preamble");
                return;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().insert(id, connection);
        info!(peer = %peer, connection = id, "Live listener connected");
    }

    fn broadcast(&self, bytes: &[u8]) -> usize {
        let mut failed = Vec::new();
        let delivered = {
            let connections = self.connections.read();
            for (id, connection) in connections.iter() {
                if let Err(e) = connection.send(bytes) {
                    debug!(connection = id, error = %e, "Dropping live listener connection");
                    failed.push(*id);
                }
            }
            connections.len() - failed.len()
        };

        if !failed.is_empty() {
            let mut connections = self.connections.write();
            for id in failed {
                if let Some(connection) = connections.remove(&id) {
                    connection.shutdown();
                }
            }
        }
        delivered
    }
}

/// Socket listener mirroring the trace stream to connected consumers
pub struct LiveListener {
    address: ListenAddress,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    socket_path: Option<PathBuf>,
    closed: AtomicBool,
}

impl LiveListener {
    /// Parse `address` and bind a listener with the default write timeout
    pub async fn bind(address: &str) -> Result<Self> {
        Self::bind_address(address.parse()?, DEFAULT_WRITE_TIMEOUT).await
    }

    /// Bind a listener and start accepting connections
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind_address(address: ListenAddress, write_timeout: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            connections: RwLock::new(HashMap::new()),
            preamble: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            write_timeout,
        });

        let (bound, socket_path, accept_task) = match &address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|e| Error::listener(format!("failed to bind {}: {}", address, e)))?;
                let local = listener.local_addr()?;
                let task = tokio::spawn(accept_tcp(listener, shared.clone()));
                (ListenAddress::Tcp(local.to_string()), None, task)
            }
            ListenAddress::Tcp4(addr) | ListenAddress::Tcp6(addr) => {
                let want_v4 = matches!(address, ListenAddress::Tcp4(_));
                let target = resolve(addr, want_v4).await?;
                let listener = TcpListener::bind(target)
                    .await
                    .map_err(|e| Error::listener(format!("failed to bind {}: {}", address, e)))?;
                let local = listener.local_addr()?.to_string();
                let task = tokio::spawn(accept_tcp(listener, shared.clone()));
                let bound = if want_v4 {
                    ListenAddress::Tcp4(local)
                } else {
                    ListenAddress::Tcp6(local)
                };
                (bound, None, task)
            }
            ListenAddress::Unix(path) => {
                let listener = UnixListener::bind(path)
                    .map_err(|e| Error::listener(format!("failed to bind {}: {}", address, e)))?;
                let task = tokio::spawn(accept_unix(listener, shared.clone()));
                (address.clone(), Some(path.clone()), task)
            }
        };

        info!(address = %bound, "Live listener bound");

        Ok(Self {
            address: bound,
            shared,
            accept_task: Mutex::new(Some(accept_task)),
            socket_path,
            closed: AtomicBool::new(false),
        })
    }

    /// Address actually bound (ephemeral ports resolved)
    pub fn local_addr(&self) -> &ListenAddress {
        &self.address
    }

    /// Number of currently connected consumers
    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    /// Write `bytes` to every live connection
    ///
    /// Connections that fail are removed. Returns how many connections
    /// received the bytes.
    pub fn broadcast(&self, bytes: &[u8]) -> usize {
        self.shared.broadcast(bytes)
    }

    /// Broadcast `bytes` and keep them for connections that join later
    pub fn append_preamble(&self, bytes: &[u8]) -> usize {
        let mut preamble = self.shared.preamble.lock();
        preamble.extend_from_slice(bytes);
        self.shared.broadcast(bytes)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting, disconnect everyone and release the socket
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }

        let mut connections = self.shared.connections.write();
        for connection in connections.values() {
            connection.shutdown();
        }
        connections.clear();
        drop(connections);

        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove listener socket");
            }
        }

        info!(address = %self.address, "Live listener closed");
    }
}

impl Drop for LiveListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve(addr: &str, want_v4: bool) -> Result<SocketAddr> {
    let candidates = lookup_host(addr)
        .await
        .map_err(|e| Error::InvalidAddress(format!("cannot resolve '{}': {}", addr, e)))?;

    candidates
        .into_iter()
        .find(|a| a.is_ipv4() == want_v4)
        .ok_or_else(|| {
            Error::InvalidAddress(format!(
                "'{}' has no {} address",
                addr,
                if want_v4 { "IPv4" } else { "IPv6" }
            ))
        })
}

async fn accept_tcp(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let connection = socket.into_std().and_then(|stream| {
                    stream.set_nonblocking(false)?;
                    stream.set_write_timeout(Some(shared.write_timeout))?;
                    Ok(Connection::Tcp(stream))
                });
                admit(&shared, connection, peer.to_string()).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to accept listener connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_unix(listener: UnixListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let connection = socket.into_std().and_then(|stream| {
                    stream.set_nonblocking(false)?;
                    stream.set_write_timeout(Some(shared.write_timeout))?;
                    Ok(Connection::Unix(stream))
                });
                admit(&shared, connection, "unix".to_string()).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to accept listener connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Hand a freshly accepted connection to the blocking pool for admission
async fn admit(shared: &Arc<Shared>, connection: io::Result<Connection>, peer: String) {
    let connection = match connection {
        Ok(connection) => connection,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to configure listener connection");
            return;
        }
    };

    let shared = shared.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || shared.admit(connection, &peer)).await {
        error!(error = %e, "Listener admission task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn wait_for_connections(listener: &LiveListener, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while listener.connection_count() != count {
            assert!(Instant::now() < deadline, "timed out waiting for connections");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn tcp_addr(listener: &LiveListener) -> String {
        match listener.local_addr() {
            ListenAddress::Tcp(addr) => addr.clone(),
            other => panic!("unexpected address {}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let listener = LiveListener::bind("tcp:127.0.0.1:0").await.unwrap();
        let addr = tcp_addr(&listener);

        let mut first = TcpStream::connect(&addr).await.unwrap();
        let mut second = TcpStream::connect(&addr).await.unwrap();
        wait_for_connections(&listener, 2).await;

        assert_eq!(listener.broadcast(b"block-1"), 2);
        assert_eq!(listener.broadcast(b"block-2"), 2);

        for stream in [&mut first, &mut second] {
            let mut buf = [0u8; 14];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"block-1block-2");
        }
    }

    #[tokio::test]
    async fn test_closed_connection_is_dropped() {
        let listener = LiveListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_addr(&listener);

        let client = TcpStream::connect(&addr).await.unwrap();
        wait_for_connections(&listener, 1).await;
        drop(client);

        // The peer reset surfaces on one of the next writes
        let deadline = Instant::now() + Duration::from_secs(5);
        while listener.connection_count() > 0 {
            assert!(Instant::now() < deadline, "dead connection never dropped");
            listener.broadcast(&[0u8; 1024]);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(listener.broadcast(b"nobody"), 0);
    }

    #[tokio::test]
    async fn test_stalled_connection_dropped_after_write_timeout() {
        let timeout = Duration::from_millis(100);
        let address: ListenAddress = "tcp:127.0.0.1:0".parse().unwrap();
        let listener = LiveListener::bind_address(address, timeout).await.unwrap();
        let addr = tcp_addr(&listener);

        // Never reads, so the socket buffers eventually fill up
        let _client = TcpStream::connect(&addr).await.unwrap();
        wait_for_connections(&listener, 1).await;

        let chunk = vec![0u8; 1 << 20];
        let mut slowest = Duration::ZERO;
        for _ in 0..512 {
            let started = Instant::now();
            let delivered = listener.broadcast(&chunk);
            slowest = slowest.max(started.elapsed());
            if delivered == 0 {
                break;
            }
        }

        assert_eq!(listener.connection_count(), 0);
        assert!(slowest >= timeout / 2, "no write ever blocked: {:?}", slowest);
        assert!(slowest < Duration::from_secs(2), "broadcast blocked {:?}", slowest);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_preamble() {
        let listener = LiveListener::bind("tcp:127.0.0.1:0").await.unwrap();
        let addr = tcp_addr(&listener);

        assert_eq!(listener.append_preamble(b"SHB"), 0);
        listener.append_preamble(b"IDB");
        assert_eq!(listener.broadcast(b"missed"), 0);

        let mut client = TcpStream::connect(&addr).await.unwrap();
        wait_for_connections(&listener, 1).await;
        listener.broadcast(b"EPB");

        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SHBIDBEPB");
    }

    #[tokio::test]
    async fn test_unix_listener_removes_socket_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let address = format!("unix:{}", path.display());

        let listener = LiveListener::bind(&address).await.unwrap();
        assert!(path.exists());

        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        wait_for_connections(&listener, 1).await;
        assert_eq!(listener.broadcast(b"hello"), 1);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        listener.close();
        assert!(listener.is_closed());
        assert_eq!(listener.connection_count(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        assert!(matches!(
            LiveListener::bind("udp:127.0.0.1:0").await,
            Err(Error::InvalidAddress(_))
        ));
    }
}
