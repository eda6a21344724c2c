//! Unix domain socket transport backend

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::transport::{Endpoint, Incoming, Transport, TransportEvent, TransportServer};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// State shared between a socket handle and its I/O tasks
#[derive(Debug)]
struct SocketShared {
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SocketShared {
    /// Tear the connection down once, reporting `error` first if given
    fn shutdown(&self, error: Option<String>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the writer flush what is queued and exit
        self.outbound.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(error) = error {
            let _ = self.events.send(TransportEvent::Error(error));
        }
        let _ = self.events.send(TransportEvent::Closed);
    }
}

/// Write half of a connected Unix socket
#[derive(Debug)]
pub struct SocketTransport {
    shared: Arc<SocketShared>,
}

impl SocketTransport {
    /// Connect to a listening relay socket
    pub async fn connect(path: impl AsRef<Path>) -> Result<Endpoint> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        debug!(socket = %path.display(), "Connected to relay socket");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an established stream; spawns its reader and writer tasks
    pub fn from_stream(stream: UnixStream) -> Endpoint {
        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SocketShared {
            connected: AtomicBool::new(true),
            outbound: Mutex::new(Some(outbound_tx)),
            events: events_tx,
            reader: Mutex::new(None),
        });

        tokio::spawn(write_loop(write_half, outbound_rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));
        if shared.connected.load(Ordering::SeqCst) {
            *shared.reader.lock() = Some(reader);
        }

        Endpoint::new(Arc::new(SocketTransport { shared }), events_rx)
    }
}

impl Transport for SocketTransport {
    fn write(&self, data: &[u8]) {
        if !self.is_connected() {
            return;
        }
        if let Some(outbound) = self.shared.outbound.lock().as_ref() {
            let _ = outbound.send(data.to_vec());
        }
    }

    fn close(&self) {
        self.shared.shutdown(None);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<SocketShared>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                shared.shutdown(None);
                break;
            }
            Ok(n) => {
                let _ = shared.events.send(TransportEvent::Data(buf[..n].to_vec()));
            }
            Err(e) => {
                shared.shutdown(Some(e.to_string()));
                break;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<SocketShared>,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!(error = %e, "Socket write failed");
            shared.shutdown(Some(e.to_string()));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Listening Unix socket bound to a filesystem path
pub struct SocketServer {
    path: PathBuf,
    accept_task: Option<JoinHandle<()>>,
    accepted: Arc<Mutex<Vec<Arc<dyn Transport>>>>,
}

impl SocketServer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accept_task: None,
            accepted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_listening(&self) -> bool {
        self.accept_task.is_some()
    }

    async fn bind(&self) -> io::Result<UnixListener> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // A crashed instance leaves its socket file behind
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(socket = %self.path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&self.path)?;
        if let Err(e) = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)) {
            warn!(socket = %self.path.display(), error = %e, "Failed to restrict socket permissions");
        }
        Ok(listener)
    }
}

#[async_trait]
impl TransportServer for SocketServer {
    async fn start(&mut self) -> Result<Incoming> {
        if self.accept_task.is_some() {
            return Err(RelayError::AlreadyStarted);
        }

        let listener = self.bind().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let accepted = Arc::clone(&self.accepted);
        let path = self.path.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let endpoint = SocketTransport::from_stream(stream);
                        {
                            let mut accepted = accepted.lock();
                            accepted.retain(|t| t.is_connected());
                            accepted.push(Arc::clone(&endpoint.transport));
                        }
                        debug!(socket = %path.display(), "Accepted socket peer");
                        if let Err(rejected) = tx.send(endpoint) {
                            rejected.0.transport.close();
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(socket = %path.display(), error = %e, "Accept error");
                    }
                }
            }
        }));

        info!(socket = %self.path.display(), "Socket server listening");
        Ok(rx)
    }

    async fn stop(&mut self) {
        let Some(task) = self.accept_task.take() else {
            return;
        };
        task.abort();
        let _ = task.await;

        let accepted: Vec<_> = self.accepted.lock().drain(..).collect();
        for transport in accepted {
            transport.close();
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(socket = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }

        info!(socket = %self.path.display(), "Socket server stopped");
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    async fn next_data(endpoint: &mut Endpoint) -> Vec<u8> {
        match endpoint.events.recv().await {
            Some(TransportEvent::Data(data)) => data,
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let mut server = SocketServer::new(&path);
        let mut incoming = assert_ok!(server.start().await);

        let mut client = assert_ok!(SocketTransport::connect(&path).await);
        let mut accepted = incoming.recv().await.unwrap();

        client.transport.write(b"ping\n");
        assert_eq!(next_data(&mut accepted).await, b"ping\n");

        accepted.transport.write(b"pong\n");
        assert_eq!(next_data(&mut client).await, b"pong\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_close_reaches_server_side() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let mut server = SocketServer::new(&path);
        let mut incoming = assert_ok!(server.start().await);

        let mut client = assert_ok!(SocketTransport::connect(&path).await);
        let mut accepted = incoming.recv().await.unwrap();

        client.transport.close();
        assert!(!client.transport.is_connected());
        assert_eq!(client.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(accepted.events.recv().await, Some(TransportEvent::Closed));

        // Writes after close vanish without error
        client.transport.write(b"late");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_removes_stale_socket_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        std::fs::write(&path, b"left over").unwrap();

        let mut server = SocketServer::new(&path);
        let _incoming = assert_ok!(server.start().await);
        assert!(server.is_listening());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("swarm").join("relay.sock");

        let mut server = SocketServer::new(&path);
        let _incoming = assert_ok!(server.start().await);
        assert!(path.exists());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_rejects_start() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut server = SocketServer::new(blocker.join("relay.sock"));
        assert!(server.start().await.is_err());
        assert!(!server.is_listening());

        // Nothing to stop
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_peers_and_unlinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let mut server = SocketServer::new(&path);
        let mut incoming = assert_ok!(server.start().await);

        let mut client = assert_ok!(SocketTransport::connect(&path).await);
        let _accepted = incoming.recv().await.unwrap();

        server.stop().await;

        assert_eq!(client.events.recv().await, Some(TransportEvent::Closed));
        assert!(!path.exists());
        assert!(!server.is_listening());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempdir().unwrap();
        let mut server = SocketServer::new(dir.path().join("relay.sock"));
        let _incoming = assert_ok!(server.start().await);

        assert!(matches!(server.start().await, Err(RelayError::AlreadyStarted)));

        server.stop().await;
    }
}
