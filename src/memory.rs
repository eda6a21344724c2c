//! In-memory transport backend
//!
//! Two endpoints wired straight into each other's event channels, with no
//! I/O involved. Used to run the relay deterministically in tests and to
//! host several relays inside one process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::transport::{Endpoint, Incoming, Transport, TransportEvent, TransportServer};

/// One side of an in-memory pair
#[derive(Debug)]
pub struct MemoryTransport {
    /// Shared by both sides, so closing either one disconnects the pair
    connected: Arc<AtomicBool>,
    own: mpsc::UnboundedSender<TransportEvent>,
    peer: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    /// Create two connected endpoints
    pub fn pair() -> (Endpoint, Endpoint) {
        let connected = Arc::new(AtomicBool::new(true));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = MemoryTransport {
            connected: Arc::clone(&connected),
            own: a_tx.clone(),
            peer: b_tx.clone(),
        };
        let b = MemoryTransport {
            connected,
            own: b_tx,
            peer: a_tx,
        };

        (
            Endpoint::new(Arc::new(a), a_rx),
            Endpoint::new(Arc::new(b), b_rx),
        )
    }
}

impl Transport for MemoryTransport {
    fn write(&self, data: &[u8]) {
        if self.is_connected() {
            let _ = self.peer.send(TransportEvent::Data(data.to_vec()));
        }
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.own.send(TransportEvent::Closed);
            let _ = self.peer.send(TransportEvent::Closed);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct ServerInner {
    accept_tx: Mutex<Option<mpsc::UnboundedSender<Endpoint>>>,
    accepted: Mutex<Vec<Arc<dyn Transport>>>,
}

/// In-memory listener
///
/// Cheap to clone; every clone refers to the same listener, so a test can
/// hand one clone to a relay and keep another to call [`connect`].
///
/// [`connect`]: MemoryServer::connect
#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new pair, hand one end to the listener and return the other
    pub fn connect(&self) -> Result<Endpoint> {
        let guard = self.inner.accept_tx.lock();
        let accept_tx = guard.as_ref().ok_or(RelayError::NotListening)?;

        let (server_end, client_end) = MemoryTransport::pair();
        {
            let mut accepted = self.inner.accepted.lock();
            accepted.retain(|t| t.is_connected());
            accepted.push(Arc::clone(&server_end.transport));
        }

        accept_tx
            .send(server_end)
            .map_err(|_| RelayError::NotListening)?;

        debug!("In-memory peer connected");
        Ok(client_end)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.accept_tx.lock().is_some()
    }
}

#[async_trait]
impl TransportServer for MemoryServer {
    async fn start(&mut self) -> Result<Incoming> {
        let mut guard = self.inner.accept_tx.lock();
        if guard.is_some() {
            return Err(RelayError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        Ok(rx)
    }

    async fn stop(&mut self) {
        if self.inner.accept_tx.lock().take().is_none() {
            return;
        }
        let accepted: Vec<_> = self.inner.accepted.lock().drain(..).collect();
        for transport in accepted {
            transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_pair_delivers_writes() {
        let (a, mut b) = MemoryTransport::pair();

        a.transport.write(b"hello");
        a.transport.write(b" world");

        assert_eq!(b.events.recv().await, Some(TransportEvent::Data(b"hello".to_vec())));
        assert_eq!(b.events.recv().await, Some(TransportEvent::Data(b" world".to_vec())));
    }

    #[tokio::test]
    async fn test_close_propagates_to_peer() {
        let (mut a, mut b) = MemoryTransport::pair();

        b.transport.close();

        assert!(!a.transport.is_connected());
        assert!(!b.transport.is_connected());
        assert_eq!(a.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(b.events.recv().await, Some(TransportEvent::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, mut b) = MemoryTransport::pair();

        a.transport.close();
        a.transport.close();

        assert_eq!(b.events.recv().await, Some(TransportEvent::Closed));
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_after_close_is_dropped() {
        let (a, mut b) = MemoryTransport::pair();

        a.transport.close();
        a.transport.write(b"lost");

        assert_eq!(b.events.recv().await, Some(TransportEvent::Closed));
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (a, mut b) = MemoryTransport::pair();

        drop(a);

        assert_eq!(b.events.recv().await, Some(TransportEvent::Closed));
        assert!(!b.transport.is_connected());
    }

    #[tokio::test]
    async fn test_server_connect_requires_start() {
        let server = MemoryServer::new();
        assert!(!server.is_listening());
        assert!(matches!(server.connect(), Err(RelayError::NotListening)));
    }

    #[tokio::test]
    async fn test_server_accepts_peer() {
        let mut server = MemoryServer::new();
        let mut incoming = assert_ok!(server.start().await);

        let client = assert_ok!(server.connect());
        let mut accepted = incoming.recv().await.unwrap();

        client.transport.write(b"ping");
        assert_eq!(accepted.events.recv().await, Some(TransportEvent::Data(b"ping".to_vec())));
    }

    #[tokio::test]
    async fn test_server_start_twice_fails() {
        let mut server = MemoryServer::new();
        let _incoming = assert_ok!(server.start().await);
        assert_err!(server.start().await);
    }

    #[tokio::test]
    async fn test_server_stop_closes_peers() {
        let mut server = MemoryServer::new();
        let _incoming = assert_ok!(server.start().await);
        let mut client = assert_ok!(server.connect());

        server.stop().await;

        assert_eq!(client.events.recv().await, Some(TransportEvent::Closed));
        assert!(!server.is_listening());

        // Second stop is a no-op
        server.stop().await;
    }
}
