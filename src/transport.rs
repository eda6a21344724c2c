//! Transport abstraction shared by the socket and in-memory backends
//!
//! A transport is split in two halves. The write half is an
//! `Arc<dyn Transport>` that can be cloned into whoever needs to send. The
//! read half is a channel of [`TransportEvent`]s delivered in stream order
//! and ending with exactly one [`TransportEvent::Closed`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::protocol::encode_frame;

/// Something that happened on the read side of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived; frame boundaries are not preserved
    Data(Vec<u8>),
    /// OS-level failure; a `Closed` event follows
    Error(String),
    /// The stream is gone, from either side
    Closed,
}

/// Write half of a bidirectional byte stream
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue bytes for the peer
    ///
    /// Never blocks. Dropped silently when the transport is not connected.
    fn write(&self, data: &[u8]);

    /// Close both directions; idempotent
    fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Both halves of one transport
pub struct Endpoint {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Endpoint {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { transport, events }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Stream of peers accepted by a [`TransportServer`]
pub type Incoming = mpsc::UnboundedReceiver<Endpoint>;

/// Listening side of a transport backend
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// Begin accepting peers
    ///
    /// Resolves once the server is actually listening. Each accepted peer is
    /// delivered once on the returned channel.
    async fn start(&mut self) -> Result<Incoming>;

    /// Close every accepted peer and stop listening
    ///
    /// Stopping a server that is not running is a no-op.
    async fn stop(&mut self);
}

/// Encode `message` as a frame and write it
///
/// Encoding cannot fail for the protocol types; if it ever does the frame
/// is dropped with a warning, like any other undeliverable write.
pub fn send_frame<T: Serialize>(transport: &dyn Transport, message: &T) {
    match encode_frame(message) {
        Ok(line) => transport.write(line.as_bytes()),
        Err(e) => warn!(error = %e, "Failed to encode frame"),
    }
}
