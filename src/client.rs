//! Worker-side connection to a relay

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::RelayConfig;
use crate::delivery::{DeliveryClassifier, TaskRunner};
use crate::error::{RelayError, Result};
use crate::protocol::{
    ClientMessage, FrameDecoder, Registration, RelayedMessage, Reply, ServerMessage, Signal,
};
use crate::transport::{send_frame, Endpoint, Transport, TransportEvent};

/// Something the client read from its relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A frame from the relay
    Message(ServerMessage),
    /// The transport reported an OS-level failure
    TransportError(String),
}

/// A registered connection to a relay
#[derive(Debug)]
pub struct RelayClient {
    identity: Registration,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    decoder: FrameDecoder,
    pending: VecDeque<Value>,
}

impl RelayClient {
    /// Send `register` over `endpoint` and wait for the relay's answer
    #[instrument(skip_all, fields(name = %identity.name, role = %identity.role))]
    pub async fn register(endpoint: Endpoint, identity: Registration) -> Result<Self> {
        identity
            .check()
            .map_err(|e| RelayError::Protocol(e.to_string()))?;

        let Endpoint { transport, events } = endpoint;
        let mut client = Self {
            identity,
            transport,
            events,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        };

        send_frame(
            client.transport.as_ref(),
            &ClientMessage::Register(client.identity.clone()),
        );

        loop {
            match client.next_inbound().await {
                Some(Inbound::Message(ServerMessage::Reply(Reply::Registered))) => break,
                Some(Inbound::Message(ServerMessage::Reply(Reply::Error { message }))) => {
                    client.transport.close();
                    return Err(RelayError::Rejected(message));
                }
                Some(Inbound::Message(ServerMessage::Relayed(message))) => {
                    debug!(from = %message.from, "Ignoring relayed message before registration");
                }
                Some(Inbound::TransportError(e)) => {
                    warn!(error = %e, "Transport error during registration");
                }
                None => return Err(RelayError::ConnectionClosed),
            }
        }

        info!("Registered with relay");
        Ok(client)
    }

    /// Connect to the relay socket at `path` and register
    #[cfg(unix)]
    pub async fn connect(
        path: impl AsRef<std::path::Path>,
        identity: Registration,
    ) -> Result<Self> {
        let endpoint = crate::socket::SocketTransport::connect(path).await?;
        Self::register(endpoint, identity).await
    }

    /// Join the group relay named in `config`
    #[cfg(unix)]
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        Self::connect(&config.socket_path, config.registration()).await
    }

    pub fn identity(&self) -> &Registration {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Write half of the connection, e.g. to serve as a relay's parent link
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send a signal; dropped silently if the relay is gone
    pub fn send(&self, signal: &Signal) {
        send_frame(self.transport.as_ref(), signal);
    }

    pub fn nudge(&self, reason: impl Into<String>) {
        self.send(&Signal::nudge(reason));
    }

    pub fn blocker(&self, description: impl Into<String>) {
        self.send(&Signal::blocker(description));
    }

    pub fn done(&self, summary: impl Into<String>) {
        self.send(&Signal::done(summary));
    }

    pub fn instruct_to(&self, to: impl Into<String>, instruction: impl Into<String>) {
        self.send(&Signal::instruct_to(instruction, to));
    }

    pub fn instruct_swarm(&self, swarm: impl Into<String>, instruction: impl Into<String>) {
        self.send(&Signal::instruct_swarm(instruction, swarm));
    }

    pub fn instruct_all(&self, instruction: impl Into<String>) {
        self.send(&Signal::instruct(instruction));
    }

    pub fn close(&self) {
        self.transport.close();
    }

    /// Next frame or transport error, `None` once the connection is closed
    ///
    /// Frames that are not valid server messages are skipped.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        loop {
            while let Some(value) = self.pending.pop_front() {
                match serde_json::from_value::<ServerMessage>(value) {
                    Ok(message) => return Some(Inbound::Message(message)),
                    Err(e) => debug!(error = %e, "Skipping unrecognized server frame"),
                }
            }

            match self.events.recv().await? {
                TransportEvent::Data(bytes) => {
                    let frames = self.decoder.push(&bytes);
                    self.pending.extend(frames.into_iter().map(|frame| frame.value));
                }
                TransportEvent::Error(e) => return Some(Inbound::TransportError(e)),
                TransportEvent::Closed => return None,
            }
        }
    }

    /// Next relayed message, skipping replies and errors
    pub async fn next_relayed(&mut self) -> Option<RelayedMessage> {
        loop {
            match self.next_inbound().await? {
                Inbound::Message(ServerMessage::Relayed(message)) => return Some(message),
                other => debug!(inbound = ?other, "Skipping non-relayed inbound"),
            }
        }
    }

    /// Feed everything received into `classifier` until the relay goes away
    pub async fn run<R: TaskRunner>(mut self, classifier: &DeliveryClassifier<R>) {
        while let Some(inbound) = self.next_inbound().await {
            match inbound {
                Inbound::Message(ServerMessage::Relayed(message)) => {
                    classifier.deliver(&message);
                }
                Inbound::Message(ServerMessage::Reply(Reply::Error { message })) => {
                    warn!(error = %message, "Relay rejected a frame");
                    classifier.deliver_error(&message);
                }
                Inbound::Message(ServerMessage::Reply(Reply::Registered)) => {}
                Inbound::TransportError(e) => {
                    warn!(error = %e, "Relay transport error");
                    classifier.deliver_error(&e);
                }
            }
        }
        info!(name = %self.identity.name, "Relay connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{ChannelRunner, Delivery};
    use crate::memory::MemoryTransport;
    use crate::protocol::{encode_frame, Role};

    /// Plays the relay side by hand
    async fn next_frame(relay: &mut Endpoint) -> Value {
        let mut decoder = FrameDecoder::new();
        loop {
            match relay.events.recv().await {
                Some(TransportEvent::Data(bytes)) => {
                    if let Some(frame) = decoder.push(&bytes).into_iter().next() {
                        return frame.value;
                    }
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    fn reply(relay: &Endpoint, message: &impl serde::Serialize) {
        relay
            .transport
            .write(encode_frame(message).unwrap().as_bytes());
    }

    #[tokio::test]
    async fn test_register_success() {
        let (near, mut relay) = MemoryTransport::pair();

        let handle = tokio::spawn(RelayClient::register(near, Registration::agent("w1", "alpha")));

        let frame = next_frame(&mut relay).await;
        assert_eq!(frame["type"], "register");
        assert_eq!(frame["name"], "w1");
        assert_eq!(frame["swarm"], "alpha");
        reply(&relay, &Reply::Registered);

        let client = handle.await.unwrap().unwrap();
        assert_eq!(client.name(), "w1");
        assert_eq!(client.identity().role, Role::Agent);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let (near, mut relay) = MemoryTransport::pair();

        let handle = tokio::spawn(RelayClient::register(near, Registration::queen("queen")));
        next_frame(&mut relay).await;
        reply(&relay, &Reply::error("name 'queen' is already registered"));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Rejected(msg) if msg.contains("already registered")));
    }

    #[tokio::test]
    async fn test_register_closed() {
        let (near, mut relay) = MemoryTransport::pair();

        let handle = tokio::spawn(RelayClient::register(near, Registration::queen("queen")));
        next_frame(&mut relay).await;
        relay.transport.close();

        assert!(matches!(
            handle.await.unwrap(),
            Err(RelayError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_identity_is_not_sent() {
        let (near, _relay) = MemoryTransport::pair();
        let result = RelayClient::register(near, Registration::new("w1", Role::Agent, None)).await;
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_run_feeds_classifier() {
        let (near, mut relay) = MemoryTransport::pair();
        let handle = tokio::spawn(RelayClient::register(near, Registration::agent("w1", "alpha")));
        next_frame(&mut relay).await;

        // Ack and a relayed blocker arrive in one chunk
        let sender = Registration::coordinator("lead", "alpha");
        let mut chunk = encode_frame(&Reply::Registered).unwrap();
        chunk.push_str(
            &encode_frame(&RelayedMessage::new(&sender, Signal::blocker("halt"))).unwrap(),
        );
        relay.transport.write(chunk.as_bytes());

        let client = handle.await.unwrap().unwrap();

        reply(&relay, &RelayedMessage::new(&sender, Signal::nudge("later")));
        reply(&relay, &RelayedMessage::new(&sender, Signal::done("finished")));
        reply(&relay, &Reply::error("no connection named 'ghost'"));
        relay.transport.write(b"garbage\n");
        relay.transport.close();

        let (runner, mut rx) = ChannelRunner::new();
        let classifier = DeliveryClassifier::new(runner);
        client.run(&classifier).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.delivery, Delivery::Interrupt);
        assert!(first.text.contains("halt"));

        let second = rx.try_recv().unwrap();
        assert_eq!(second.delivery, Delivery::Defer);
        assert!(second.text.contains("later"));

        let third = rx.try_recv().unwrap();
        assert_eq!(third.delivery, Delivery::Defer);
        assert!(third.text.contains("ghost"));

        assert!(rx.try_recv().is_err());
        assert!(classifier.completions().is_done("lead"));
    }

    #[tokio::test]
    async fn test_send_helpers_write_frames() {
        let (near, mut relay) = MemoryTransport::pair();
        let handle = tokio::spawn(RelayClient::register(near, Registration::agent("w1", "alpha")));
        next_frame(&mut relay).await;
        reply(&relay, &Reply::Registered);
        let client = handle.await.unwrap().unwrap();

        client.instruct_to("w2", "rebase");
        let frame = next_frame(&mut relay).await;
        assert_eq!(
            ClientMessage::from_value(&frame).unwrap(),
            ClientMessage::Signal(Signal::instruct_to("rebase", "w2"))
        );

        client.close();
        client.nudge("dropped");
        assert!(!client.is_connected());
    }
}
