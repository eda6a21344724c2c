//! Relay server - routes signals between the connections of one swarm
//!
//! All registry state lives inside one task. Transport events from every
//! connection are funnelled into a single channel and handled one at a
//! time, so accepting, relaying and removing are each atomic with respect
//! to one another and no lock guards the registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{RelayError, Result};
use crate::protocol::{
    message_type, ClientMessage, Frame, FrameDecoder, Registration, RelayedMessage, Reply, Signal,
};
use crate::registry::{ConnId, Connection, ConnectionInfo, Registry};
use crate::transport::{send_frame, Endpoint, Incoming, Transport, TransportEvent, TransportServer};

/// Relay for one swarm, listening on a [`TransportServer`]
///
/// A relay spawned by a coordinator may hold a parent link: the
/// coordinator's own connection to the relay one level up. Directives for
/// names this relay does not know are forwarded over it unchanged.
pub struct RelayServer<S> {
    listener: S,
    parent: Option<Arc<dyn Transport>>,
    running: Option<Running>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

enum Command {
    Snapshot(oneshot::Sender<Vec<ConnectionInfo>>),
}

impl<S: TransportServer + 'static> RelayServer<S> {
    pub fn new(listener: S) -> Self {
        Self {
            listener,
            parent: None,
            running: None,
        }
    }

    /// Forward unresolved directives over `parent`
    pub fn with_parent_link(mut self, parent: Arc<dyn Transport>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn has_parent_link(&self) -> bool {
        self.parent.is_some()
    }

    pub fn listener(&self) -> &S {
        &self.listener
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start listening and relaying
    ///
    /// Fails without side effects if the listener cannot start.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(RelayError::AlreadyStarted);
        }

        let incoming = self.listener.start().await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let relay = Relay::new(self.parent.clone());
        let task = tokio::spawn(relay.run(incoming, commands_rx, shutdown_rx));

        self.running = Some(Running {
            shutdown: shutdown_tx,
            commands: commands_tx,
            task,
        });

        info!(parent_link = self.parent.is_some(), "Relay server started");
        Ok(())
    }

    /// Close every connection, then the listener
    ///
    /// Stopping a relay that is not running does nothing.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            error!(error = %e, "Relay task failed");
        }
        self.listener.stop().await;

        info!("Relay server stopped");
    }

    /// Registered connections, sorted by name
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let Some(running) = &self.running else {
            return Vec::new();
        };
        let (tx, rx) = oneshot::channel();
        if running.commands.send(Command::Snapshot(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[cfg(unix)]
impl RelayServer<crate::socket::SocketServer> {
    /// Relay a coordinator hosts for its sub-swarm, as described by `config`
    pub fn from_config(config: &crate::config::RelayConfig) -> Result<Self> {
        let path = config.hosted_socket_path.as_ref().ok_or_else(|| {
            RelayError::Config(format!("'{}' does not host a relay", config.name))
        })?;
        Ok(Self::new(crate::socket::SocketServer::new(path)))
    }
}

impl<S> Drop for RelayServer<S> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}

/// Where a connection is in its lifecycle; closed connections are dropped
enum PeerState {
    Unregistered,
    Registered(String),
}

struct Peer {
    transport: Arc<dyn Transport>,
    decoder: FrameDecoder,
    state: PeerState,
}

/// The task that owns the registry
struct Relay {
    registry: Registry,
    peers: HashMap<ConnId, Peer>,
    parent: Option<Arc<dyn Transport>>,
    events_tx: mpsc::UnboundedSender<(ConnId, TransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(ConnId, TransportEvent)>,
}

impl Relay {
    fn new(parent: Option<Arc<dyn Transport>>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            registry: Registry::new(),
            peers: HashMap::new(),
            parent,
            events_tx,
            events_rx,
        }
    }

    async fn run(
        mut self,
        mut incoming: Incoming,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(endpoint) = incoming.recv() => self.accept(endpoint),
                Some((id, event)) = self.events_rx.recv() => self.handle_event(id, event),
                Some(command) = commands.recv() => self.handle_command(command),
            }
        }
        self.close_all();
    }

    fn accept(&mut self, endpoint: Endpoint) {
        let id = ConnId::new();
        let Endpoint {
            transport,
            mut events,
        } = endpoint;

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = event == TransportEvent::Closed;
                if events_tx.send((id, event)).is_err() || closed {
                    break;
                }
            }
        });

        self.peers.insert(
            id,
            Peer {
                transport,
                decoder: FrameDecoder::new(),
                state: PeerState::Unregistered,
            },
        );
        debug!(conn_id = %id, "Accepted connection");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.registry.infos());
            }
        }
    }

    fn handle_event(&mut self, id: ConnId, event: TransportEvent) {
        match event {
            TransportEvent::Data(bytes) => self.handle_data(id, &bytes),
            TransportEvent::Error(e) => {
                warn!(conn_id = %id, error = %e, "Transport error");
                self.disconnect(id);
            }
            TransportEvent::Closed => self.disconnect(id),
        }
    }

    fn handle_data(&mut self, id: ConnId, bytes: &[u8]) {
        let frames = match self.peers.get_mut(&id) {
            Some(peer) => peer.decoder.push(bytes),
            None => return,
        };

        for frame in frames {
            let name = match self.peers.get(&id) {
                Some(Peer {
                    state: PeerState::Registered(name),
                    ..
                }) => Some(name.clone()),
                Some(_) => None,
                // Closed by an earlier frame in this chunk
                None => break,
            };
            match name {
                Some(name) => self.handle_registered(id, &name, frame),
                None => self.handle_unregistered(id, frame),
            }
        }
    }

    fn handle_unregistered(&mut self, id: ConnId, frame: Frame) {
        let kind = message_type(&frame.value).unwrap_or("unknown");
        if kind != "register" {
            warn!(conn_id = %id, kind, "Frame before registration");
            self.reply(id, &Reply::error(format!("must register before sending '{kind}'")));
            return;
        }

        match ClientMessage::from_value(&frame.value) {
            Ok(ClientMessage::Register(registration)) => self.register(id, registration),
            Ok(ClientMessage::Signal(_)) => {}
            Err(e) => {
                warn!(conn_id = %id, error = %e, "Invalid registration");
                self.reply(id, &Reply::error(e.message()));
                self.disconnect(id);
            }
        }
    }

    fn register(&mut self, id: ConnId, registration: Registration) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        let name = registration.name.clone();
        let connection = Connection::new(id, registration, Arc::clone(&peer.transport));
        match self.registry.insert(connection) {
            Ok(()) => {
                peer.state = PeerState::Registered(name.clone());
                send_frame(peer.transport.as_ref(), &Reply::Registered);
                if let Some(conn) = self.registry.get(&name) {
                    info!(
                        conn_id = %id,
                        name = %name,
                        role = %conn.role(),
                        swarm = conn.swarm().unwrap_or_default(),
                        "Connection registered"
                    );
                }
            }
            Err(_) => {
                warn!(conn_id = %id, name = %name, "Duplicate registration");
                self.reply(id, &Reply::error(format!("name '{name}' is already registered")));
                self.disconnect(id);
            }
        }
    }

    fn handle_registered(&mut self, id: ConnId, name: &str, frame: Frame) {
        let signal = match ClientMessage::from_value(&frame.value) {
            Ok(ClientMessage::Signal(signal)) => signal,
            Ok(ClientMessage::Register(_)) => {
                warn!(conn_id = %id, name, "Repeated registration");
                self.reply(id, &Reply::error(format!("already registered as '{name}'")));
                return;
            }
            Err(e) => {
                warn!(conn_id = %id, name, error = %e, "Rejected frame");
                self.reply(id, &Reply::error(e.message()));
                return;
            }
        };

        let Some(sender) = self.registry.get(name) else {
            return;
        };
        let sender = sender.identity.clone();

        match Route::of(&signal) {
            Route::Direct(target) => {
                self.route_direct(id, &sender, &target, &frame.line, signal);
            }
            Route::Swarm(swarm) => {
                let relayed = RelayedMessage::new(&sender, signal);
                let count = deliver(self.registry.swarm_members(&swarm, name), &relayed);
                debug!(from = name, swarm = %swarm, recipients = count, "Relayed instruct to swarm");
            }
            Route::Broadcast => {
                let kind = signal.kind();
                let relayed = RelayedMessage::new(&sender, signal);
                let count = deliver(self.registry.others(name), &relayed);
                debug!(from = name, kind, recipients = count, "Broadcast");
            }
        }
    }

    /// Resolve `target` locally, else climb to the parent relay
    fn route_direct(
        &self,
        id: ConnId,
        sender: &Registration,
        target: &str,
        line: &str,
        signal: Signal,
    ) {
        if let Some(conn) = self.registry.get(target) {
            let relayed = RelayedMessage::new(sender, signal);
            deliver(std::iter::once(conn), &relayed);
            debug!(from = %sender.name, to = target, "Relayed instruct");
            return;
        }

        match &self.parent {
            Some(parent) if parent.is_connected() => {
                let mut forwarded = String::with_capacity(line.len() + 1);
                forwarded.push_str(line);
                forwarded.push('\n');
                parent.write(forwarded.as_bytes());
                debug!(from = %sender.name, to = target, "Forwarded instruct to parent relay");
            }
            Some(_) => {
                warn!(from = %sender.name, to = target, "Parent relay unreachable");
                self.reply(
                    id,
                    &Reply::error(format!(
                        "no connection named '{target}' and the parent relay is unreachable"
                    )),
                );
            }
            None => {
                warn!(from = %sender.name, to = target, "Unresolved instruct target");
                self.reply(id, &Reply::error(format!("no connection named '{target}'")));
            }
        }
    }

    fn reply(&self, id: ConnId, reply: &Reply) {
        if let Some(peer) = self.peers.get(&id) {
            send_frame(peer.transport.as_ref(), reply);
        }
    }

    /// Close a connection and forget it
    fn disconnect(&mut self, id: ConnId) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        peer.transport.close();
        if let PeerState::Registered(name) = peer.state {
            self.registry.remove(&name, id);
            info!(conn_id = %id, name = %name, "Connection closed");
        } else {
            debug!(conn_id = %id, "Unregistered connection closed");
        }
    }

    fn close_all(&mut self) {
        let count = self.peers.len();
        for (_, peer) in self.peers.drain() {
            peer.transport.close();
        }
        self.registry.drain();
        info!(connections = count, "Closed all connections");
    }
}

/// Recipients of a signal; `to` wins over `swarm`
enum Route {
    Direct(String),
    Swarm(String),
    Broadcast,
}

impl Route {
    fn of(signal: &Signal) -> Self {
        match signal {
            Signal::Instruct { to: Some(to), .. } => Route::Direct(to.clone()),
            Signal::Instruct {
                swarm: Some(swarm), ..
            } => Route::Swarm(swarm.clone()),
            _ => Route::Broadcast,
        }
    }
}

/// Encode once and write to every recipient
fn deliver<'a>(recipients: impl Iterator<Item = &'a Connection>, message: &RelayedMessage) -> usize {
    let line = match crate::protocol::encode_frame(message) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to encode relayed message");
            return 0;
        }
    };
    let mut count = 0;
    for conn in recipients {
        conn.send(line.as_bytes());
        count += 1;
    }
    count
}
