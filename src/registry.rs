//! Connection registry owned by a single relay

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{Registration, Role};
use crate::transport::Transport;

/// Identifier for one accepted transport, registered or not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A registered peer and the transport it owns
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub identity: Registration,
    transport: Arc<dyn Transport>,
}

impl Connection {
    pub fn new(id: ConnId, identity: Registration, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            identity,
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn role(&self) -> Role {
        self.identity.role
    }

    pub fn swarm(&self) -> Option<&str> {
        self.identity.swarm.as_deref()
    }

    pub fn send(&self, data: &[u8]) {
        self.transport.write(data);
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            name: self.identity.name.clone(),
            role: self.identity.role,
            swarm: self.identity.swarm.clone(),
        }
    }
}

/// Snapshot of a registered connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swarm: Option<String>,
}

/// Name-keyed set of registered connections
///
/// Names are unique; a second connection claiming a taken name is refused.
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<String, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection, handing it back if its name is taken
    pub fn insert(&mut self, connection: Connection) -> Result<(), Connection> {
        if self.connections.contains_key(connection.name()) {
            return Err(connection);
        }
        self.connections
            .insert(connection.name().to_string(), connection);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Remove `name`, but only if it is still held by connection `id`
    pub fn remove(&mut self, name: &str, id: ConnId) -> Option<Connection> {
        match self.connections.get(name) {
            Some(conn) if conn.id == id => self.connections.remove(name),
            _ => None,
        }
    }

    /// Everyone except `sender`
    pub fn others<'a>(&'a self, sender: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .values()
            .filter(move |conn| conn.name() != sender)
    }

    /// Everyone in `swarm` except `sender`
    pub fn swarm_members<'a>(
        &'a self,
        swarm: &'a str,
        sender: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.others(sender)
            .filter(move |conn| conn.swarm() == Some(swarm))
    }

    /// Sorted by name
    pub fn infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.connections.values().map(Connection::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Take every connection out of the registry
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
