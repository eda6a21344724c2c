//! # Cabal Relay
//!
//! Peer-to-peer signalling between workers of one orchestration run.
//!
//! Every swarm gets a relay. Workers register with it by name, then send
//! nudges, blockers, completion notices and directives to each other. A
//! coordinator hosts the relay for its sub-swarm while registered with the
//! relay one level up, so the relays form the same tree as the workers.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────────┐
//!                    │        ROOT RELAY          │
//!                    │  queen · alpha-lead · beta │
//!                    └─────┬───────────────┬─────┘
//!              parent link │               │ parent link
//!          ┌───────────────┴───┐       ┌───┴───────────────┐
//!          │   RELAY (alpha)   │       │    RELAY (beta)   │
//!          │  hosted by lead   │       │  hosted by lead   │
//!          └──┬──────┬──────┬──┘       └──┬──────┬──────┬──┘
//!             ▼      ▼      ▼             ▼      ▼      ▼
//!           ┌───┐  ┌───┐  ┌───┐         ┌───┐  ┌───┐  ┌───┐
//!           │a1 │  │a2 │  │a3 │         │b1 │  │b2 │  │b3 │
//!           └───┘  └───┘  └───┘         └───┘  └───┘  └───┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Relay**: Routes newline-delimited JSON frames between the
//!   connections registered with it
//! - **Parent link**: A coordinator's own connection upward; directives for
//!   names the local relay does not know climb over it
//! - **Delivery**: How a received message reaches a busy worker
//!   (interrupt, defer, or record only)
//! - **Hierarchy code**: Dotted position of a worker in the spawn tree

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod hierarchy;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod relay;
#[cfg(unix)]
pub mod socket;
pub mod transport;

pub use client::{Inbound, RelayClient};
pub use config::RelayConfig;
pub use delivery::{
    classify, ChannelRunner, CompletionTracker, Delivery, DeliveryClassifier, TaskRunner,
};
pub use error::{RelayError, Result};
pub use hierarchy::{build_tree, HierarchyEntry, HierarchyTree};
pub use memory::{MemoryServer, MemoryTransport};
pub use protocol::{
    ClientMessage, Registration, RelayedMessage, Reply, Role, ServerMessage, Signal,
};
pub use registry::ConnectionInfo;
pub use relay::RelayServer;
#[cfg(unix)]
pub use socket::{SocketServer, SocketTransport};
pub use transport::{Endpoint, Transport, TransportEvent, TransportServer};
