//! # xorlay - Close-Group XOR Overlay Routing
//!
//! xorlay is the routing core of a content-addressable distributed system.
//! Nodes self-organise into a Kademlia-like 512-bit XOR identifier space;
//! each node keeps a small routing table biased toward its own address,
//! giving O(log N) greedy lookups while the `GROUP_SIZE` numerically
//! nearest peers stay densely interconnected for group-authority
//! operations.
//!
//! ## Architecture
//!
//! The codebase uses the **actor pattern** for safe concurrent state:
//! a [`RoutingNode`] handle is cheap to clone and talks to a private actor
//! over async channels; the actor owns the routing table, duplicate
//! filter, content cache and handshake state, and processes one message at
//! a time.
//!
//! External collaborators sit behind traits: the reliable UDP connection
//! manager ([`Transport`]), bootstrap persistence ([`BootstrapStore`]),
//! the quorum aggregator ([`Sentinel`]) and the application's data
//! personas ([`Persona`]).
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | 512-bit addresses, XOR metric, keypairs, peer records |
//! | `table` | routing-table membership, close groups, swarm/greedy targets |
//! | `cache` | time-bounded LRU behind the duplicate filter and content cache |
//! | `messages` | message header, typed bodies, staged wire codec |
//! | `node` | forwarding engine, handshake state machine, authority roles |
//! | `transport` | consumed connection-manager interface |
//! | `store` | bootstrap contact persistence |
//! | `sentinel` | consumed quorum-aggregation interface |
//! | `error` | the crate's error kinds |
//!
//! ## Forwarding model
//!
//! Messages addressed inside a close group's radius are replicated to
//! every member (**swarm mode**) so the target hears from `GROUP_SIZE`
//! sources; messages beyond it take a single greedy XOR hop. A
//! time-bounded duplicate filter keyed on `(origin, message id)`
//! guarantees at-most-once local dispatch, and `GetDataResponse` payloads
//! transiting a node are cached opportunistically.

pub mod cache;
pub mod error;
pub mod identity;
pub mod messages;
pub mod node;
pub mod sentinel;
pub mod store;
pub mod table;
pub mod transport;

pub use error::{Result, RoutingError};
pub use identity::{
    Address, Contact, EndpointPair, Keypair, NodeInfo, PublicId, ADDRESS_BITS, ADDRESS_LENGTH,
};
pub use messages::{Authority, DataTag, FilterKey, MessageId};
pub use node::{NodeState, NodeStatus, Persona, RoutingConfig, RoutingNode};
pub use sentinel::{NullSentinel, Sentinel};
pub use store::{BootstrapStore, FileStore, MemoryStore};
pub use table::{
    CloseGroupDifference, RoutingTable, BUCKET_SIZE, GROUP_SIZE, QUORUM_SIZE,
    ROUTING_TABLE_SIZE,
};
pub use transport::{Transport, TransportEvent};
