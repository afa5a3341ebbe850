//! Consumed transport interface.
//!
//! The routing core does not own sockets. A reliable UDP connection
//! manager implements [`Transport`] and feeds inbound traffic to the node
//! as [`TransportEvent`]s over an mpsc channel handed in at construction.
//! Per-peer send order is preserved by the transport; no ordering is
//! promised across peers.
//!
//! Collaborator methods return `anyhow::Result`: the routing core maps
//! failures onto its own error kinds at the call site and never retries a
//! send; swarm-mode redundancy stands in for retransmission.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Address, EndpointPair, NodeInfo};

/// Reliable UDP connection manager as seen by the routing core.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dial an endpoint. Resolves with the remote peer's observed identity
    /// and our own externally-observed endpoint.
    async fn connect(&self, endpoint: SocketAddr) -> Result<(Address, SocketAddr)>;

    /// Send one datagram to a connected peer.
    async fn send(&self, peer: Address, bytes: Vec<u8>) -> Result<()>;

    /// Drop the connection to a peer, if any.
    async fn disconnect(&self, peer: Address);

    /// Dial a handshake peer on its advertised endpoints and keep the
    /// connection. Resolves once the connection is live.
    async fn add_node(&self, info: NodeInfo, endpoints: EndpointPair) -> Result<()>;

    /// Await the inbound connection of a handshake peer that was told to
    /// dial us. Resolves once the connection is live.
    async fn add_node_accept(&self, info: NodeInfo, endpoints: EndpointPair) -> Result<()>;

    /// Port this transport accepts connections on; advertised to peers.
    fn accepting_port(&self) -> u16;

    /// Local interface address, used for the internal half of an
    /// advertised endpoint pair.
    fn local_ip(&self) -> std::net::IpAddr;
}

/// Upcalls from the transport into the node's event loop.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A datagram arrived from a connected peer.
    MessageReceived { peer: Address, bytes: Vec<u8> },
    /// A connection (inbound or outbound) became live.
    PeerConnected { peer: Address },
    /// A connection dropped; the peer is gone until re-added.
    ConnectionLost { peer: Address },
}
