//! # Routing Node
//!
//! The node ties the core together: a public [`RoutingNode`] handle and a
//! private actor owning the routing table, duplicate filter, content
//! cache, handshake state, and pending-response bookkeeping.
//!
//! ## Actor architecture
//!
//! All message-driven work runs on one task. The transport posts
//! [`TransportEvent`]s onto the actor's event channel; public operations
//! post commands with oneshot completions; blocking collaborator calls
//! (dialling, accepting) run in spawned tasks that post their results back
//! as commands. A task whose post fails has outlived the node and becomes
//! a no-op.
//!
//! ## Receive pipeline
//!
//! Every inbound datagram walks the same stages, in order:
//!
//! 1. parse header and tag; undecodable datagrams are logged and dropped
//! 2. duplicate suppression on `(origin, message id)`
//! 3. cache maintenance (transiting `GetDataResponse` payloads), with an
//!    optional cache answer for transiting `GetData`
//! 4. forward to the table's targets: the whole close group in swarm
//!    range, one greedy hop beyond it
//! 5. hand relayed replies to their directly-connected client
//! 6. stop unless this node sits in the destination's close group
//! 7. drop group-addressed `Connect` traffic meant for another member
//! 8. sentinel gate for group-authority messages
//! 9. local dispatch by tag
//!
//! ## Joining
//!
//! `New → Bootstrapping → Joining → Joined`: dial stored contacts until
//! one answers with the expected identity, find our close group through
//! that peer, then connect to each discovered member. The bootstrap peer
//! stops proxying once the table reaches `QUORUM_SIZE`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::TimedLru;
use crate::error::{Result, RoutingError};
use crate::identity::{Address, Contact, EndpointPair, Keypair, NodeInfo, PublicId};
use crate::messages::{
    parse_body, parse_envelope, serialize_body, serialize_message, Authority, Connect,
    ConnectResponse, DataTag, DestinationAddress, FilterKey, FindGroup, FindGroupResponse,
    GetData, GetDataResponse, Message, MessageHeader, MessageId, MessageSignature,
    MessageTypeTag, Post, PostResponse, PutData, PutDataResponse, SourceAddress,
};
use crate::sentinel::Sentinel;
use crate::store::BootstrapStore;
use crate::table::{
    close_group_difference, CloseGroupDifference, RoutingTable, QUORUM_SIZE,
};
use crate::transport::{Transport, TransportEvent};

const COMMAND_BUFFER: usize = 100;

/// Capability interface the application layer plugs into the core.
///
/// `handle_get` may return a payload, in which case the node synthesizes a
/// `GetDataResponse` back along the reply path; the other handlers are
/// notifications.
pub trait Persona: Send + 'static {
    fn handle_get(
        &mut self,
        from: SourceAddress,
        from_authority: Authority,
        our_authority: Authority,
        tag: DataTag,
        name: Address,
    ) -> Option<Vec<u8>>;

    fn handle_put(
        &mut self,
        from: SourceAddress,
        from_authority: Authority,
        our_authority: Authority,
        tag: DataTag,
        data: Vec<u8>,
    );

    fn handle_post(
        &mut self,
        from: SourceAddress,
        from_authority: Authority,
        our_authority: Authority,
        tag: DataTag,
        payload: Vec<u8>,
    );

    fn handle_get_response(&mut self, name: Address, data: Option<Vec<u8>>);

    fn handle_churn(&mut self, difference: CloseGroupDifference);
}

/// Tunables for one node.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// Answer transiting `GetData` requests from the local content cache.
    /// Off by default; the application layer may prefer to own this path.
    pub serve_from_cache: bool,
    /// How long `get`/`put`/`post` wait for a correlated response.
    pub response_timeout: Duration,
    pub filter_capacity: usize,
    pub filter_ttl: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            serve_from_cache: false,
            response_timeout: Duration::from_secs(30),
            filter_capacity: 4096,
            filter_ttl: Duration::from_secs(20 * 60),
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Where a node stands in the joining lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    New,
    Bootstrapping,
    Joining,
    Joined,
}

/// Observability snapshot.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub state: NodeState,
    pub table_size: usize,
    /// Table fill level as a percentage.
    pub network_status: u32,
}

enum Command {
    Bootstrap {
        contacts: Option<Vec<Contact>>,
        reply: oneshot::Sender<Result<Address>>,
    },
    BootstrapConnected {
        contact: Contact,
        our_endpoint: SocketAddr,
        reply: oneshot::Sender<Result<Address>>,
    },
    Get {
        tag: DataTag,
        name: Address,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Put {
        to: Address,
        tag: DataTag,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Post {
        to: Address,
        tag: DataTag,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    AddBootstrapContact(Contact),
    AddKnownNode(NodeInfo),
    CloseGroup(oneshot::Sender<Vec<NodeInfo>>),
    Status(oneshot::Sender<NodeStatus>),
    PeerConnectionReady(NodeInfo),
    Shutdown,
}

/// Clonable handle to a running routing node.
///
/// Operations complete through oneshot futures; dropping a returned future
/// cancels the wait and any late network echo is absorbed by the duplicate
/// filter. Once the actor is gone every operation resolves `Cancelled`.
#[derive(Clone)]
pub struct RoutingNode {
    cmd_tx: mpsc::Sender<Command>,
    our_id: Address,
    public_id: PublicId,
    response_timeout: Duration,
}

impl RoutingNode {
    /// Spawn a node actor over its collaborators. `events` is the channel
    /// the transport delivers upcalls on.
    pub fn new<T, P>(
        keypair: Keypair,
        transport: T,
        events: mpsc::Receiver<TransportEvent>,
        store: Box<dyn BootstrapStore>,
        sentinel: Box<dyn Sentinel>,
        persona: P,
        config: RoutingConfig,
    ) -> Self
    where
        T: Transport,
        P: Persona,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let our_id = keypair.address();
        let public_id = keypair.public_id();
        let response_timeout = config.response_timeout;

        let actor = NodeActor {
            our_id,
            table: RoutingTable::new(our_id),
            filter: TimedLru::new(config.filter_capacity, config.filter_ttl),
            cache: TimedLru::new(config.cache_capacity, config.cache_ttl),
            connected_peers: HashSet::new(),
            bootstrap_node: None,
            our_external_endpoint: None,
            state: NodeState::New,
            message_id: rand::random(),
            pending_gets: HashMap::new(),
            pending_puts: HashMap::new(),
            pending_posts: HashMap::new(),
            keypair,
            config,
            store,
            sentinel,
            persona,
            transport: Arc::new(transport),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            events,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            our_id,
            public_id,
            response_timeout,
        }
    }

    pub fn our_id(&self) -> Address {
        self.our_id
    }

    pub fn public_id(&self) -> PublicId {
        self.public_id
    }

    /// Dial stored bootstrap contacts until one answers with the expected
    /// identity, then start close-group discovery through it. Resolves
    /// with the bootstrap peer's address, or `NoBootstrapPeer` once every
    /// contact has been tried.
    pub async fn bootstrap(&self) -> Result<Address> {
        self.bootstrap_inner(None).await
    }

    /// Bootstrap from an explicit contact list instead of the store.
    pub async fn bootstrap_with(&self, contacts: Vec<Contact>) -> Result<Address> {
        self.bootstrap_inner(Some(contacts)).await
    }

    async fn bootstrap_inner(&self, contacts: Option<Vec<Contact>>) -> Result<Address> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Bootstrap { contacts, reply }).await?;
        rx.await.map_err(|_| RoutingError::Cancelled)?
    }

    /// Retrieve data by name. Resolves with the first payload-carrying
    /// response; times out if no group member answers with data.
    pub async fn get(&self, tag: DataTag, name: Address) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Get { tag, name, reply }).await?;
        self.await_response(rx).await
    }

    /// Store data with the group managing `to`. Resolves once the group
    /// answers, with `Refused` when it says no.
    pub async fn put(&self, to: Address, tag: DataTag, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Put {
            to,
            tag,
            data,
            reply,
        })
        .await?;
        self.await_response(rx).await
    }

    /// Deliver an application payload to the group managing `to`.
    pub async fn post(
        &self,
        to: Address,
        tag: DataTag,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Post {
            to,
            tag,
            payload,
            reply,
        })
        .await?;
        self.await_response(rx).await
    }

    /// Persist a contact for future bootstraps.
    pub async fn add_bootstrap_contact(&self, contact: Contact) -> Result<()> {
        self.send_command(Command::AddBootstrapContact(contact)).await
    }

    /// Insert an already-verified, already-connected peer straight into
    /// the routing table, bypassing the connect handshake.
    pub async fn add_known_node(&self, info: NodeInfo) -> Result<()> {
        self.send_command(Command::AddKnownNode(info)).await
    }

    pub async fn close_group(&self) -> Result<Vec<NodeInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::CloseGroup(reply)).await?;
        rx.await.map_err(|_| RoutingError::Cancelled)
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Status(reply)).await?;
        rx.await.map_err(|_| RoutingError::Cancelled)
    }

    /// Stop the actor. Outstanding operations resolve `Cancelled`.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| RoutingError::Cancelled)
    }

    async fn await_response<R>(&self, rx: oneshot::Receiver<Result<R>>) -> Result<R> {
        match timeout(self.response_timeout, rx).await {
            Err(_) => Err(RoutingError::Timeout),
            Ok(Err(_)) => Err(RoutingError::Cancelled),
            Ok(Ok(result)) => result,
        }
    }
}

struct NodeActor<T: Transport, P: Persona> {
    our_id: Address,
    keypair: Keypair,
    config: RoutingConfig,
    table: RoutingTable,
    filter: TimedLru<FilterKey, ()>,
    cache: TimedLru<Address, Vec<u8>>,
    /// Every live transport connection; members minus the routing table
    /// are clients we relay for.
    connected_peers: HashSet<Address>,
    bootstrap_node: Option<Address>,
    our_external_endpoint: Option<SocketAddr>,
    state: NodeState,
    message_id: MessageId,
    pending_gets: HashMap<MessageId, (Instant, oneshot::Sender<Result<Vec<u8>>>)>,
    pending_puts: HashMap<MessageId, (Instant, oneshot::Sender<Result<()>>)>,
    pending_posts: HashMap<MessageId, (Instant, oneshot::Sender<Result<Option<Vec<u8>>>>)>,
    store: Box<dyn BootstrapStore>,
    sentinel: Box<dyn Sentinel>,
    persona: P,
    transport: Arc<T>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Receiver<TransportEvent>,
}

impl<T: Transport, P: Persona> NodeActor<T, P> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("transport event channel closed, stopping node");
                        break;
                    }
                },
            }
        }
        debug!(node = %self.our_id, "routing node stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Bootstrap { contacts, reply } => self.start_bootstrap(contacts, reply),
            Command::BootstrapConnected {
                contact,
                our_endpoint,
                reply,
            } => {
                self.bootstrap_connected(contact, our_endpoint);
                let _ = reply.send(Ok(contact.id));
            }
            Command::Get { tag, name, reply } => self.start_get(tag, name, reply),
            Command::Put {
                to,
                tag,
                data,
                reply,
            } => self.start_put(to, tag, data, reply),
            Command::Post {
                to,
                tag,
                payload,
                reply,
            } => self.start_post(to, tag, payload, reply),
            Command::AddBootstrapContact(contact) => {
                if let Err(error) = self.store.add(&[contact]) {
                    warn!(%error, "failed to persist bootstrap contact");
                }
            }
            Command::AddKnownNode(mut info) => {
                info.connected = true;
                self.connected_peers.insert(info.id);
                self.add_peer(info);
            }
            Command::CloseGroup(reply) => {
                let _ = reply.send(self.table.our_close_group());
            }
            Command::Status(reply) => {
                let _ = reply.send(NodeStatus {
                    state: self.state,
                    table_size: self.table.len(),
                    network_status: self.table.network_status(),
                });
            }
            Command::PeerConnectionReady(info) => self.peer_connection_ready(info),
            Command::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived { peer, bytes } => {
                self.message_received(peer, bytes);
            }
            TransportEvent::PeerConnected { peer } => {
                self.connected_peers.insert(peer);
            }
            TransportEvent::ConnectionLost { peer } => self.connection_lost(peer),
        }
    }

    // ---- joining ----------------------------------------------------------

    fn start_bootstrap(
        &mut self,
        contacts: Option<Vec<Contact>>,
        reply: oneshot::Sender<Result<Address>>,
    ) {
        let contacts = contacts.unwrap_or_else(|| self.store.read());
        self.state = NodeState::Bootstrapping;
        if contacts.is_empty() {
            let _ = reply.send(Err(RoutingError::NoBootstrapPeer));
            return;
        }

        let transport = Arc::clone(&self.transport);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            for contact in contacts {
                match transport.connect(contact.endpoints.external).await {
                    Ok((peer, our_endpoint)) if peer == contact.id => {
                        let _ = cmd_tx
                            .send(Command::BootstrapConnected {
                                contact,
                                our_endpoint,
                                reply,
                            })
                            .await;
                        return;
                    }
                    Ok((peer, _)) => {
                        warn!(expected = %contact.id, observed = %peer,
                              "bootstrap peer identity mismatch");
                        transport.disconnect(peer).await;
                    }
                    Err(error) => {
                        debug!(peer = %contact.id, %error, "bootstrap connect failed");
                    }
                }
            }
            let _ = reply.send(Err(RoutingError::NoBootstrapPeer));
        });
    }

    fn bootstrap_connected(&mut self, contact: Contact, our_endpoint: SocketAddr) {
        self.bootstrap_node = Some(contact.id);
        self.our_external_endpoint = Some(our_endpoint);
        self.connected_peers.insert(contact.id);
        self.state = NodeState::Joining;
        info!(bootstrap = %contact.id, external = %our_endpoint,
              "bootstrapped, discovering close group");
        self.connect_to_close_group();
    }

    /// Ask the network for our own close group. Routed through the
    /// bootstrap peer alone until the table has peers of its own; also
    /// re-issued whenever churn disturbs the group.
    fn connect_to_close_group(&mut self) {
        let header = MessageHeader {
            destination: DestinationAddress::direct(self.our_id),
            source: self.our_source_address(),
            message_id: self.next_message_id(),
            authority: Authority::Node,
            signature: None,
        };
        let message = Message::FindGroup(FindGroup {
            target: self.our_id,
        });
        self.originate(header, &message);
    }

    fn peer_connection_ready(&mut self, mut info: NodeInfo) {
        info.connected = true;
        self.connected_peers.insert(info.id);
        self.add_peer(info);

        if self.bootstrap_node.is_some() && self.table.len() >= QUORUM_SIZE {
            self.bootstrap_node = None;
            self.state = NodeState::Joined;
            info!(size = self.table.len(), "routing table reached quorum, joined");
        }
    }

    /// Table insertion shared by handshake completion, direct injection
    /// and bootstrap. Emits churn and drops evicted connections.
    fn add_peer(&mut self, info: NodeInfo) {
        let peer = info.id;
        let before = self.table.close_group_ids();
        let (added, evicted) = self.table.add_node(info);

        if let Some(evicted) = evicted {
            debug!(peer = %evicted.id, "evicting routing-table peer");
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                transport.disconnect(evicted.id).await;
            });
        }
        if !added {
            return;
        }
        debug!(%peer, size = self.table.len(),
               network_status = self.table.network_status(), "peer added");

        let difference = close_group_difference(&before, &self.table.close_group_ids());
        if !difference.is_empty() {
            self.persona.handle_churn(difference);
        }
    }

    fn connection_lost(&mut self, peer: Address) {
        self.connected_peers.remove(&peer);
        if self.table.drop_node(&peer).is_none() {
            return;
        }
        debug!(%peer, size = self.table.len(), "routing-table peer lost");

        let before_dropped = {
            let mut before = self.table.close_group_ids();
            before.push(peer);
            before
        };
        let difference =
            close_group_difference(&before_dropped, &self.table.close_group_ids());
        if !difference.is_empty() {
            self.persona.handle_churn(difference);
            // A hole in the close group: go looking for replacements.
            self.connect_to_close_group();
        }
    }

    // ---- receive pipeline -------------------------------------------------

    fn message_received(&mut self, peer: Address, bytes: Vec<u8>) {
        let envelope = match parse_envelope(&bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%peer, %error, "discarding undecodable datagram");
                return;
            }
        };
        let header = envelope.header.clone();

        let filter_key = header.filter_key();
        if self.filter.check(&filter_key) {
            return;
        }
        self.filter.add(filter_key, ());

        if envelope.tag == MessageTypeTag::GetDataResponse {
            if let Ok(Message::GetDataResponse(response)) =
                parse_body(envelope.tag, envelope.body(&bytes))
            {
                if let Some(data) = response.data {
                    self.cache.add(response.name, data);
                }
            }
        }
        if envelope.tag == MessageTypeTag::GetData && self.config.serve_from_cache {
            if let Ok(Message::GetData(request)) = parse_body(envelope.tag, envelope.body(&bytes))
            {
                if let Some(data) = self.cache.get(&request.name).cloned() {
                    debug!(name = %request.name, "answering get from cache");
                    self.answer_get(&header, &request, data);
                    return;
                }
            }
        }

        for target in self.table.target_nodes(&header.destination.id) {
            self.spawn_send(target.id, bytes.clone());
        }

        if let Some(relay) = header.destination.relay_to {
            if relay != self.our_id && self.is_connected_client(&relay) {
                self.spawn_send(relay, bytes);
                return;
            }
        }

        // A message relayed to us is ours even when the routed hop that
        // carried it is outside our range.
        let relayed_to_us = header.destination.relay_to == Some(self.our_id);
        if !relayed_to_us && !self.table.address_in_close_group_range(&header.destination.id) {
            return;
        }

        if envelope.tag.is_direct() && !header.addressed_to(&self.our_id) {
            return;
        }

        let body = if header.from_group().is_some() {
            match self
                .sentinel
                .add(&header, envelope.tag, envelope.body(&bytes))
            {
                Some(body) => body,
                None => return,
            }
        } else {
            envelope.body(&bytes).to_vec()
        };

        let message = match parse_body(envelope.tag, &body) {
            Ok(message) => message,
            Err(error) => {
                warn!(%peer, tag = ?envelope.tag, %error, "discarding undecodable body");
                return;
            }
        };
        if let Err(error) = self.dispatch(header, message) {
            warn!(%peer, %error, "dispatch failed");
        }
    }

    fn dispatch(&mut self, header: MessageHeader, message: Message) -> Result<()> {
        match message {
            Message::Connect(connect) => self.handle_connect(header, connect),
            Message::ConnectResponse(response) => {
                self.handle_connect_response(header, response)
            }
            Message::FindGroup(find_group) => self.handle_find_group(header, find_group),
            Message::FindGroupResponse(response) => {
                self.handle_find_group_response(header, response)
            }
            Message::GetData(request) => self.handle_get_data(header, request),
            Message::GetDataResponse(response) => {
                self.handle_get_data_response(header, response)
            }
            Message::PutData(request) => self.handle_put_data(header, request),
            Message::PutDataResponse(response) => {
                self.handle_put_data_response(header, response)
            }
            Message::Post(request) => self.handle_post_message(header, request),
            Message::PostResponse(response) => self.handle_post_response(header, response),
        }
    }

    // ---- handshake handlers -----------------------------------------------

    fn handle_connect(&mut self, header: MessageHeader, connect: Connect) -> Result<()> {
        if connect.receiver_id != self.our_id {
            return Ok(());
        }
        let info = NodeInfo::new(connect.requester_fob, connect.requester_endpoints);
        if info.id != connect.requester_id {
            warn!(claimed = %connect.requester_id, derived = %info.id,
                  "connect requester id does not match its key");
            return Err(RoutingError::SignatureInvalid);
        }
        if !self.table.check_node(&info.id) {
            return Ok(());
        }

        let response = Message::ConnectResponse(ConnectResponse {
            requester_endpoints: connect.requester_endpoints,
            receiver_endpoints: self.next_endpoint_pair(),
            requester_id: connect.requester_id,
            receiver_id: self.our_id,
            receiver_fob: self.keypair.public_id(),
        });
        let body = serialize_body(&response)?;
        let reply_header = MessageHeader {
            destination: header.reply_destination(),
            source: self.our_source_address(),
            message_id: header.message_id,
            authority: Authority::Node,
            signature: Some(MessageSignature(self.keypair.sign(&body).to_bytes())),
        };
        self.originate(reply_header, &response);

        let transport = Arc::clone(&self.transport);
        let cmd_tx = self.cmd_tx.clone();
        let endpoints = connect.requester_endpoints;
        tokio::spawn(async move {
            match transport.add_node_accept(info.clone(), endpoints).await {
                Ok(()) => {
                    let _ = cmd_tx.send(Command::PeerConnectionReady(info)).await;
                }
                Err(error) => {
                    debug!(peer = %info.id, %error, "accepting handshake peer failed");
                }
            }
        });
        Ok(())
    }

    fn handle_connect_response(
        &mut self,
        header: MessageHeader,
        response: ConnectResponse,
    ) -> Result<()> {
        if response.requester_id != self.our_id {
            return Ok(());
        }
        let body = serialize_body(&Message::ConnectResponse(response.clone()))?;
        let info = NodeInfo::new(response.receiver_fob, response.receiver_endpoints);
        if info.id != response.receiver_id {
            warn!(claimed = %response.receiver_id, derived = %info.id,
                  "connect response receiver id does not match its key");
            return Err(RoutingError::SignatureInvalid);
        }
        header.verify_signature(&response.receiver_fob, &body)?;
        if !self.table.check_node(&info.id) {
            return Ok(());
        }

        let transport = Arc::clone(&self.transport);
        let cmd_tx = self.cmd_tx.clone();
        let endpoints = response.receiver_endpoints;
        tokio::spawn(async move {
            match transport.add_node(info.clone(), endpoints).await {
                Ok(()) => {
                    let _ = cmd_tx.send(Command::PeerConnectionReady(info)).await;
                }
                Err(error) => {
                    debug!(peer = %info.id, %error, "dialling handshake peer failed");
                }
            }
        });
        Ok(())
    }

    fn handle_find_group(
        &mut self,
        header: MessageHeader,
        find_group: FindGroup,
    ) -> Result<()> {
        let mut group: Vec<PublicId> = self
            .table
            .our_close_group()
            .iter()
            .map(NodeInfo::public_id)
            .collect();
        group.push(self.keypair.public_id());

        let response = Message::FindGroupResponse(FindGroupResponse {
            target: find_group.target,
            group,
        });
        let body = serialize_body(&response)?;
        let reply_header = MessageHeader {
            destination: header.reply_destination(),
            source: SourceAddress {
                node: self.our_id,
                group: Some(find_group.target),
                relay_for: None,
            },
            message_id: header.message_id,
            authority: Authority::NaeManager,
            signature: Some(MessageSignature(self.keypair.sign(&body).to_bytes())),
        };
        self.originate(reply_header, &response);
        Ok(())
    }

    fn handle_find_group_response(
        &mut self,
        header: MessageHeader,
        response: FindGroupResponse,
    ) -> Result<()> {
        // The responder signs with its long-term key and lists itself in
        // the group; verify when that key is present.
        let body = serialize_body(&Message::FindGroupResponse(response.clone()))?;
        if let Some(fob) = response
            .group
            .iter()
            .find(|fob| fob.address() == header.source.node)
        {
            header.verify_signature(fob, &body)?;
        }

        for fob in response.group {
            let peer = fob.address();
            if peer == self.our_id || !self.table.check_node(&peer) {
                continue;
            }
            let connect = Message::Connect(Connect {
                requester_endpoints: self.next_endpoint_pair(),
                requester_id: self.our_id,
                receiver_id: peer,
                requester_fob: self.keypair.public_id(),
            });
            let connect_header = MessageHeader {
                destination: DestinationAddress::direct(peer),
                source: self.our_source_address(),
                message_id: self.next_message_id(),
                authority: Authority::NaeManager,
                signature: None,
            };
            self.originate(connect_header, &connect);
        }
        Ok(())
    }

    // ---- data handlers ----------------------------------------------------

    fn handle_get_data(&mut self, header: MessageHeader, request: GetData) -> Result<()> {
        let our_authority = our_authority(&self.table, &header, &request.name)?;
        let served = self.persona.handle_get(
            header.source,
            header.authority,
            our_authority,
            request.tag,
            request.name,
        );
        if let Some(data) = served {
            self.answer_get(&header, &request, data);
        }
        Ok(())
    }

    fn handle_get_data_response(
        &mut self,
        header: MessageHeader,
        response: GetDataResponse,
    ) -> Result<()> {
        self.expire_pending();
        match response.data {
            Some(data) => {
                if let Some((_, reply)) = self.pending_gets.remove(&header.message_id) {
                    let _ = reply.send(Ok(data.clone()));
                }
                self.persona.handle_get_response(response.name, Some(data));
            }
            None => {
                // Another group member may still answer with data; leave
                // the waiter in place.
                self.persona.handle_get_response(response.name, None);
            }
        }
        Ok(())
    }

    fn handle_put_data(&mut self, header: MessageHeader, request: PutData) -> Result<()> {
        let element = header.destination.id;
        let our_authority = our_authority(&self.table, &header, &element)?;
        self.persona.handle_put(
            header.source,
            header.authority,
            our_authority,
            request.tag,
            request.data,
        );
        Ok(())
    }

    fn handle_put_data_response(
        &mut self,
        header: MessageHeader,
        response: PutDataResponse,
    ) -> Result<()> {
        self.expire_pending();
        if let Some((_, reply)) = self.pending_puts.remove(&header.message_id) {
            let result = match response.error {
                None => Ok(()),
                Some(reason) => Err(RoutingError::Refused(reason)),
            };
            let _ = reply.send(result);
        }
        Ok(())
    }

    fn handle_post_message(&mut self, header: MessageHeader, request: Post) -> Result<()> {
        let element = header.destination.id;
        let our_authority = our_authority(&self.table, &header, &element)?;
        self.persona.handle_post(
            header.source,
            header.authority,
            our_authority,
            request.tag,
            request.payload,
        );
        Ok(())
    }

    fn handle_post_response(
        &mut self,
        header: MessageHeader,
        response: PostResponse,
    ) -> Result<()> {
        self.expire_pending();
        if let Some((_, reply)) = self.pending_posts.remove(&header.message_id) {
            let _ = reply.send(Ok(response.payload));
        }
        Ok(())
    }

    /// Synthesize a `GetDataResponse` back along the reply path, speaking
    /// as the data's group.
    fn answer_get(&mut self, header: &MessageHeader, request: &GetData, data: Vec<u8>) {
        let response = Message::GetDataResponse(GetDataResponse {
            tag: request.tag,
            name: request.name,
            data: Some(data),
        });
        let body = match serialize_body(&response) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "failed to serialize get response");
                return;
            }
        };
        let reply_header = MessageHeader {
            destination: header.reply_destination(),
            source: SourceAddress {
                node: self.our_id,
                group: Some(request.name),
                relay_for: None,
            },
            message_id: header.message_id,
            authority: Authority::NaeManager,
            signature: Some(MessageSignature(self.keypair.sign(&body).to_bytes())),
        };
        self.originate(reply_header, &response);
    }

    // ---- application operations ------------------------------------------

    fn start_get(
        &mut self,
        tag: DataTag,
        name: Address,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    ) {
        let message_id = self.next_message_id();
        let header = MessageHeader {
            destination: DestinationAddress::direct(name),
            source: self.our_source_address(),
            message_id,
            authority: Authority::Node,
            signature: None,
        };
        let message = Message::GetData(GetData { tag, name });
        self.expire_pending();
        self.pending_gets
            .insert(message_id, (Instant::now(), reply));
        self.originate(header, &message);
    }

    fn start_put(
        &mut self,
        to: Address,
        tag: DataTag,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let message_id = self.next_message_id();
        let header = MessageHeader {
            destination: DestinationAddress::direct(to),
            source: self.our_source_address(),
            message_id,
            authority: Authority::Client,
            signature: None,
        };
        let message = Message::PutData(PutData { tag, data });
        self.expire_pending();
        self.pending_puts
            .insert(message_id, (Instant::now(), reply));
        self.originate(header, &message);
    }

    fn start_post(
        &mut self,
        to: Address,
        tag: DataTag,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    ) {
        let message_id = self.next_message_id();
        let header = MessageHeader {
            destination: DestinationAddress::direct(to),
            source: self.our_source_address(),
            message_id,
            authority: Authority::Node,
            signature: None,
        };
        let message = Message::Post(Post { tag, payload });
        self.expire_pending();
        self.pending_posts
            .insert(message_id, (Instant::now(), reply));
        self.originate(header, &message);
    }

    // ---- plumbing ---------------------------------------------------------

    /// Serialize and route a message this node originates. The filter is
    /// left alone: replies reuse the request's correlation key, and
    /// learning our own sends would suppress them.
    fn originate(&mut self, header: MessageHeader, message: &Message) {
        let bytes = match serialize_message(&header, message) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, tag = ?message.tag(), "failed to serialize message");
                return;
            }
        };
        self.send_routed(&header.destination, bytes);
    }

    /// Routing for outbound traffic: relayed replies go straight to their
    /// client; everything else goes via the bootstrap proxy while one is
    /// set, or to the table's targets.
    fn send_routed(&mut self, destination: &DestinationAddress, bytes: Vec<u8>) {
        if let Some(relay) = destination.relay_to {
            if relay != self.our_id && self.is_connected_client(&relay) {
                self.spawn_send(relay, bytes);
                return;
            }
        }
        if let Some(bootstrap) = self.bootstrap_node {
            self.spawn_send(bootstrap, bytes);
            return;
        }

        let targets = self.table.target_nodes(&destination.id);
        if targets.is_empty() {
            debug!(target = %destination.id, "no route to destination");
            return;
        }
        for target in targets {
            self.spawn_send(target.id, bytes.clone());
        }
    }

    fn spawn_send(&self, peer: Address, bytes: Vec<u8>) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(error) = transport.send(peer, bytes).await {
                warn!(%peer, %error, "transport send failed");
            }
        });
    }

    fn is_connected_client(&self, peer: &Address) -> bool {
        self.connected_peers.contains(peer) && !self.table.contains(peer)
    }

    fn our_source_address(&self) -> SourceAddress {
        match self.bootstrap_node {
            Some(bootstrap) => SourceAddress {
                node: bootstrap,
                group: None,
                relay_for: Some(self.our_id),
            },
            None => SourceAddress::node(self.our_id),
        }
    }

    fn next_endpoint_pair(&self) -> EndpointPair {
        let port = self.transport.accepting_port();
        let internal = SocketAddr::new(self.transport.local_ip(), port);
        let external = match self.our_external_endpoint {
            Some(endpoint) => SocketAddr::new(endpoint.ip(), port),
            None => internal,
        };
        EndpointPair::new(internal, external)
    }

    fn next_message_id(&mut self) -> MessageId {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    fn expire_pending(&mut self) {
        let ttl = self.config.response_timeout;
        self.pending_gets
            .retain(|_, entry| entry.0.elapsed() <= ttl);
        self.pending_puts
            .retain(|_, entry| entry.0.elapsed() <= ttl);
        self.pending_posts
            .retain(|_, entry| entry.0.elapsed() <= ttl);
    }
}

/// Derive the role this node plays for a message about `element`, from the
/// routing-table geometry alone.
pub(crate) fn our_authority(
    table: &RoutingTable,
    header: &MessageHeader,
    element: &Address,
) -> Result<Authority> {
    let our_id = *table.our_id();

    if header.from_group().is_none()
        && table.address_in_close_group_range(&header.source.node)
        && header.destination.id != *element
    {
        return Ok(Authority::ClientManager);
    }
    if table.address_in_close_group_range(element) && header.destination.id == *element {
        return Ok(Authority::NaeManager);
    }
    if let Some(group) = header.from_group() {
        if table.address_in_close_group_range(&header.destination.id)
            && header.destination.id != our_id
        {
            return Ok(Authority::NodeManager);
        }
        if table.address_in_close_group_range(&group) && header.destination.id == our_id {
            return Ok(Authority::ManagedNode);
        }
    }
    Err(RoutingError::InvalidAuthority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{EndpointPair, ADDRESS_LENGTH};
    use crate::table::GROUP_SIZE;

    fn make_address(bytes_spec: &[(usize, u8)]) -> Address {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        for (index, value) in bytes_spec {
            bytes[*index] = *value;
        }
        Address::from_bytes(bytes)
    }

    fn test_endpoints() -> EndpointPair {
        let addr = "127.0.0.1:5483".parse().unwrap();
        EndpointPair::new(addr, addr)
    }

    fn node_info(id: Address) -> NodeInfo {
        NodeInfo {
            id,
            public_key: [0u8; 32],
            endpoints: test_endpoints(),
            connected: true,
        }
    }

    fn header(
        destination: Address,
        source: Address,
        group: Option<Address>,
    ) -> MessageHeader {
        MessageHeader {
            destination: DestinationAddress::direct(destination),
            source: SourceAddress {
                node: source,
                group,
                relay_for: None,
            },
            message_id: 1,
            authority: Authority::Node,
            signature: None,
        }
    }

    /// Table owned by the zero address with a handful of mid-range peers,
    /// plus a dense crowd near 0xFF.. so that far addresses fall outside
    /// our close-group range.
    fn geometry() -> (RoutingTable, Address, Address) {
        let our_id = Address::from_bytes([0u8; ADDRESS_LENGTH]);
        let mut table = RoutingTable::new(our_id);
        for i in 0..4u8 {
            table.add_node(node_info(make_address(&[(20, i + 1)])));
        }

        let far_element = make_address(&[(0, 0xFF), (1, 0xFF)]);
        for i in 0..GROUP_SIZE as u8 + 2 {
            // Crowd strictly closer to far_element than we are.
            table.add_node(node_info(make_address(&[(0, 0xFF), (1, 0xFF), (63, i + 1)])));
        }
        let near_element = make_address(&[(40, 7)]);
        (table, near_element, far_element)
    }

    #[test]
    fn client_manager_for_close_client_acting_elsewhere() {
        let (table, near_element, _) = geometry();
        let client = make_address(&[(30, 9)]);
        let destination = make_address(&[(25, 3)]);

        let header = header(destination, client, None);
        assert_eq!(
            our_authority(&table, &header, &near_element).unwrap(),
            Authority::ClientManager
        );
    }

    #[test]
    fn nae_manager_when_destination_is_the_element_in_range() {
        let (table, near_element, _) = geometry();
        let source = make_address(&[(30, 9)]);

        // destination == element, element within our range; the
        // client-manager arm is skipped because destination == element.
        let header = header(near_element, source, None);
        assert_eq!(
            our_authority(&table, &header, &near_element).unwrap(),
            Authority::NaeManager
        );
    }

    #[test]
    fn node_manager_for_group_traffic_to_a_managed_peer() {
        let (table, _, _) = geometry();
        let group = make_address(&[(33, 1)]);
        let managed_peer = make_address(&[(20, 1)]);
        let element = make_address(&[(44, 5)]);

        let header = header(managed_peer, make_address(&[(30, 9)]), Some(group));
        assert_eq!(
            our_authority(&table, &header, &element).unwrap(),
            Authority::NodeManager
        );
    }

    #[test]
    fn managed_node_for_group_traffic_to_self() {
        let (table, _, _) = geometry();
        let our_id = *table.our_id();
        let group = make_address(&[(33, 1)]);
        let element = make_address(&[(44, 5)]);

        let header = header(our_id, make_address(&[(30, 9)]), Some(group));
        assert_eq!(
            our_authority(&table, &header, &element).unwrap(),
            Authority::ManagedNode
        );
    }

    #[test]
    fn no_authority_outside_every_role() {
        let (table, _, far_element) = geometry();
        // Source outside our range, no group, element out of range and not
        // the destination.
        let far_source = make_address(&[(0, 0xFF), (1, 0xFF), (62, 9)]);
        let destination = make_address(&[(25, 3)]);

        let header = header(destination, far_source, None);
        assert!(matches!(
            our_authority(&table, &header, &far_element),
            Err(RoutingError::InvalidAuthority)
        ));
    }

    #[test]
    fn authority_is_pure_over_the_snapshot() {
        let (table, near_element, _) = geometry();
        let source = make_address(&[(30, 9)]);
        let header = header(near_element, source, None);

        let first = our_authority(&table, &header, &near_element).unwrap();
        let second = our_authority(&table, &header, &near_element).unwrap();
        assert_eq!(first, second);
    }
}
