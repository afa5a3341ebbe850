//! # Wire Protocol
//!
//! Every datagram on the overlay is three bincode-framed sections laid end
//! to end:
//!
//! ```text
//! encode(MessageHeader) ‖ tag byte ‖ encode(body matching tag)
//! ```
//!
//! Encoding is little-endian with varint collection lengths and general
//! integers; fixed-size fields (addresses, keys, signatures) are raw
//! bytes, and the `message_id` is raw 32-bit little-endian regardless of
//! magnitude. All decoding goes through size-bounded options so a hostile
//! length prefix cannot balloon allocation. Parsing is staged: a relay
//! decodes only the header and tag, forwards the original bytes
//! untouched, and decodes the body just before local dispatch.
//!
//! | Tag | Body | Direction |
//! |-----|------|-----------|
//! | `Connect` / `ConnectResponse` | endpoint + key exchange | point-to-point |
//! | `FindGroup` / `FindGroupResponse` | close-group discovery | routed / group-signed |
//! | `GetData` / `GetDataResponse` | content retrieval | routed |
//! | `PutData` / `PutDataResponse` | content storage | routed |
//! | `Post` / `PostResponse` | application payloads | routed |
//!
//! The pair `(source node, message id)` is both the duplicate-filter key
//! and the correlation key for replies: responders echo the inbound
//! `message_id`. Signatures, where present, cover the serialized body.

use std::io::Cursor;

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::{Result, RoutingError};
use crate::identity::{Address, EndpointPair, PublicId};

/// Per-origin monotonically increasing message identifier.
pub type MessageId = u32;

/// Application data type discriminator, opaque to the routing core.
pub type DataTag = u64;

/// Unit of duplicate suppression and sentinel correlation.
pub type FilterKey = (Address, MessageId);

/// Largest payload the overlay will carry (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Deserialization bound: payload plus framing headroom.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_MESSAGE_SIZE as u64 + 4096;

/// Bincode options shared by every encode and decode on the wire.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_DESERIALIZE_SIZE)
}

/// The role a sender claims, and the role a receiver derives, for a
/// message relative to the close-group geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authority {
    Client,
    Node,
    ClientManager,
    NaeManager,
    NodeManager,
    ManagedNode,
}

/// Detached Ed25519 signature over a serialized message body.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature(#[serde(with = "BigArray")] pub [u8; 64]);

impl std::fmt::Debug for MessageSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageSignature({})", &hex::encode(self.0)[..8])
    }
}

/// Where a message is going: the target address plus, for replies that
/// must reach a not-yet-routable client, the relay target behind it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationAddress {
    pub id: Address,
    pub relay_to: Option<Address>,
}

impl DestinationAddress {
    pub fn direct(id: Address) -> Self {
        Self { id, relay_to: None }
    }
}

/// Who a message is from: the forwardable node address, the group the
/// sender speaks for (group-authority messages), and the client the reply
/// should be relayed to (messages sent through a bootstrap proxy).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAddress {
    pub node: Address,
    pub group: Option<Address>,
    pub relay_for: Option<Address>,
}

impl SourceAddress {
    pub fn node(node: Address) -> Self {
        Self {
            node,
            group: None,
            relay_for: None,
        }
    }
}

/// Message ids ride as their raw little-endian bytes: a fixed array skips
/// the varint integer encoding the rest of the header uses.
mod raw_message_id {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(id: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        id.to_le_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let bytes = <[u8; 4]>::deserialize(deserializer)?;
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Header carried by every message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub destination: DestinationAddress,
    pub source: SourceAddress,
    #[serde(with = "raw_message_id")]
    pub message_id: MessageId,
    pub authority: Authority,
    pub signature: Option<MessageSignature>,
}

impl MessageHeader {
    /// Duplicate-filter and sentinel correlation key.
    pub fn filter_key(&self) -> FilterKey {
        (self.source.node, self.message_id)
    }

    /// Destination for a reply to this message, preserving the relay hop.
    pub fn reply_destination(&self) -> DestinationAddress {
        DestinationAddress {
            id: self.source.node,
            relay_to: self.source.relay_for,
        }
    }

    /// The group the sender speaks for, if any.
    pub fn from_group(&self) -> Option<Address> {
        self.source.group
    }

    /// True if `id` is the final recipient, directly or behind the relay
    /// hop named in the destination.
    pub fn addressed_to(&self, id: &Address) -> bool {
        self.destination.id == *id || self.destination.relay_to == Some(*id)
    }

    /// Verify the header signature over `body` with the claimed sender key.
    pub fn verify_signature(&self, fob: &PublicId, body: &[u8]) -> Result<()> {
        match &self.signature {
            Some(signature) if fob.verify(body, &signature.0) => Ok(()),
            _ => Err(RoutingError::SignatureInvalid),
        }
    }
}

/// Concrete body discriminator; one byte on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTypeTag {
    Connect = 0,
    ConnectResponse = 1,
    FindGroup = 2,
    FindGroupResponse = 3,
    GetData = 4,
    GetDataResponse = 5,
    PutData = 6,
    PutDataResponse = 7,
    Post = 8,
    PostResponse = 9,
}

impl MessageTypeTag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Connect),
            1 => Some(Self::ConnectResponse),
            2 => Some(Self::FindGroup),
            3 => Some(Self::FindGroupResponse),
            4 => Some(Self::GetData),
            5 => Some(Self::GetDataResponse),
            6 => Some(Self::PutData),
            7 => Some(Self::PutDataResponse),
            8 => Some(Self::Post),
            9 => Some(Self::PostResponse),
            _ => None,
        }
    }

    /// Connect traffic is always point-to-point, even inside a group.
    pub fn is_direct(self) -> bool {
        matches!(self, Self::Connect | Self::ConnectResponse)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connect {
    pub requester_endpoints: EndpointPair,
    pub requester_id: Address,
    pub receiver_id: Address,
    pub requester_fob: PublicId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub requester_endpoints: EndpointPair,
    pub receiver_endpoints: EndpointPair,
    pub requester_id: Address,
    pub receiver_id: Address,
    pub receiver_fob: PublicId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindGroup {
    pub target: Address,
}

/// Each close-group member of the target replies with its view of the
/// group, itself included, speaking as the group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindGroupResponse {
    pub target: Address,
    pub group: Vec<PublicId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetData {
    pub tag: DataTag,
    pub name: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetDataResponse {
    pub tag: DataTag,
    pub name: Address,
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutData {
    pub tag: DataTag,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutDataResponse {
    pub tag: DataTag,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub tag: DataTag,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostResponse {
    pub tag: DataTag,
    pub payload: Option<Vec<u8>>,
}

/// A decoded message body.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Connect(Connect),
    ConnectResponse(ConnectResponse),
    FindGroup(FindGroup),
    FindGroupResponse(FindGroupResponse),
    GetData(GetData),
    GetDataResponse(GetDataResponse),
    PutData(PutData),
    PutDataResponse(PutDataResponse),
    Post(Post),
    PostResponse(PostResponse),
}

impl Message {
    pub fn tag(&self) -> MessageTypeTag {
        match self {
            Message::Connect(_) => MessageTypeTag::Connect,
            Message::ConnectResponse(_) => MessageTypeTag::ConnectResponse,
            Message::FindGroup(_) => MessageTypeTag::FindGroup,
            Message::FindGroupResponse(_) => MessageTypeTag::FindGroupResponse,
            Message::GetData(_) => MessageTypeTag::GetData,
            Message::GetDataResponse(_) => MessageTypeTag::GetDataResponse,
            Message::PutData(_) => MessageTypeTag::PutData,
            Message::PutDataResponse(_) => MessageTypeTag::PutDataResponse,
            Message::Post(_) => MessageTypeTag::Post,
            Message::PostResponse(_) => MessageTypeTag::PostResponse,
        }
    }
}

/// Header and tag of a datagram, with the body left undecoded so relays
/// can forward the original bytes untouched.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub header: MessageHeader,
    pub tag: MessageTypeTag,
    body_offset: usize,
}

impl Envelope {
    pub fn body<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        &datagram[self.body_offset..]
    }
}

/// Serialize a body on its own; this is the byte range signatures cover.
pub fn serialize_body(message: &Message) -> Result<Vec<u8>> {
    let bytes = match message {
        Message::Connect(body) => wire_options().serialize(body),
        Message::ConnectResponse(body) => wire_options().serialize(body),
        Message::FindGroup(body) => wire_options().serialize(body),
        Message::FindGroupResponse(body) => wire_options().serialize(body),
        Message::GetData(body) => wire_options().serialize(body),
        Message::GetDataResponse(body) => wire_options().serialize(body),
        Message::PutData(body) => wire_options().serialize(body),
        Message::PutDataResponse(body) => wire_options().serialize(body),
        Message::Post(body) => wire_options().serialize(body),
        Message::PostResponse(body) => wire_options().serialize(body),
    }?;
    Ok(bytes)
}

/// Serialize a complete datagram: header, tag byte, body.
pub fn serialize_message(header: &MessageHeader, message: &Message) -> Result<Vec<u8>> {
    let mut datagram = wire_options().serialize(header)?;
    datagram.push(message.tag() as u8);
    datagram.extend_from_slice(&serialize_body(message)?);
    Ok(datagram)
}

/// Streaming parse of header and tag. The header is always attempted
/// first; a failure there poisons the whole datagram.
pub fn parse_envelope(datagram: &[u8]) -> Result<Envelope> {
    let mut cursor = Cursor::new(datagram);
    let header: MessageHeader = wire_options().deserialize_from(&mut cursor)?;

    let tag_offset = cursor.position() as usize;
    let tag_byte = *datagram
        .get(tag_offset)
        .ok_or_else(|| RoutingError::MalformedMessage("missing tag byte".into()))?;
    let tag = MessageTypeTag::from_u8(tag_byte).ok_or(RoutingError::UnknownTag(tag_byte))?;

    Ok(Envelope {
        header,
        tag,
        body_offset: tag_offset + 1,
    })
}

/// Decode a body of a known tag. Trailing garbage is rejected.
pub fn parse_body(tag: MessageTypeTag, body: &[u8]) -> Result<Message> {
    let message = match tag {
        MessageTypeTag::Connect => Message::Connect(wire_options().deserialize(body)?),
        MessageTypeTag::ConnectResponse => {
            Message::ConnectResponse(wire_options().deserialize(body)?)
        }
        MessageTypeTag::FindGroup => Message::FindGroup(wire_options().deserialize(body)?),
        MessageTypeTag::FindGroupResponse => {
            Message::FindGroupResponse(wire_options().deserialize(body)?)
        }
        MessageTypeTag::GetData => Message::GetData(wire_options().deserialize(body)?),
        MessageTypeTag::GetDataResponse => {
            Message::GetDataResponse(wire_options().deserialize(body)?)
        }
        MessageTypeTag::PutData => Message::PutData(wire_options().deserialize(body)?),
        MessageTypeTag::PutDataResponse => {
            Message::PutDataResponse(wire_options().deserialize(body)?)
        }
        MessageTypeTag::Post => Message::Post(wire_options().deserialize(body)?),
        MessageTypeTag::PostResponse => {
            Message::PostResponse(wire_options().deserialize(body)?)
        }
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, ADDRESS_LENGTH};

    fn make_address(seed: u8) -> Address {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes[0] = seed;
        Address::from_bytes(bytes)
    }

    fn test_endpoints() -> EndpointPair {
        let addr = "10.0.0.1:5483".parse().unwrap();
        EndpointPair::new(addr, addr)
    }

    fn test_header(message_id: MessageId) -> MessageHeader {
        MessageHeader {
            destination: DestinationAddress::direct(make_address(1)),
            source: SourceAddress::node(make_address(2)),
            message_id,
            authority: Authority::Node,
            signature: None,
        }
    }

    fn sample_messages() -> Vec<Message> {
        let keypair = Keypair::generate();
        vec![
            Message::Connect(Connect {
                requester_endpoints: test_endpoints(),
                requester_id: make_address(3),
                receiver_id: make_address(4),
                requester_fob: keypair.public_id(),
            }),
            Message::ConnectResponse(ConnectResponse {
                requester_endpoints: test_endpoints(),
                receiver_endpoints: test_endpoints(),
                requester_id: make_address(3),
                receiver_id: make_address(4),
                receiver_fob: keypair.public_id(),
            }),
            Message::FindGroup(FindGroup {
                target: make_address(5),
            }),
            Message::FindGroupResponse(FindGroupResponse {
                target: make_address(5),
                group: vec![keypair.public_id()],
            }),
            Message::GetData(GetData {
                tag: 11,
                name: make_address(6),
            }),
            Message::GetDataResponse(GetDataResponse {
                tag: 11,
                name: make_address(6),
                data: Some(b"payload".to_vec()),
            }),
            Message::PutData(PutData {
                tag: 12,
                data: b"stored".to_vec(),
            }),
            Message::PutDataResponse(PutDataResponse {
                tag: 12,
                error: None,
            }),
            Message::Post(Post {
                tag: 13,
                payload: b"functor".to_vec(),
            }),
            Message::PostResponse(PostResponse {
                tag: 13,
                payload: Some(b"result".to_vec()),
            }),
        ]
    }

    #[test]
    fn round_trip_every_tag() {
        for (i, message) in sample_messages().into_iter().enumerate() {
            let header = test_header(i as MessageId);
            let datagram = serialize_message(&header, &message).unwrap();

            let envelope = parse_envelope(&datagram).unwrap();
            assert_eq!(envelope.header, header);
            assert_eq!(envelope.tag, message.tag());

            let decoded = parse_body(envelope.tag, envelope.body(&datagram)).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn truncated_datagrams_are_malformed() {
        let header = test_header(1);
        let message = Message::FindGroup(FindGroup {
            target: make_address(5),
        });
        let datagram = serialize_message(&header, &message).unwrap();

        // Chop inside the header.
        assert!(matches!(
            parse_envelope(&datagram[..10]),
            Err(RoutingError::MalformedMessage(_))
        ));

        // Header intact, tag byte gone.
        let envelope = parse_envelope(&datagram).unwrap();
        let tagless = datagram.len() - envelope.body(&datagram).len() - 1;
        assert!(matches!(
            parse_envelope(&datagram[..tagless]),
            Err(RoutingError::MalformedMessage(_))
        ));

        // Body truncated: envelope still parses, body does not.
        let short = &datagram[..datagram.len() - 8];
        let envelope = parse_envelope(short).unwrap();
        assert!(parse_body(envelope.tag, envelope.body(short)).is_err());
    }

    #[test]
    fn unknown_tag_is_reported() {
        let header = test_header(1);
        let message = Message::FindGroup(FindGroup {
            target: make_address(5),
        });
        let mut datagram = serialize_message(&header, &message).unwrap();

        let envelope = parse_envelope(&datagram).unwrap();
        let tag_offset = datagram.len() - envelope.body(&datagram).len() - 1;
        datagram[tag_offset] = 0xEE;

        assert!(matches!(
            parse_envelope(&datagram),
            Err(RoutingError::UnknownTag(0xEE))
        ));
    }

    #[test]
    fn message_id_is_raw_32_bit_on_the_wire() {
        let body = Message::FindGroup(FindGroup {
            target: make_address(5),
        });

        // Fixed width: the datagram length cannot depend on the id's
        // magnitude the way a varint would.
        let small = serialize_message(&test_header(1), &body).unwrap();
        let large = serialize_message(&test_header(u32::MAX), &body).unwrap();
        assert_eq!(small.len(), large.len());

        // And the id appears as its raw little-endian bytes.
        let header = test_header(0xDEAD_BEEF);
        let datagram = serialize_message(&header, &body).unwrap();
        let raw = 0xDEAD_BEEFu32.to_le_bytes();
        assert!(datagram.windows(4).any(|window| window == raw.as_slice()));

        let envelope = parse_envelope(&datagram).unwrap();
        assert_eq!(envelope.header.message_id, 0xDEAD_BEEF);
    }

    #[test]
    fn filter_key_and_reply_destination() {
        let mut header = test_header(42);
        header.source.relay_for = Some(make_address(9));

        assert_eq!(header.filter_key(), (make_address(2), 42));

        let reply = header.reply_destination();
        assert_eq!(reply.id, make_address(2));
        assert_eq!(reply.relay_to, Some(make_address(9)));
    }

    #[test]
    fn body_signatures_verify() {
        let keypair = Keypair::generate();
        let message = Message::FindGroupResponse(FindGroupResponse {
            target: make_address(5),
            group: vec![keypair.public_id()],
        });
        let body = serialize_body(&message).unwrap();

        let mut header = test_header(7);
        header.signature = Some(MessageSignature(keypair.sign(&body).to_bytes()));

        assert!(header.verify_signature(&keypair.public_id(), &body).is_ok());
        assert!(matches!(
            header.verify_signature(&Keypair::generate().public_id(), &body),
            Err(RoutingError::SignatureInvalid)
        ));

        header.signature = None;
        assert!(matches!(
            header.verify_signature(&keypair.public_id(), &body),
            Err(RoutingError::SignatureInvalid)
        ));
    }
}
