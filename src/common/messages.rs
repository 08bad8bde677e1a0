//! Serialize and deserialize Kademlia wire messages.

mod internal;

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::{Connectedness, Key, Multiaddr, PeerId, PeerInfo, Record};
use crate::{Error, Result};

use internal::{WireMessage, WirePeerEntry, WireRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The six message kinds of the protocol.
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> u8 {
        match value {
            MessageType::PutValue => 0,
            MessageType::GetValue => 1,
            MessageType::AddProvider => 2,
            MessageType::GetProviders => 3,
            MessageType::FindNode => 4,
            MessageType::Ping => 5,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<MessageType> {
        match value {
            0 => Ok(MessageType::PutValue),
            1 => Ok(MessageType::GetValue),
            2 => Ok(MessageType::AddProvider),
            3 => Ok(MessageType::GetProviders),
            4 => Ok(MessageType::FindNode),
            5 => Ok(MessageType::Ping),
            unknown => Err(Error::UnexpectedMessageType(unknown)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A peer entry carried in `closer_peers` or `provider_peers`.
pub struct Peer {
    pub info: PeerInfo,
    pub connectedness: Connectedness,
}

impl Peer {
    pub fn new(info: PeerInfo, connectedness: Connectedness) -> Peer {
        Peer {
            info,
            connectedness,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One framed protocol message.
///
/// Requests and responses share this shape; which fields are meaningful
/// depends on [MessageType].
pub struct Message {
    pub message_type: MessageType,
    pub key: Key,
    pub record: Option<Record>,
    pub closer_peers: Vec<Peer>,
    pub provider_peers: Vec<Peer>,
}

impl Message {
    fn new(message_type: MessageType, key: Key) -> Message {
        Message {
            message_type,
            key,
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    pub fn ping() -> Message {
        Message::new(MessageType::Ping, Key::new(Bytes::new()))
    }

    pub fn find_node(key: Key) -> Message {
        Message::new(MessageType::FindNode, key)
    }

    pub fn get_value(key: Key) -> Message {
        Message::new(MessageType::GetValue, key)
    }

    pub fn get_providers(key: Key) -> Message {
        Message::new(MessageType::GetProviders, key)
    }

    pub fn put_value(record: Record) -> Message {
        let mut message = Message::new(MessageType::PutValue, record.key.clone());
        message.record = Some(record);
        message
    }

    pub fn add_provider(key: Key, provider: Peer) -> Message {
        let mut message = Message::new(MessageType::AddProvider, key);
        message.provider_peers.push(provider);
        message
    }

    /// Reset every field except the type; a Ping response is the cleared echo
    /// of its request.
    pub fn clear(&mut self) {
        self.key = Key::new(Bytes::new());
        self.record = None;
        self.closer_peers.clear();
        self.provider_peers.clear();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        WireMessage::from(self)
            .to_bytes()
            .map_err(|error| Error::MessageSerialize(error.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let wire = WireMessage::from_bytes(bytes)?;
        Message::try_from(wire)
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> WireMessage {
        WireMessage {
            message_type: message.message_type.into(),
            key: ByteBuf::from(message.key.as_ref().to_vec()),
            record: message.record.as_ref().map(|record| WireRecord {
                key: ByteBuf::from(record.key.as_ref().to_vec()),
                value: ByteBuf::from(record.value.to_vec()),
                expires: record
                    .expires
                    .map(|expires| expires.to_string())
                    .unwrap_or_default(),
            }),
            closer_peers: message.closer_peers.iter().map(WirePeerEntry::from).collect(),
            provider_peers: message
                .provider_peers
                .iter()
                .map(WirePeerEntry::from)
                .collect(),
        }
    }
}

impl From<&Peer> for WirePeerEntry {
    fn from(peer: &Peer) -> WirePeerEntry {
        WirePeerEntry {
            id: ByteBuf::from(peer.info.id.to_vec()),
            addresses: peer
                .info
                .addresses
                .iter()
                .map(|address| address.as_str().to_string())
                .collect(),
            connectedness: peer.connectedness.into(),
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Message> {
        let message_type = MessageType::try_from(wire.message_type)?;

        let record = match wire.record {
            Some(record) => {
                let key = Key::new(record.key.into_vec());
                let mut decoded = Record::new(key, record.value.into_vec());
                decoded.expires = record.expires.parse().ok();
                Some(decoded)
            }
            None => None,
        };

        Ok(Message {
            message_type,
            key: Key::new(wire.key.into_vec()),
            record,
            closer_peers: decode_peers(wire.closer_peers)?,
            provider_peers: decode_peers(wire.provider_peers)?,
        })
    }
}

fn decode_peers(entries: Vec<WirePeerEntry>) -> Result<Vec<Peer>> {
    entries
        .into_iter()
        .map(|entry| {
            let id = PeerId::from_bytes(entry.id)?;
            let addresses = entry.addresses.into_iter().map(Multiaddr::new).collect();

            Ok(Peer {
                info: PeerInfo::new(id, addresses),
                connectedness: entry.connectedness.into(),
            })
        })
        .collect()
}
