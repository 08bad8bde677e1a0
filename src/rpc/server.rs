//! Inbound message dispatcher: the six request handlers.

use tracing::{debug, warn};

use crate::common::messages::{Message, MessageType, Peer};
use crate::common::{now_unix, Connectedness, Key, NodeId, PeerId, PeerInfo};
use crate::host::TTL_DAY;

use super::sessions::SessionId;
use super::KademliaNode;

impl KademliaNode {
    /// Route one decoded inbound request to its handler.
    ///
    /// Unknown message types never get here; the session layer rejects them
    /// at decode time and closes the stream.
    pub(crate) fn handle_request(&mut self, session: SessionId, peer: PeerId, message: Message) {
        match message.message_type {
            MessageType::Ping => self.on_ping(session, message),
            MessageType::PutValue => self.on_put_value(session, message),
            MessageType::GetValue => self.on_get_value(session, message),
            MessageType::AddProvider => self.on_add_provider(session, peer, message),
            MessageType::GetProviders => self.on_get_providers(session, message),
            MessageType::FindNode => self.on_find_node(session, message),
        }
    }

    /// Ping: echo the cleared message.
    fn on_ping(&mut self, session: SessionId, mut message: Message) {
        message.clear();

        let _ = self.sessions.respond(session, &message);
    }

    /// PutValue: validate and store; the acknowledgement is the stream
    /// close. Validation failures are silent to the remote.
    fn on_put_value(&mut self, session: SessionId, message: Message) {
        let Some(record) = message.record else {
            warn!("incoming PutValue failed: no record in message");
            return;
        };

        let key = record.key.clone();
        debug!(?key, "MSG: PutValue");

        if let Err(error) = self.store_record(record) {
            warn!(?key, "incoming PutValue failed: {error}");
            return;
        }

        self.sessions.close(session);
    }

    /// GetValue: answer with the local record (if fresh) and the known
    /// providers for the key.
    fn on_get_value(&mut self, session: SessionId, message: Message) {
        if message.key.is_empty() {
            warn!("incoming GetValue failed: empty key in message");
            return;
        }

        let key = message.key;
        debug!(?key, "MSG: GetValue");

        let mut response = Message::get_value(key.clone());
        response.provider_peers = self.enriched_providers(&key);

        if let Some(record) = self.storage.get_value(&key) {
            if !record.is_expired(now_unix()) {
                response.record = Some(record);
            }
        }

        let _ = self.sessions.respond(session, &response);
    }

    /// AddProvider: record providers that certified themselves as the
    /// remote peer of this session; anyone else is dropped.
    fn on_add_provider(&mut self, session: SessionId, peer: PeerId, message: Message) {
        if message.provider_peers.is_empty() {
            warn!("AddProvider failed: no provider peers in message");
            return;
        }

        if message.key.is_empty() {
            warn!("AddProvider failed: empty key in message");
            return;
        }

        let key = message.key;
        debug!(?key, "MSG: AddProvider");

        for provider in message.provider_peers {
            if provider.info.id == peer {
                self.providers.add_provider(&key, provider.info.id);
                self.add_peer(provider.info, false);
            } else {
                debug!(
                    claimed = ?provider.info.id,
                    remote = ?peer,
                    "AddProvider entry is not self-certified; ignored"
                );
            }
        }

        self.sessions.close(session);
    }

    /// GetProviders: known providers plus the nearest peers to the key,
    /// both enriched with connectedness.
    fn on_get_providers(&mut self, session: SessionId, message: Message) {
        if message.key.is_empty() {
            warn!("GetProviders failed: empty key in message");
            return;
        }

        let key = message.key;
        debug!(?key, "MSG: GetProviders");

        let mut response = Message::get_providers(key.clone());
        response.provider_peers = self.enriched_providers(&key);
        response.closer_peers = self.enriched_nearest(&NodeId::from_key(&key));

        let _ = self.sessions.respond(session, &response);
    }

    /// FindNode: nearest peers to the key's point. Peers the requester
    /// attached refresh the address repository and are then dropped; the
    /// information flows one way.
    fn on_find_node(&mut self, session: SessionId, message: Message) {
        for entry in &message.closer_peers {
            if entry.connectedness != Connectedness::CanNotConnect
                && !entry.info.addresses.is_empty()
            {
                self.host
                    .upsert_addresses(&entry.info.id, &entry.info.addresses, TTL_DAY);
            }
        }

        if message.key.is_empty() {
            warn!("FindNode failed: empty key in message");
            return;
        }

        let key = message.key;
        debug!(?key, "MSG: FindNode");

        let mut response = Message::find_node(key.clone());
        response.closer_peers = self.enriched_nearest(&NodeId::from_key(&key));

        let _ = self.sessions.respond(session, &response);
    }

    // === Private Methods ===

    /// Known providers for a key with addresses and connectedness attached,
    /// capped at the configured peer count.
    fn enriched_providers(&mut self, key: &Key) -> Vec<Peer> {
        let ids = self
            .providers
            .get_providers_for(key, self.config.closer_peer_count * 2);

        self.enrich(ids)
    }

    /// Nearest known peers to a target, enriched the same way.
    fn enriched_nearest(&mut self, target: &NodeId) -> Vec<Peer> {
        let ids = self
            .routing_table
            .nearest_peers(target, self.config.closer_peer_count * 2);

        self.enrich(ids)
    }

    fn enrich(&mut self, ids: Vec<PeerId>) -> Vec<Peer> {
        let mut peers = Vec::with_capacity(self.config.closer_peer_count);

        for id in ids {
            let info: PeerInfo = self.host.peer_info(&id);
            if info.addresses.is_empty() {
                continue;
            }

            let connectedness = self.host.connectedness(&info);
            peers.push(Peer::new(info, connectedness));

            if peers.len() >= self.config.closer_peer_count {
                break;
            }
        }

        peers
    }
}
