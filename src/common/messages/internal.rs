use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct WireMessage {
    #[serde(rename = "y")]
    pub message_type: u8,

    #[serde(rename = "k", with = "serde_bytes")]
    pub key: ByteBuf,

    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub record: Option<WireRecord>,

    #[serde(rename = "cp", default, skip_serializing_if = "Vec::is_empty")]
    pub closer_peers: Vec<WirePeerEntry>,

    #[serde(rename = "pp", default, skip_serializing_if = "Vec::is_empty")]
    pub provider_peers: Vec<WirePeerEntry>,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct WireRecord {
    #[serde(rename = "k", with = "serde_bytes")]
    pub key: ByteBuf,

    #[serde(rename = "v", with = "serde_bytes")]
    pub value: ByteBuf,

    /// Expiry as unix seconds rendered to a string; empty means no expiry.
    #[serde(rename = "e")]
    pub expires: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct WirePeerEntry {
    #[serde(rename = "id", with = "serde_bytes")]
    pub id: ByteBuf,

    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(rename = "c")]
    pub connectedness: u8,
}
