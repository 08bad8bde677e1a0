//! Key/value records stored in the DHT.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::common::Key;

#[derive(Clone, PartialEq, Eq, Debug)]
/// A stored key/value pair with an optional expiry timestamp.
///
/// Values are opaque; a [Validator](crate::storage::Validator) declares them
/// well-formed before any store accepts them.
pub struct Record {
    pub key: Key,
    pub value: Bytes,
    /// Unix seconds after which the record is no longer served.
    pub expires: Option<u64>,
}

impl Record {
    pub fn new<T: Into<Bytes>>(key: Key, value: T) -> Record {
        Record {
            key,
            value: value.into(),
            expires: None,
        }
    }

    pub fn with_expiry(mut self, expires: u64) -> Record {
        self.expires = Some(expires);
        self
    }

    /// Returns true if the record has an expiry in the past.
    pub fn is_expired(&self, now: u64) -> bool {
        match self.expires {
            Some(expires) => expires <= now,
            None => false,
        }
    }
}

/// Wall clock now, as unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
