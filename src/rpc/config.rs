use std::time::Duration;

use crate::providers::DEFAULT_PROVIDER_TTL;

/// Default stream protocol the node registers and dials.
pub const DEFAULT_PROTOCOL_ID: &str = "/ipfs/kad/1.0.0";

/// Default request timeout before abandoning an exchange with a
/// non-responding peer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Default deadline for a whole iterative query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
/// Node configuration.
pub struct Config {
    /// Stream protocol id registered with the host.
    ///
    /// Defaults to [DEFAULT_PROTOCOL_ID].
    pub protocol_id: String,
    /// K: cap on returned peer lists and on the best-k set of lookups.
    ///
    /// Defaults to 20.
    pub closer_peer_count: usize,
    /// α: parallel RPCs per iterative query.
    ///
    /// Defaults to 3.
    pub query_alpha: usize,
    /// Deadline for a whole iterative query.
    ///
    /// The longer this duration is, the longer a lookup may keep waiting on
    /// stragglers before reporting a timeout.
    pub query_timeout: Duration,
    /// Per-exchange timeout; also bounds session writes.
    pub request_timeout: Duration,
    /// Lifetime of provider records in the content routing table.
    pub provider_ttl: Duration,
    /// Random walk settings for routing table self-healing.
    pub random_walk: RandomWalkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            closer_peer_count: 20,
            query_alpha: 3,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            random_walk: RandomWalkConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
/// Random walk scheduling.
///
/// Each period issues `queries_per_period` walks spaced by `delay`; after the
/// last one the next walk waits out the rest of `interval`, so one full cycle
/// equals `interval`.
pub struct RandomWalkConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub delay: Duration,
    pub queries_per_period: u32,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5 * 60),
            delay: Duration::from_secs(10),
            queries_per_period: 1,
        }
    }
}
