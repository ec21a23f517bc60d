use std::time::Duration;

use tracing::warn;

use huddle_shared::constants::{
    DEFAULT_ICE_CANDIDATE_POOL_SIZE, DEFAULT_ICE_SERVERS, DEFAULT_LIVENESS_TIMEOUT_MS,
    DEFAULT_MAX_TRANSCRIPT_LEN, DEFAULT_MEDIA_TIMEOUT_MS,
};

/// How locally gathered ICE candidates are shipped to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceMode {
    /// One `ice_candidate` signal per discovered candidate
    Trickle,
    /// A single `ice_batch` once gathering completes
    Batch,
}

/// Session shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Full mesh, one link per remote member
    Mesh,
    /// Exactly one remote peer; losing it ends the session
    Call,
}

/// Tunables of a [`ConnectionManager`](crate::manager::ConnectionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    pub ice_candidate_pool_size: u8,
    pub liveness_timeout: Duration,
    pub ice_mode: IceMode,
    pub topology: Topology,
    pub max_transcript_len: usize,
    pub media_timeout: Duration,
    pub join_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            ice_candidate_pool_size: DEFAULT_ICE_CANDIDATE_POOL_SIZE,
            liveness_timeout: Duration::from_millis(DEFAULT_LIVENESS_TIMEOUT_MS),
            ice_mode: IceMode::Trickle,
            topology: Topology::Mesh,
            max_transcript_len: DEFAULT_MAX_TRANSCRIPT_LEN,
            media_timeout: Duration::from_millis(DEFAULT_MEDIA_TIMEOUT_MS),
            join_retries: 1,
        }
    }
}

impl SessionConfig {
    /// Load from `HUDDLE_*` environment variables. Unparseable values are
    /// logged and the default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(servers) = lookup("HUDDLE_ICE_SERVERS") {
            let servers: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if servers.is_empty() {
                warn!("HUDDLE_ICE_SERVERS is empty, keeping defaults");
            } else {
                config.ice_servers = servers;
            }
        }

        parse_into(&lookup, "HUDDLE_ICE_POOL_SIZE", &mut config.ice_candidate_pool_size);
        parse_into(&lookup, "HUDDLE_MAX_TRANSCRIPT", &mut config.max_transcript_len);
        parse_into(&lookup, "HUDDLE_JOIN_RETRIES", &mut config.join_retries);

        let mut liveness_ms = config.liveness_timeout.as_millis() as u64;
        parse_into(&lookup, "HUDDLE_LIVENESS_MS", &mut liveness_ms);
        config.liveness_timeout = Duration::from_millis(liveness_ms);

        let mut media_ms = config.media_timeout.as_millis() as u64;
        parse_into(&lookup, "HUDDLE_MEDIA_TIMEOUT_MS", &mut media_ms);
        config.media_timeout = Duration::from_millis(media_ms);

        if let Some(mode) = lookup("HUDDLE_ICE_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "trickle" => config.ice_mode = IceMode::Trickle,
                "batch" => config.ice_mode = IceMode::Batch,
                other => warn!(value = %other, "Unknown HUDDLE_ICE_MODE, keeping trickle"),
            }
        }

        if let Some(topology) = lookup("HUDDLE_TOPOLOGY") {
            match topology.to_ascii_lowercase().as_str() {
                "mesh" => config.topology = Topology::Mesh,
                "call" => config.topology = Topology::Call,
                other => warn!(value = %other, "Unknown HUDDLE_TOPOLOGY, keeping mesh"),
            }
        }

        config
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = %raw, "Invalid value, keeping default"),
        }
    }
}
