//! Relay configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::str::FromStr;

use huddle_shared::constants::{DEFAULT_RELAY_PORT, MAX_SIGNAL_FRAME_BYTES};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address of the HTTP/WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Members allowed in one session (0 = unlimited).
    /// Env: `MAX_SESSION_MEMBERS`
    /// Default: `16`
    pub max_session_members: usize,

    /// Largest accepted WebSocket frame in bytes.
    /// Env: `MAX_FRAME_BYTES`
    /// Default: 64 KiB
    pub max_frame_bytes: usize,

    /// Sustained rate, per client IP for upgrades and per connection for frames.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `20`
    pub rate_limit_per_sec: f64,

    /// Bucket capacity for the same limits.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `60`
    pub rate_limit_burst: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_RELAY_PORT).into(),
            max_session_members: 16,
            max_frame_bytes: MAX_SIGNAL_FRAME_BYTES,
            rate_limit_per_sec: 20.0,
            rate_limit_burst: 60.0,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);
        parse_into(&lookup, "MAX_SESSION_MEMBERS", &mut config.max_session_members);
        parse_into(&lookup, "MAX_FRAME_BYTES", &mut config.max_frame_bytes);
        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly
        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid setting, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.max_session_members, 16);
        assert_eq!(config.max_frame_bytes, 64 * 1024);
    }

    #[test]
    fn test_env_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("MAX_SESSION_MEMBERS", "0"),
            ("RATE_LIMIT_BURST", "5"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.max_session_members, 0);
        assert_eq!(config.rate_limit_burst, 5.0);
    }

    #[test]
    fn test_invalid_value_keeps_default() {
        let config = RelayConfig::from_lookup(lookup(&[("HTTP_ADDR", "not an address")]));
        assert_eq!(config.http_addr, RelayConfig::default().http_addr);
    }
}
