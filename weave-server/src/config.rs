//! Environment overlay for the server configuration.
//!
//! Every setting has a default in [`ServerConfig`]; a `WEAVE_*` variable
//! replaces it when present and well-formed. Malformed values are logged
//! and ignored.

use std::str::FromStr;
use weave_collab::ServerConfig;

pub const ENV_BIND_ADDR: &str = "WEAVE_BIND_ADDR";
pub const ENV_BROADCAST_CAPACITY: &str = "WEAVE_BROADCAST_CAPACITY";
pub const ENV_OUTBOX_CAPACITY: &str = "WEAVE_OUTBOX_CAPACITY";
pub const ENV_MAX_OUT_DEGREE: &str = "WEAVE_MAX_OUT_DEGREE";
pub const ENV_FANOUT_CHANNEL: &str = "WEAVE_FANOUT_CHANNEL";
pub const ENV_LEGACY_EVENTS: &str = "WEAVE_LEGACY_EVENTS";
pub const ENV_PUBLISH_RETRIES: &str = "WEAVE_PUBLISH_RETRIES";
pub const ENV_TOKENS: &str = "WEAVE_TOKENS";

/// Everything the binary needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerConfig,
    /// `token:userId:username` entries, comma separated.
    pub tokens: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut server = ServerConfig::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR).filter(|v| !v.trim().is_empty()) {
            server.bind_addr = addr.trim().to_string();
        }
        overlay(&lookup, ENV_BROADCAST_CAPACITY, &mut server.broadcast_capacity);
        overlay(&lookup, ENV_OUTBOX_CAPACITY, &mut server.outbox_capacity);
        overlay(&lookup, ENV_MAX_OUT_DEGREE, &mut server.max_out_degree);
        overlay(&lookup, ENV_PUBLISH_RETRIES, &mut server.publish_retries);
        if let Some(channel) = lookup(ENV_FANOUT_CHANNEL).filter(|v| !v.trim().is_empty()) {
            server.fanout_channel = channel.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_LEGACY_EVENTS) {
            match parse_flag(&raw) {
                Some(flag) => server.emit_legacy_aliases = flag,
                None => log::warn!("Ignoring {ENV_LEGACY_EVENTS}={raw:?}: expected true or false"),
            }
        }
        // Zero-capacity channels cannot be created.
        server.broadcast_capacity = server.broadcast_capacity.max(1);
        server.outbox_capacity = server.outbox_capacity.max(1);

        Self {
            server,
            tokens: lookup(ENV_TOKENS).unwrap_or_default(),
        }
    }
}

fn overlay<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring {key}={raw:?}: not a valid number"),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let s = settings(&[]);
        assert_eq!(s.server, ServerConfig::default());
        assert!(s.tokens.is_empty());
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            (ENV_BIND_ADDR, "0.0.0.0:8000"),
            (ENV_BROADCAST_CAPACITY, "32"),
            (ENV_OUTBOX_CAPACITY, " 64 "),
            (ENV_MAX_OUT_DEGREE, "4"),
            (ENV_FANOUT_CHANNEL, "weave:test"),
            (ENV_LEGACY_EVENTS, "off"),
            (ENV_PUBLISH_RETRIES, "0"),
            (ENV_TOKENS, "t1:alice:Alice"),
        ]);
        assert_eq!(s.server.bind_addr, "0.0.0.0:8000");
        assert_eq!(s.server.broadcast_capacity, 32);
        assert_eq!(s.server.outbox_capacity, 64);
        assert_eq!(s.server.max_out_degree, 4);
        assert_eq!(s.server.fanout_channel, "weave:test");
        assert!(!s.server.emit_legacy_aliases);
        assert_eq!(s.server.publish_retries, 0);
        assert_eq!(s.tokens, "t1:alice:Alice");
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let s = settings(&[
            (ENV_BROADCAST_CAPACITY, "lots"),
            (ENV_MAX_OUT_DEGREE, "-3"),
            (ENV_LEGACY_EVENTS, "maybe"),
            (ENV_BIND_ADDR, "  "),
        ]);
        assert_eq!(s.server, ServerConfig::default());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let s = settings(&[(ENV_BROADCAST_CAPACITY, "0"), (ENV_OUTBOX_CAPACITY, "0")]);
        assert_eq!(s.server.broadcast_capacity, 1);
        assert_eq!(s.server.outbox_capacity, 1);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("no"), Some(false));
        assert_eq!(parse_flag(""), None);
    }
}
