//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use tether_core::ProtocolConfig;

/// Endpoint configuration. File: ~/.config/tether/config.toml or /etc/tether/config.toml.
/// Env overrides: TETHER_HOST, TETHER_PORT, TETHER_HEADER_SIZE, TETHER_MAX_FRAME_LEN,
/// TETHER_HEARTBEAT_INTERVAL_MS, TETHER_SWEEP_INTERVAL_MS, TETHER_STALE_AFTER_MS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server address the client connects to (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// Server listen port and client target port (default 6666).
    #[serde(default = "default_port")]
    pub port: u16,
    /// `[protocol]` table.
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6666
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_overrides(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `TETHER_*` overrides from `var`. Unparseable values are ignored with a warning.
pub fn apply_overrides(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(h) = var("TETHER_HOST") {
        c.host = h;
    }
    set_parsed(&var, "TETHER_PORT", &mut c.port);
    set_parsed(&var, "TETHER_HEADER_SIZE", &mut c.protocol.header_size);
    set_parsed(&var, "TETHER_MAX_FRAME_LEN", &mut c.protocol.max_frame_len);
    set_parsed(&var, "TETHER_HEARTBEAT_INTERVAL_MS", &mut c.protocol.heartbeat_interval_ms);
    set_parsed(&var, "TETHER_SWEEP_INTERVAL_MS", &mut c.protocol.sweep_interval_ms);
    set_parsed(&var, "TETHER_STALE_AFTER_MS", &mut c.protocol.stale_after_ms);
}

fn set_parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(s) = var(key) {
        match s.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %s, "ignoring unparseable override"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tether/config.toml"));
    }
    out.push(PathBuf::from("/etc/tether/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}
