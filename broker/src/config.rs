// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub general: General,
    pub mqtt: Mqtt,
    pub log: Log,
    pub storage: Storage,
}

#[derive(Debug, Deserialize, Clone)]
pub struct General {
    /// Address the broker listens for plain TCP connections on.
    pub listen_addr: String,
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Mqtt {
    /// Ceiling on a client's advertised keep-alive, in seconds. `0` disables
    /// the ceiling.
    pub max_keep_alive_secs: u16,
    pub allow_anonymous: bool,
    pub allow_empty_client_id: bool,
    /// Largest `Remaining Length` this broker accepts, capped at
    /// [`embermq_codec::MAX_REMAINING_LENGTH`].
    pub max_packet_size: u32,
    /// Per-session outbound queue length before the drop policy engages.
    pub max_queued_messages: usize,
    /// How long an inflight (unacknowledged) message is held before it is
    /// eligible to be dropped in favour of new traffic, in seconds. `0`
    /// means inflight messages never expire on their own.
    pub inflight_expiry_secs: u64,
    /// Session state is kept this long past a disconnect with no session
    /// expiry interval of its own (v3.1.1 clients, or v5 clients that send
    /// none), in seconds.
    pub default_session_expiry_secs: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    /// Reserved for a future on-disk session backend; the only backend
    /// implemented today is the in-memory one.
    pub persistence: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    pub level: LogLevel,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(Error::from)
    }

    #[must_use]
    pub fn default_toml() -> &'static str {
        r#"
[general]
listen_addr = "0.0.0.0:1883"
max_connections = 10000

[mqtt]
max_keep_alive_secs = 0
allow_anonymous = true
allow_empty_client_id = true
max_packet_size = 268435455
max_queued_messages = 1000
inflight_expiry_secs = 30
default_session_expiry_secs = 0

[log]
level = "info"

[storage]
persistence = false
"#
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str(Self::default_toml()).expect("default_toml() must parse")
    }
}

pub fn log_level_filter(level: LogLevel) -> log::LevelFilter {
    match level {
        LogLevel::Off => log::LevelFilter::Off,
        LogLevel::Error => log::LevelFilter::Error,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Trace => log::LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config = Config::default();
        assert_eq!(config.general.listen_addr, "0.0.0.0:1883");
        assert!(config.mqtt.allow_anonymous);
    }
}
