//! Call configuration loaded from environment variables.
//!
//! Every setting has a default so a client can place calls with zero
//! configuration.

use std::time::Duration;

use murmur_media::IceServerConfig;
use murmur_shared::constants::{
    AUTO_DECLINE_TIMEOUT_SECS, DEFAULT_HISTORY_LIMIT, DEFAULT_STUN_SERVER, RING_TIMEOUT_SECS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    /// How long an outgoing call rings before it is given up.
    /// Env: `MURMUR_RING_TIMEOUT_SECS`
    /// Default: 60 s
    pub ring_timeout: Duration,

    /// How long a surfaced incoming call waits for the user before it is
    /// declined automatically.
    /// Env: `MURMUR_AUTO_DECLINE_SECS`
    /// Default: 30 s
    pub auto_decline_timeout: Duration,

    /// STUN/TURN server URLs.
    /// Env: `MURMUR_ICE_SERVERS` (comma separated)
    /// Default: Google's public STUN server
    pub ice_urls: Vec<String>,

    /// Env: `MURMUR_TURN_USERNAME`
    pub turn_username: Option<String>,

    /// Env: `MURMUR_TURN_CREDENTIAL`
    pub turn_credential: Option<String>,

    /// Number of history entries handed to the UI.
    /// Env: `MURMUR_HISTORY_LIMIT`
    /// Default: 50
    pub history_limit: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(RING_TIMEOUT_SECS),
            auto_decline_timeout: Duration::from_secs(AUTO_DECLINE_TIMEOUT_SECS),
            ice_urls: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_username: None,
            turn_credential: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl CallConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(secs) = parse_secs(&var, "MURMUR_RING_TIMEOUT_SECS") {
            config.ring_timeout = secs;
        }

        if let Some(secs) = parse_secs(&var, "MURMUR_AUTO_DECLINE_SECS") {
            config.auto_decline_timeout = secs;
        }

        if let Some(list) = var("MURMUR_ICE_SERVERS") {
            let urls: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if urls.is_empty() {
                tracing::warn!(value = %list, "Empty MURMUR_ICE_SERVERS, using default");
            } else {
                config.ice_urls = urls;
            }
        }

        config.turn_username = var("MURMUR_TURN_USERNAME").filter(|v| !v.is_empty());
        config.turn_credential = var("MURMUR_TURN_CREDENTIAL").filter(|v| !v.is_empty());

        if let Some(val) = var("MURMUR_HISTORY_LIMIT") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.history_limit = n,
                _ => tracing::warn!(value = %val, "Invalid MURMUR_HISTORY_LIMIT, using default"),
            }
        }

        config
    }

    /// Server list for the transport. TURN credentials only go to `turn:`
    /// and `turns:` entries.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        self.ice_urls
            .iter()
            .map(|url| {
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                IceServerConfig {
                    urls: vec![url.clone()],
                    username: self.turn_username.clone().filter(|_| is_turn),
                    credential: self.turn_credential.clone().filter(|_| is_turn),
                }
            })
            .collect()
    }
}

fn parse_secs(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let val = var(key)?;
    match val.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(key, value = %val, "Invalid timeout, using default");
            None
        }
    }
}
