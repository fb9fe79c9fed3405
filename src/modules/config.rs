//! Environment-driven settings for the KAS server.

use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::header::ResourceLocator;
use crate::session_manager::{
    SessionManagerConfig, DEFAULT_FIRST_PLAY_RETENTION, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_MISSED_HEARTBEATS,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    /// Generated at startup when unset
    pub kas_key_path: Option<String>,
    /// When set, only headers addressed to this KAS are rewrapped
    pub kas_url: Option<ResourceLocator>,
    /// Policy tokens are not signature-checked when unset
    pub oauth_public_key_path: Option<String>,
    pub enable_timing_logs: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_missed_heartbeats: u32,
    pub default_max_concurrent_streams: u32,
    pub first_play_retention: Duration,
}

impl ServerSettings {
    pub fn session_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            max_missed_heartbeats: self.max_missed_heartbeats,
            default_max_concurrent_streams: self.default_max_concurrent_streams,
            first_play_retention: self.first_play_retention,
        }
    }
}

pub fn load_config() -> Result<ServerSettings, ConfigError> {
    load_config_from(|name| env::var(name).ok())
}

/// Same as [`load_config`] with an injectable lookup.
pub fn load_config_from<F>(lookup: F) -> Result<ServerSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let port: u16 = parse_or(&lookup, "PORT", 8080)?;
    let tls_cert = lookup("TLS_CERT_PATH");
    let heartbeat_interval_secs: u64 = parse_or(
        &lookup,
        "HEARTBEAT_INTERVAL_SECS",
        DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
    )?;
    if heartbeat_interval_secs == 0 {
        return Err(ConfigError::InvalidValue {
            name: "HEARTBEAT_INTERVAL_SECS",
            value: "0".to_string(),
        });
    }

    let kas_url = match lookup("KAS_URL") {
        Some(url) => Some(
            ResourceLocator::parse(url.trim())
                .map_err(|_| ConfigError::InvalidValue { name: "KAS_URL", value: url })?,
        ),
        None => None,
    };

    Ok(ServerSettings {
        port,
        tls_enabled: tls_cert.is_some(),
        tls_cert_path: tls_cert.unwrap_or_else(|| "fullchain.pem".to_string()),
        tls_key_path: lookup("TLS_KEY_PATH").unwrap_or_else(|| "privkey.pem".to_string()),
        kas_key_path: lookup("KAS_KEY_PATH"),
        kas_url,
        oauth_public_key_path: lookup("OAUTH_PUBLIC_KEY_PATH"),
        enable_timing_logs: lookup("ENABLE_TIMING_LOGS")
            .map(|v| v.parse().unwrap_or(false))
            .unwrap_or(false),
        heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
        heartbeat_timeout: Duration::from_secs(parse_or(
            &lookup,
            "HEARTBEAT_TIMEOUT_SECS",
            DEFAULT_HEARTBEAT_TIMEOUT.as_secs(),
        )?),
        max_missed_heartbeats: parse_or(&lookup, "MAX_MISSED_HEARTBEATS", DEFAULT_MAX_MISSED_HEARTBEATS)?,
        default_max_concurrent_streams: parse_or(
            &lookup,
            "DEFAULT_MAX_CONCURRENT_STREAMS",
            DEFAULT_MAX_CONCURRENT_STREAMS,
        )?,
        first_play_retention: Duration::from_secs(parse_or(
            &lookup,
            "FIRST_PLAY_RETENTION_SECS",
            DEFAULT_FIRST_PLAY_RETENTION.as_secs(),
        )?),
    })
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}
