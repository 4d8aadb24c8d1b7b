//! Proxy configuration.

use serde::{Deserialize, Serialize};

use crate::connection::{Platform, SessionInfo};
use crate::crypto::{INTEGRITY_SESSION_GENERATION, INTEGRITY_STATIC_GENERATION};

/// Runtime proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address for game clients
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Real game server address
    pub upstream_addr: String,
    /// Real game server port
    pub upstream_port: u16,
    /// Protocol generation number
    pub generation: u32,
    /// Major client version
    pub major: u16,
    /// Minor client version
    pub minor: u16,
    /// Client platform
    pub platform: Platform,
    /// Integrity tag seed for generations that ship it in configuration
    pub integrity_seed: Option<Vec<u8>>,
    /// Close instead of silently dropping malformed handshake datagrams
    pub close_on_bad_handshake: bool,
    /// Directory holding the opcode map and message definitions
    pub data_dir: Option<String>,
}

impl ProxyConfig {
    /// Create a configuration with current-generation defaults.
    pub fn new(
        listen_addr: impl Into<String>,
        listen_port: u16,
        upstream_addr: impl Into<String>,
        upstream_port: u16,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            upstream_addr: upstream_addr.into(),
            upstream_port,
            generation: INTEGRITY_SESSION_GENERATION,
            major: 0,
            minor: 0,
            platform: Platform::Pc,
            integrity_seed: None,
            close_on_bad_handshake: false,
            data_dir: None,
        }
    }

    /// Session metadata for new connections.
    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            generation: self.generation,
            major: self.major,
            minor: self.minor,
            platform: self.platform,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr cannot be empty".into());
        }
        if self.upstream_addr.is_empty() {
            return Err("upstream_addr cannot be empty".into());
        }
        if (INTEGRITY_STATIC_GENERATION..INTEGRITY_SESSION_GENERATION).contains(&self.generation)
            && self.integrity_seed.is_none()
        {
            return Err(format!(
                "generation {} requires integrity_seed in configuration",
                self.generation
            ));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    /// Listen address for game clients
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Real game server address
    pub upstream_addr: String,
    /// Real game server port
    pub upstream_port: u16,
    /// Protocol generation number
    pub generation: u32,
    /// Major client version
    pub major: u16,
    /// Minor client version
    pub minor: u16,
    /// Client platform: "pc" or "console"
    pub platform: String,
    /// Integrity tag seed (hex), for generations that need one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity_seed_hex: Option<String>,
    /// Close instead of silently dropping malformed handshake datagrams
    pub close_on_bad_handshake: bool,
    /// Directory holding the opcode map and message definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl ProxyConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ProxyConfig, String> {
        let platform = match self.platform.as_str() {
            "pc" => Platform::Pc,
            "console" => Platform::Console,
            other => return Err(format!("unknown platform: {}", other)),
        };

        let integrity_seed = match &self.integrity_seed_hex {
            Some(hex_seed) => {
                Some(hex::decode(hex_seed).map_err(|e| format!("invalid hex seed: {}", e))?)
            }
            None => None,
        };

        Ok(ProxyConfig {
            listen_addr: self.listen_addr.clone(),
            listen_port: self.listen_port,
            upstream_addr: self.upstream_addr.clone(),
            upstream_port: self.upstream_port,
            generation: self.generation,
            major: self.major,
            minor: self.minor,
            platform,
            integrity_seed,
            close_on_bad_handshake: self.close_on_bad_handshake,
            data_dir: self.data_dir.clone(),
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            upstream_addr: config.upstream_addr.clone(),
            upstream_port: config.upstream_port,
            generation: config.generation,
            major: config.major,
            minor: config.minor,
            platform: match config.platform {
                Platform::Pc => "pc".to_string(),
                Platform::Console => "console".to_string(),
            },
            integrity_seed_hex: config.integrity_seed.as_ref().map(hex::encode),
            close_on_bad_handshake: config.close_on_bad_handshake,
            data_dir: config.data_dir.clone(),
        }
    }
}
