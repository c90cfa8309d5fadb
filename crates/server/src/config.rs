//! Server configuration
//!
//! Loaded from a TOML file whose keys mirror the signaling clients'
//! camelCase convention. Every key has a default so a minimal config
//! only needs the addresses that differ per deployment.

use std::fs::read_to_string;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address local sockets bind to
    #[serde(default = "ServerConfig::default_ip")]
    pub ip: IpAddr,

    /// Address announced to subscribers in ICE candidates
    ///
    /// Behind NAT this is the public address; it is never used for
    /// binding.
    #[serde(default = "ServerConfig::default_announced_ip")]
    pub announced_ip: String,

    /// HTTP signaling listen port
    #[serde(default = "ServerConfig::default_signaling_port")]
    pub signaling_server_port: u16,

    /// Low end of the UDP port range scanned per subscriber
    #[serde(default = "ServerConfig::default_min_port")]
    pub webrtc_min_port: u16,

    /// High end of the UDP port range scanned per subscriber
    #[serde(default = "ServerConfig::default_max_port")]
    pub webrtc_max_port: u16,

    /// Replay the current GOP to joining subscribers
    #[serde(default)]
    pub enable_gop_cache: bool,
}

impl ServerConfig {
    fn default_ip() -> IpAddr {
        "0.0.0.0".parse().unwrap()
    }

    fn default_announced_ip() -> String {
        "127.0.0.1".to_string()
    }

    fn default_signaling_port() -> u16 {
        8000
    }

    fn default_min_port() -> u16 {
        40000
    }

    fn default_max_port() -> u16 {
        49999
    }

    /// Load and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read {}: {}", path.as_ref().display(), e)))?;
        let config: ServerConfig =
            toml::from_str(&text).map_err(|e| Error::Config(format!("parse: {}", e)))?;
        if config.webrtc_min_port > config.webrtc_max_port {
            return Err(Error::Config(format!(
                "webrtcMinPort {} above webrtcMaxPort {}",
                config.webrtc_min_port, config.webrtc_max_port
            )));
        }
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: Self::default_ip(),
            announced_ip: Self::default_announced_ip(),
            signaling_server_port: Self::default_signaling_port(),
            webrtc_min_port: Self::default_min_port(),
            webrtc_max_port: Self::default_max_port(),
            enable_gop_cache: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: ServerConfig = toml::from_str(
            r#"
            ip = "10.1.2.3"
            announcedIp = "203.0.113.9"
            signalingServerPort = 9000
            webrtcMinPort = 50000
            webrtcMaxPort = 50100
            enableGopCache = true
            "#,
        )
        .unwrap();
        assert_eq!(config.ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(config.announced_ip, "203.0.113.9");
        assert_eq!(config.signaling_server_port, 9000);
        assert_eq!(config.webrtc_min_port, 50000);
        assert_eq!(config.webrtc_max_port, 50100);
        assert!(config.enable_gop_cache);
    }

    #[test]
    fn test_defaults_apply() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.signaling_server_port, 8000);
        assert!(!config.enable_gop_cache);
    }
}
