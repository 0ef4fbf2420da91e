use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// File name looked up inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One reachability-assist server handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    fn has_credentials(&self) -> bool {
        self.username.is_some() && self.credential.is_some()
    }

    /// Prefix bare `host:port` URLs with a scheme; credentialed entries are TURN.
    fn with_schemes(mut self) -> Self {
        let scheme = if self.has_credentials() { "turn:" } else { "stun:" };
        for url in self.urls.iter_mut() {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|s| url.starts_with(s));
            if !known {
                *url = format!("{}{}", scheme, url);
            }
        }
        self
    }
}

/// Engine configuration, loaded from `config.json` in the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Relay key under which every session record lives.
    pub sessions_root: String,
    /// How long an incoming call rings before it is declined.
    pub ring_timeout_secs: u64,
    /// How long an established negotiation may take to carry media.
    pub connect_timeout_secs: u64,
    /// How long a dropped connection may take to recover.
    pub disconnect_grace_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN)],
            sessions_root: "calls".to_string(),
            ring_timeout_secs: 45,
            connect_timeout_secs: 30,
            disconnect_grace_secs: 10,
        }
    }
}

impl CallConfig {
    /// Load `config.json` from `data_dir`. A missing file yields the defaults.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                info!("Loading call config from {:?}", path);
                serde_json::from_str::<CallConfig>(&raw)
                    .map_err(|source| ConfigError::Parse { path: path.clone(), source })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {:?}, using defaults", path);
                CallConfig::default()
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    pub fn normalized(mut self) -> Self {
        self.ice_servers = self
            .ice_servers
            .into_iter()
            .map(IceServerConfig::with_schemes)
            .collect();
        self.sessions_root = self.sessions_root.trim_matches('/').to_string();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ice_servers.is_empty() {
            return Err(ConfigError::Invalid("at least one ICE server is required".into()));
        }
        for server in &self.ice_servers {
            if server.urls.iter().any(|u| u.trim().is_empty()) || server.urls.is_empty() {
                return Err(ConfigError::Invalid("ICE server URL cannot be empty".into()));
            }
            let is_turn = server.urls.iter().any(|u| u.starts_with("turn"));
            if is_turn && !server.has_credentials() {
                return Err(ConfigError::Invalid(
                    "TURN servers require username and credential".into(),
                ));
            }
        }
        if self.sessions_root.is_empty() {
            return Err(ConfigError::Invalid("sessions_root cannot be empty".into()));
        }
        if self.ring_timeout_secs == 0 || self.connect_timeout_secs == 0 || self.disconnect_grace_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

/// Resolve the data directory: explicit override, else the platform default.
pub fn data_dir(custom_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = custom_dir {
        dir.to_path_buf()
    } else {
        ProjectDirs::from("com", "peercall", "PeerCall")
            .map(|p| p.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".peercall"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CallConfig::load(dir.path()).unwrap();
        assert_eq!(config, CallConfig::default());
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN.to_string()]);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "ring_timeout_secs": 5, "ice_servers": [{ "urls": ["stun.example.org:3478"] }] }"#,
        )
        .unwrap();

        let config = CallConfig::load(dir.path()).unwrap();
        assert_eq!(config.ring_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
    }

    #[test]
    fn credentialed_bare_url_becomes_turn() {
        let server = IceServerConfig {
            urls: vec!["relay.example.org:3478".into()],
            username: Some("u".into()),
            credential: Some("p".into()),
        }
        .with_schemes();
        assert_eq!(server.urls, vec!["turn:relay.example.org:3478".to_string()]);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let config = CallConfig {
            ice_servers: vec![IceServerConfig::stun("turn:relay.example.org")],
            ..CallConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = CallConfig {
            ring_timeout_secs: 0,
            ..CallConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn garbage_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(CallConfig::load(dir.path()), Err(ConfigError::Parse { .. })));
    }
}
