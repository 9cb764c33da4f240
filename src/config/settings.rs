//! Settings file handling
//!
//! The settings file is JSON at the project root. An absent file is created
//! with defaults and reported as a configuration-required error so the
//! operator can fill in servers and paths before the next start.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default settings file name, resolved against the working directory
pub const SETTINGS_FILE: &str = "node-settings.json";

/// Node settings, mirroring the on-disk JSON schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Signaling servers tried in order on connect and reconnect
    pub signaling_servers: Vec<String>,

    /// WebRTC transport configuration
    pub webrtc: WebRtcConfig,

    /// Node identity, filled in after first sign-up
    pub info: NodeInfo,

    /// Storage paths offered to the network
    pub paths: Vec<StoragePathConfig>,
}

/// ICE server list handed to the WebRTC stack
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServerConfig>,
}

/// A single STUN/TURN server entry
///
/// `urls` accepts either one URL or a list, matching the settings files the
/// signaling service hands out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: IceUrls,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    Single(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            IceUrls::Single(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

/// Node credentials issued by the signaling service on sign-up
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub auth_token: String,
}

impl NodeInfo {
    /// Credentials are present once both fields are non-empty
    pub fn is_registered(&self) -> bool {
        !self.id.is_empty() && !self.auth_token.is_empty()
    }
}

/// One storage path and its usable-capacity threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePathConfig {
    pub path: PathBuf,
    /// Percent of the volume the node may use, 0..=100
    pub threshold: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            signaling_servers: vec![],
            webrtc: WebRtcConfig {
                ice_servers: vec![IceServerConfig {
                    urls: IceUrls::Single("stun:stun.l.google.com:19302".to_string()),
                    username: None,
                    credential: None,
                }],
            },
            info: NodeInfo::default(),
            paths: vec![],
        }
    }
}

impl Settings {
    /// Load settings from `path`, creating a default file when absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let defaults = Settings::default();
            defaults.save(path)?;
            return Err(ConfigError::ConfigurationRequired(
                path.display().to_string(),
            ));
        }

        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Persist settings, atomically replacing the previous file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_servers.is_empty() {
            return Err(ConfigError::Invalid(
                "no signaling servers configured".into(),
            ));
        }
        if self.paths.is_empty() {
            return Err(ConfigError::Invalid("no storage paths configured".into()));
        }
        for entry in &self.paths {
            if entry.threshold > 100 {
                return Err(ConfigError::Invalid(format!(
                    "threshold {} out of range for {}",
                    entry.threshold,
                    entry.path.display()
                )));
            }
            if !entry.path.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "storage path must be absolute: {}",
                    entry.path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_absent_file_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let result = Settings::load(&path);
        assert!(matches!(
            result,
            Err(ConfigError::ConfigurationRequired(_))
        ));
        // Defaults were written for the operator to edit
        assert!(path.exists());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let mut settings = Settings::default();
        settings.signaling_servers = vec!["http://localhost:3000".into()];
        settings.paths = vec![StoragePathConfig {
            path: dir.path().to_path_buf(),
            threshold: 80,
        }];
        settings.info = NodeInfo {
            id: "node-1".into(),
            auth_token: "secret".into(),
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.signaling_servers, settings.signaling_servers);
        assert_eq!(loaded.info.id, "node-1");
        assert!(loaded.info.is_registered());
        assert_eq!(loaded.paths[0].threshold, 80);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let mut settings = Settings::default();
        settings.signaling_servers = vec!["http://localhost:3000".into()];
        settings.paths = vec![StoragePathConfig {
            path: dir.path().to_path_buf(),
            threshold: 150,
        }];
        settings.save(&path).unwrap();

        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_ice_urls_single_or_many() {
        let single: IceServerConfig =
            serde_json::from_str(r#"{"urls": "stun:a.example:3478"}"#).unwrap();
        assert_eq!(single.urls.as_vec(), vec!["stun:a.example:3478"]);

        let many: IceServerConfig = serde_json::from_str(
            r#"{"urls": ["stun:a.example:3478", "turn:b.example:3478"], "username": "u", "credential": "c"}"#,
        )
        .unwrap();
        assert_eq!(many.urls.as_vec().len(), 2);
        assert_eq!(many.username.as_deref(), Some("u"));
    }
}
