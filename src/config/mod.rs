//! Node Configuration Module
//!
//! Loads and persists the `node-settings.json` file that carries signaling
//! servers, ICE servers, node credentials, and storage paths.

mod settings;

pub use settings::{
    IceServerConfig, IceUrls, NodeInfo, Settings, StoragePathConfig, WebRtcConfig, SETTINGS_FILE,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("settings file created at {0}; fill in signaling servers and storage paths")]
    ConfigurationRequired(String),

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
