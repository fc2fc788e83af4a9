//! Agent configuration
//!
//! Loaded from an optional TOML file; command-line flags override it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::{is_valid_agent_id, parse_url, ClassifierConfig, ClassifyError};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid base URL: {0}")]
    BaseUrl(#[from] ClassifyError),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Identity rotation backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotatorKind {
    /// Operator switches location by hand
    #[default]
    Manual,
    NordVpn,
    ExpressVpn,
    ProtonVpn,
}

impl RotatorKind {
    /// Locations used when none are configured
    pub fn default_locations(self) -> Vec<String> {
        let names: &[&str] = match self {
            Self::ProtonVpn => &["CA", "US", "GB", "DE", "NL"],
            _ => &["Canada", "United States", "United Kingdom"],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::NordVpn => "nordvpn",
            Self::ExpressVpn => "expressvpn",
            Self::ProtonVpn => "protonvpn",
        }
    }
}

impl fmt::Display for RotatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity rotation settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub kind: RotatorKind,
    /// Round-robin location list; empty means the backend default
    pub locations: Vec<String>,
    /// ProtonVPN account
    pub email: Option<String>,
    pub password: Option<String>,
    /// Pause between disconnect and reconnect
    pub settle_pause_secs: u64,
    /// How long the manual backend waits for the operator
    pub manual_wait_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            kind: RotatorKind::Manual,
            locations: Vec::new(),
            email: None,
            password: None,
            settle_pause_secs: 2,
            manual_wait_secs: 10,
        }
    }
}

impl fmt::Debug for RotationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationConfig")
            .field("kind", &self.kind)
            .field("locations", &self.locations)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("settle_pause_secs", &self.settle_pause_secs)
            .field("manual_wait_secs", &self.manual_wait_secs)
            .finish()
    }
}

impl RotationConfig {
    /// Configured locations, or the backend's defaults
    pub fn effective_locations(&self) -> Vec<String> {
        if self.locations.is_empty() {
            self.kind.default_locations()
        } else {
            self.locations.clone()
        }
    }

    pub fn settle_pause(&self) -> Duration {
        Duration::from_secs(self.settle_pause_secs)
    }

    pub fn manual_wait(&self) -> Duration {
        Duration::from_secs(self.manual_wait_secs)
    }
}

/// Full agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Site root; also the default start URL
    pub base_url: String,
    /// Unique agent identifier
    pub agent_id: String,
    /// Where downloaded content and local progress live
    pub output_dir: PathBuf,
    /// Shared coordination record
    pub coordination_file: PathBuf,
    /// Background coordination sync period
    pub sync_interval_secs: u64,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Consecutive transport failures before rotating identity
    pub max_consecutive_errors: u32,
    /// Rotation attempts before giving up
    pub max_rotation_attempts: u32,
    /// Optional HTTP/SOCKS proxy for all requests
    pub proxy: Option<String>,
    pub rotation: RotationConfig,
    pub classifier: ClassifierConfig,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nrc.canada.ca".to_string(),
            agent_id: String::new(),
            output_dir: PathBuf::from("nrc_downloads_distributed"),
            coordination_file: PathBuf::from("distributed_coordination.json"),
            sync_interval_secs: 30,
            request_timeout_secs: 30,
            max_consecutive_errors: 3,
            max_rotation_attempts: 10,
            proxy: None,
            rotation: RotationConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl CrawlConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parsed base URL
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Ok(parse_url(&self.base_url)?)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Fingerprint index file for this agent
    pub fn fingerprint_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("fingerprints_{}.json", self.agent_id))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.is_empty() {
            return Err(ConfigError::Invalid("agent id is required".to_string()));
        }
        if !is_valid_agent_id(&self.agent_id) {
            return Err(ConfigError::Invalid(format!(
                "agent id {:?} may only contain letters, digits, '-', '_' and '.'",
                self.agent_id
            )));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync interval must be at least one second".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request timeout must be at least one second".to_string(),
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(ConfigError::Invalid(
                "max consecutive errors must be at least 1".to_string(),
            ));
        }
        self.base_url()?;
        Ok(())
    }
}
