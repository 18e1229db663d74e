//! Configuration management for sealvault

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default lifetime of a shareable link: 1 hour
pub const DEFAULT_LINK_TTL_SECS: u64 = 60 * 60;

/// Longest accepted link lifetime: 1 year
pub const MAX_LINK_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Default private key file name
pub const DEFAULT_PRIVATE_KEY_FILE: &str = "server_private.pem";

/// Default public key file name
pub const DEFAULT_PUBLIC_KEY_FILE: &str = "server_public.pem";

/// Default master key file name
pub const DEFAULT_MASTER_KEY_FILE: &str = "server_aes.key";

/// Locations of the persisted server key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// RSA private key (PEM)
    pub private_key_path: PathBuf,

    /// RSA public key (PEM)
    pub public_key_path: PathBuf,

    /// Raw 32-byte AES master key
    pub master_key_path: PathBuf,
}

/// Record and blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory
    pub database_path: PathBuf,

    /// Directory holding encrypted blobs
    pub blob_dir: PathBuf,
}

/// Shareable link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingConfig {
    /// Lifetime of a newly issued link, in seconds
    #[serde(default = "default_link_ttl")]
    pub link_ttl_secs: u64,
}

fn default_link_ttl() -> u64 {
    DEFAULT_LINK_TTL_SECS
}

impl Default for SharingConfig {
    fn default() -> Self {
        SharingConfig {
            link_ttl_secs: DEFAULT_LINK_TTL_SECS,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server key material
    pub keys: KeyConfig,

    /// Storage locations
    pub storage: StorageConfig,

    /// Link sharing
    #[serde(default)]
    pub sharing: SharingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sealvault");
        Config::with_data_dir(data_dir)
    }
}

impl Config {
    /// Default layout rooted at `data_dir`
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let key_dir = data_dir.join("keys");

        Config {
            keys: KeyConfig {
                private_key_path: key_dir.join(DEFAULT_PRIVATE_KEY_FILE),
                public_key_path: key_dir.join(DEFAULT_PUBLIC_KEY_FILE),
                master_key_path: key_dir.join(DEFAULT_MASTER_KEY_FILE),
            },
            storage: StorageConfig {
                database_path: data_dir.join("db"),
                blob_dir: data_dir.join("encrypted_files"),
            },
            sharing: SharingConfig::default(),
            logging: LoggingConfig::default(),
            data_dir,
        }
    }

    /// Load configuration from a file (YAML or JSON), with environment variable
    /// substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content)?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Substitute environment variables in config content.
    /// Supports ${VAR_NAME} syntax; unset variables are left as written.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let substituted = re.replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        });

        Ok(substituted.into_owned())
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = env_path("SEALVAULT_DATA_DIR") {
            let mut relocated = Config::with_data_dir(dir);
            relocated.sharing = self.sharing.clone();
            relocated.logging = self.logging.clone();
            *self = relocated;
        }

        if let Ok(ttl) = std::env::var("SEALVAULT_LINK_TTL_SECS") {
            self.sharing.link_ttl_secs = ttl.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("Invalid SEALVAULT_LINK_TTL_SECS: {}", ttl))
            })?;
        }

        if let Some(path) = env_path("SEALVAULT_PRIVATE_KEY") {
            self.keys.private_key_path = path;
        }

        if let Some(path) = env_path("SEALVAULT_PUBLIC_KEY") {
            self.keys.public_key_path = path;
        }

        if let Some(path) = env_path("SEALVAULT_MASTER_KEY") {
            self.keys.master_key_path = path;
        }

        Ok(())
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sharing.link_ttl_secs == 0 {
            return Err(Error::InvalidConfig(
                "Link TTL must be greater than 0".to_string(),
            ));
        }

        if self.sharing.link_ttl_secs > MAX_LINK_TTL_SECS {
            return Err(Error::InvalidConfig(format!(
                "Link TTL must not exceed {} seconds",
                MAX_LINK_TTL_SECS
            )));
        }

        let paths = [
            ("keys.private_key_path", &self.keys.private_key_path),
            ("keys.public_key_path", &self.keys.public_key_path),
            ("keys.master_key_path", &self.keys.master_key_path),
            ("storage.database_path", &self.storage.database_path),
            ("storage.blob_dir", &self.storage.blob_dir),
        ];
        for (name, path) in &paths {
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(format!("{} is required", name)));
            }
        }

        let keys = &self.keys;
        if keys.private_key_path == keys.public_key_path
            || keys.private_key_path == keys.master_key_path
            || keys.public_key_path == keys.master_key_path
        {
            return Err(Error::InvalidConfig(
                "Key files must use distinct paths".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.storage.blob_dir)?;

        for path in [
            &self.keys.private_key_path,
            &self.keys.public_key_path,
            &self.keys.master_key_path,
            &self.storage.database_path,
        ] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }

    /// Link lifetime as a chrono duration
    pub fn link_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sharing.link_ttl_secs.min(MAX_LINK_TTL_SECS) as i64)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
