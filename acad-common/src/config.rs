//! Configuration loading and root folder resolution
//!
//! Resolution order for every setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is not an error; the compiled defaults apply.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "ACAD_ROOT_FOLDER";

/// Environment variable pointing at an explicit config file
pub const CONFIG_FILE_ENV: &str = "ACAD_CONFIG";

const RELATIONAL_DB_FILE: &str = "records.db";
const CACHE_DB_FILE: &str = "cache.db";

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Folder holding both databases
    pub root_folder: PathBuf,
    /// Minimum spacing between two accepted realtime updates
    pub throttle_ms: u64,
    /// Realtime pushes arriving this soon after a local write are ignored
    pub write_grace_ms: u64,
    /// Delay before the loader's single automatic retry
    pub retry_delay_ms: u64,
    /// How long a quota-triggered realtime disable stays in effect
    pub quota_cooldown_secs: u64,
    /// Event bus channel capacity
    pub event_capacity: usize,
    /// Pending cache writes accepted before submitters wait
    pub write_queue_depth: usize,
    /// Domain used when an imported student has no usable email
    pub student_email_domain: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_folder: default_root_folder(),
            throttle_ms: 2000,
            write_grace_ms: 1500,
            retry_delay_ms: 1500,
            quota_cooldown_secs: 3600,
            event_capacity: 256,
            write_queue_depth: 64,
            student_email_domain: "students.example.edu".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration following the documented priority order
    ///
    /// `cli_config` names an explicit TOML file; when given it must exist.
    /// `cli_root` overrides the root folder from every other source.
    pub fn load(cli_config: Option<&Path>, cli_root: Option<&Path>) -> Result<Self> {
        let mut config = match config_file_path(cli_config)? {
            Some(path) => {
                debug!(path = %path.display(), "Loading config file");
                let content = std::fs::read_to_string(&path)?;
                Self::from_toml_str(&content)?
            }
            None => {
                warn!("No config file found, using compiled defaults");
                Self::default()
            }
        };

        config.root_folder = resolve_root_folder(cli_root, ROOT_FOLDER_ENV, &config.root_folder);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; absent keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str::<SyncConfig>(content)
            .map_err(|e| Error::Config(format!("Invalid config file: {}", e)))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be positive".to_string()));
        }
        if self.write_queue_depth == 0 {
            return Err(Error::Config(
                "write_queue_depth must be positive".to_string(),
            ));
        }
        if self.student_email_domain.trim().is_empty() || self.student_email_domain.contains('@')
        {
            return Err(Error::Config(format!(
                "student_email_domain is not a domain: {:?}",
                self.student_email_domain
            )));
        }
        Ok(())
    }

    pub fn relational_db_path(&self) -> PathBuf {
        self.root_folder.join(RELATIONAL_DB_FILE)
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.root_folder.join(CACHE_DB_FILE)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn write_grace(&self) -> Duration {
        Duration::from_millis(self.write_grace_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.quota_cooldown_secs)
    }
}

/// Root folder resolution: CLI argument, then environment, then the value
/// the config file (or the compiled default) supplied.
pub fn resolve_root_folder(cli_arg: Option<&Path>, env_var_name: &str, configured: &Path) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    configured.to_path_buf()
}

/// Locate the config file: explicit argument, `ACAD_CONFIG`, then the
/// platform locations. `Ok(None)` when nothing exists.
fn config_file_path(cli_config: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = cli_config {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(Some(path));
        }
        warn!(path = %path.display(), "{} points at a missing file", CONFIG_FILE_ENV);
    }

    let user_config = dirs::config_dir().map(|d| d.join("acad").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/acad/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }
    }

    Ok(None)
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("acad"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/acad"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("acad"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/acad"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("acad"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\acad"))
    } else {
        PathBuf::from("./acad_data")
    }
}
