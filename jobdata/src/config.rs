//! Configuration for the job history store.
//!
//! JOBDATA_DIR resolution order:
//! 1. Explicit path passed to Config::with_root()
//! 2. JOBDATA_DIR environment variable
//! 3. Default: platform data directory (~/.local/share/jobdata on Linux)

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Job history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Folder holding one history database per experiment.
    pub jobdata_dir: PathBuf,

    /// Seconds to wait before asking the scheduler for final accounting.
    #[serde(default = "default_accounting_settle_secs")]
    pub accounting_settle_secs: u64,

    /// Share of completed date/member jobs that must change at once
    /// before a status change batch is treated as a new run.
    #[serde(default = "default_rebaseline_ratio")]
    pub rebaseline_ratio: f64,
}

fn default_accounting_settle_secs() -> u64 {
    60
}

fn default_rebaseline_ratio() -> f64 {
    0.9
}

impl Config {
    /// Create a new config rooted at the given folder.
    pub fn with_root(jobdata_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobdata_dir: jobdata_dir.into(),
            accounting_settle_secs: default_accounting_settle_secs(),
            rebaseline_ratio: default_rebaseline_ratio(),
        }
    }

    /// Create a config using default JOBDATA_DIR resolution.
    pub fn default_location() -> Result<Self> {
        let root = resolve_jobdata_dir()?;
        Ok(Self::with_root(root))
    }

    /// Load config from JOBDATA_DIR/config.toml, or create default.
    pub fn load() -> Result<Self> {
        let root = resolve_jobdata_dir()?;
        Self::load_from(&root)
    }

    /// Load config from a specific folder.
    pub fn load_from(jobdata_dir: &Path) -> Result<Self> {
        let config_path = jobdata_dir.join("config.toml");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let mut config: Config = toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
            // The folder we loaded from wins over whatever the file says
            config.jobdata_dir = jobdata_dir.to_path_buf();
            Ok(config)
        } else {
            Ok(Self::with_root(jobdata_dir))
        }
    }

    /// Save config to JOBDATA_DIR/config.toml.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.jobdata_dir)?;
        let config_path = self.jobdata_dir.join("config.toml");
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_path, contents)?;
        Ok(())
    }

    /// Path to the history database of an experiment.
    pub fn db_path(&self, expid: &str) -> PathBuf {
        self.jobdata_dir.join(format!("job_data_{}.duckdb", expid))
    }

    /// Fixed wait before querying the accounting collaborator.
    pub fn accounting_settle_delay(&self) -> Duration {
        Duration::from_secs(self.accounting_settle_secs)
    }

    /// Use a different accounting settle delay.
    pub fn with_settle_secs(mut self, secs: u64) -> Self {
        self.accounting_settle_secs = secs;
        self
    }
}

/// Resolve JOBDATA_DIR using the standard resolution order.
fn resolve_jobdata_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("JOBDATA_DIR") {
        return Ok(PathBuf::from(path));
    }

    if let Some(proj_dirs) = ProjectDirs::from("", "", "jobdata") {
        return Ok(proj_dirs.data_dir().to_path_buf());
    }

    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("Could not determine home directory".to_string()))?;
    Ok(PathBuf::from(home).join(".local/share/jobdata"))
}
