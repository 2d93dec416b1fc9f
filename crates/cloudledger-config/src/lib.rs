//! Configuration discovery and loading for CloudLedger
//!
//! ```yaml
//! database:
//!   url: sqlite://data/cloudledger.db
//! api:
//!   base_url: https://compute.example.com/v1/projects
//!   token_env: CLOUDLEDGER_API_TOKEN
//! scopes: [proj-a, proj-b]
//! resources:
//!   - builtin: instance
//!     path: zones/-/instances
//!   - builtin: disk
//!     path: zones/-/disks
//! ```

pub mod error;
pub mod model;

pub use error::*;
pub use model::*;

use std::path::{Path, PathBuf};

/// Environment variable naming a config file directly
pub const CONFIG_ENV: &str = "CLOUDLEDGER_CONFIG";

const CANDIDATES: [&str; 2] = ["cloudledger.local.yaml", "cloudledger.yaml"];

/// Locate the config file
///
/// Priority:
/// 1. `CLOUDLEDGER_CONFIG`
/// 2. current directory: cloudledger.local.yaml, cloudledger.yaml
/// 3. `./.cloudledger/` with the same names
/// 4. `~/.config/cloudledger/cloudledger.yaml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for dir in [current_dir.clone(), current_dir.join(".cloudledger")] {
        if !dir.is_dir() {
            continue;
        }
        for filename in &CANDIDATES {
            let path = dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("cloudledger").join("cloudledger.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// Read, parse and validate one config file
pub fn load_config(path: &Path) -> Result<LedgerConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = LedgerConfig::from_yaml(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// `find_config_file` followed by `load_config`
pub fn discover() -> Result<(PathBuf, LedgerConfig)> {
    let path = find_config_file()?;
    let config = load_config(&path)?;
    Ok((path, config))
}
