use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "Config file not found. Looked in:\n\
        - the CLOUDLEDGER_CONFIG environment variable\n\
        - current directory: cloudledger.local.yaml, cloudledger.yaml\n\
        - ./.cloudledger/ directory\n\
        - ~/.config/cloudledger/cloudledger.yaml"
    )]
    ConfigFileNotFound,

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown builtin resource '{name}' (available: {available})")]
    UnknownBuiltin { name: String, available: String },

    #[error("Invalid descriptor for resource '{resource}': {message}")]
    InvalidDescriptor { resource: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
