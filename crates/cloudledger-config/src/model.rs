//! YAML shape of `cloudledger.yaml`

use crate::error::{ConfigError, Result};
use cloudledger::{ResourceDescriptor, builtin};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// `sqlite://path`, `sqlite::memory:` or a bare file path
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://cloudledger.db".to_string(),
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub base_url: String,
    /// Environment variable holding a bearer token
    pub token_env: Option<String>,
    pub page_size: u32,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_env: None,
            page_size: 500,
            timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSection {
    pub requests_per_minute: u32,
    pub burst_capacity: u32,
    pub enabled: bool,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            requests_per_minute: 600,
            burst_capacity: 30,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub run_timeout_secs: u64,
    pub retry: RetrySection,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            run_timeout_secs: 600,
            retry: RetrySection::default(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

/// One resource kind to reconcile
///
/// Exactly one of `builtin` and `descriptor` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    #[serde(default)]
    pub builtin: Option<String>,
    #[serde(default)]
    pub descriptor: Option<ResourceDescriptor>,
    /// API path below the scope; defaults to the resource name
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl ResourceConfig {
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            builtin: Some(name.into()),
            descriptor: None,
            path: None,
            id_field: default_id_field(),
        }
    }

    pub fn inline(descriptor: ResourceDescriptor) -> Self {
        Self {
            builtin: None,
            descriptor: Some(descriptor),
            path: None,
            id_field: default_id_field(),
        }
    }

    /// Resolve and validate the descriptor
    pub fn descriptor(&self) -> Result<ResourceDescriptor> {
        let descriptor = match (&self.builtin, &self.descriptor) {
            (Some(name), None) => {
                builtin::by_name(name).ok_or_else(|| ConfigError::UnknownBuiltin {
                    name: name.clone(),
                    available: builtin::BUILTIN_NAMES.join(", "),
                })?
            }
            (None, Some(descriptor)) => descriptor.clone(),
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "a resource sets both 'builtin' and 'descriptor'".into(),
                ));
            }
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "a resource needs either 'builtin' or 'descriptor'".into(),
                ));
            }
        };
        descriptor
            .validate()
            .map_err(|e| ConfigError::InvalidDescriptor {
                resource: descriptor.name.clone(),
                message: e.to_string(),
            })?;
        Ok(descriptor)
    }

    pub fn path_for(&self, descriptor: &ResourceDescriptor) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| descriptor.name.clone())
    }
}

impl LedgerConfig {
    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Check every section; descriptors are resolved along the way
    pub fn validate(&self) -> Result<()> {
        if self.scopes.is_empty() {
            return Err(ConfigError::Invalid("no scopes configured".into()));
        }
        if self.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid("empty scope name".into()));
        }
        if self.resources.is_empty() {
            return Err(ConfigError::Invalid("no resources configured".into()));
        }
        if self.api.base_url.is_empty() {
            return Err(ConfigError::Invalid("api.base_url is required".into()));
        }
        if self.api.page_size == 0 {
            return Err(ConfigError::Invalid("api.page_size must be positive".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be positive".into(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.requests_per_minute must be positive".into(),
            ));
        }
        if self.schedule.interval_secs == 0 || self.schedule.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule intervals must be positive".into(),
            ));
        }
        let retry = &self.schedule.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "schedule.retry.max_attempts must be at least 1".into(),
            ));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "schedule.retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut tables = HashSet::new();
        for descriptor in self.descriptors()? {
            if !names.insert(descriptor.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "resource '{}' configured twice",
                    descriptor.name
                )));
            }
            // "instance" + child "labels" and a resource named "instance_labels"
            // both land on live_instance_labels
            for table in physical_tables(&descriptor) {
                if !tables.insert(table.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "table '{}' is claimed by two resources (at '{}')",
                        table, descriptor.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn descriptors(&self) -> Result<Vec<ResourceDescriptor>> {
        self.resources.iter().map(ResourceConfig::descriptor).collect()
    }
}

fn physical_tables(descriptor: &ResourceDescriptor) -> Vec<String> {
    let mut tables = vec![descriptor.live_table(), descriptor.history_table()];
    for child in &descriptor.children {
        tables.push(descriptor.live_child_table(&child.name));
        tables.push(descriptor.history_child_table(&child.name));
    }
    tables
}
