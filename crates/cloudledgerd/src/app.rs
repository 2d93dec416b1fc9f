//! Wiring from configuration to jobs

use crate::scheduler::{Job, RetryConfig, SchedulerConfig};
use anyhow::{Context, Result};
use cloudledger::{MemoryStore, Reconciler, Store};
use cloudledger_config::{LedgerConfig, RateLimitSection, RetrySection, ScheduleConfig};
use cloudledger_http::{HttpCollector, HttpCollectorConfig, RateLimitConfig, RateLimiter};
use cloudledger_sqlite::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub fn scheduler_config(schedule: &ScheduleConfig) -> SchedulerConfig {
    SchedulerConfig {
        interval: schedule.interval(),
        run_timeout: schedule.run_timeout(),
        retry: retry_config(&schedule.retry),
    }
}

fn retry_config(retry: &RetrySection) -> RetryConfig {
    RetryConfig {
        max_attempts: retry.max_attempts,
        initial_delay: Duration::from_millis(retry.initial_delay_ms),
        max_delay: Duration::from_millis(retry.max_delay_ms),
        backoff_multiplier: retry.backoff_multiplier,
    }
}

fn rate_limit_config(section: &RateLimitSection) -> RateLimitConfig {
    RateLimitConfig {
        requests_per_minute: section.requests_per_minute,
        burst_capacity: section.burst_capacity,
        enabled: section.enabled,
    }
}

/// Open the configured database, or a throwaway in-memory store
pub async fn open_store(config: &LedgerConfig, in_memory: bool) -> Result<Arc<dyn Store>> {
    if in_memory {
        info!("Using in-memory store; nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let database = &config.database;
    let store = if database.url.starts_with("sqlite:") {
        SqliteStore::connect(&database.url, database.max_connections).await
    } else {
        SqliteStore::open(&database.url, database.max_connections).await
    }
    .with_context(|| format!("Failed to open database {}", database.url))?;
    Ok(Arc::new(store))
}

/// Build one job per configured (resource, scope) pair
///
/// All collectors share one rate limiter. Schemas are created before any
/// job is returned.
pub async fn build_jobs(config: &LedgerConfig, store: Arc<dyn Store>) -> Result<Vec<Job>> {
    let limiter = RateLimiter::new(rate_limit_config(&config.rate_limit));
    let token = match &config.api.token_env {
        Some(var) => Some(
            std::env::var(var)
                .with_context(|| format!("Environment variable {} is not set", var))?,
        ),
        None => None,
    };

    let mut jobs = Vec::new();
    for resource in &config.resources {
        let descriptor = Arc::new(resource.descriptor()?);

        let mut http = HttpCollectorConfig::new(&config.api.base_url, resource.path_for(&descriptor))
            .with_id_field(&resource.id_field)
            .with_page_size(config.api.page_size)
            .with_timeout(config.api.timeout());
        if let Some(token) = &token {
            http = http.with_token(token);
        }
        let collector = HttpCollector::new(http)?.with_rate_limiter(limiter.clone());

        let reconciler = Reconciler::new(descriptor.clone(), store.clone(), Arc::new(collector));
        reconciler
            .prepare()
            .await
            .with_context(|| format!("Failed to prepare tables for {}", descriptor.name))?;

        for scope in &config.scopes {
            jobs.push(Job::new(reconciler.clone(), scope));
        }
    }
    Ok(jobs)
}

/// Keep the jobs matching the optional filters
pub fn select_jobs(jobs: Vec<Job>, resource: Option<&str>, scope: Option<&str>) -> Vec<Job> {
    jobs.into_iter()
        .filter(|job| resource.is_none_or(|r| job.reconciler.descriptor().name == r))
        .filter(|job| scope.is_none_or(|s| job.scope == s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudledger_config::ResourceConfig;

    fn config() -> LedgerConfig {
        let mut config = LedgerConfig::from_yaml(
            "api:\n  base_url: http://127.0.0.1:9\nscopes: [proj-a, proj-b]\n",
        )
        .unwrap();
        config.resources = vec![
            ResourceConfig::builtin("instance"),
            ResourceConfig::builtin("disk"),
        ];
        config
    }

    #[tokio::test]
    async fn test_build_jobs_per_resource_and_scope() {
        let config = config();
        let store = open_store(&config, true).await.unwrap();
        let jobs = build_jobs(&config, store).await.unwrap();
        let keys: Vec<_> = jobs.iter().map(|j| j.key().to_string()).collect();
        assert_eq!(
            keys,
            vec!["instance@proj-a", "instance@proj-b", "disk@proj-a", "disk@proj-b"]
        );

        let selected = select_jobs(jobs, Some("disk"), Some("proj-b"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].key().to_string(), "disk@proj-b");
    }

    #[tokio::test]
    async fn test_missing_token_env_fails() {
        let mut config = config();
        config.api.token_env = Some("CLOUDLEDGER_TEST_UNSET_TOKEN".into());
        let store = open_store(&config, true).await.unwrap();
        assert!(build_jobs(&config, store).await.is_err());
    }

    #[test]
    fn test_scheduler_config_from_schedule() {
        let schedule = ScheduleConfig::default();
        let config = scheduler_config(&schedule);
        assert_eq!(config.interval, Duration::from_secs(900));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_delay, Duration::from_secs(30));
    }
}
