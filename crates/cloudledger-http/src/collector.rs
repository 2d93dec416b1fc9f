//! Paginated JSON listing over HTTP
//!
//! `GET {base_url}/{scope}/{path}?maxResults=N[&pageToken=T]` returning
//! `{"items": [...], "nextPageToken": "..."}`. Pages are fetched lazily as the
//! reconciler pulls items.

use crate::error::{HttpCollectorError, Result};
use crate::rate_limit::RateLimiter;
use cloudledger::{Collector, LedgerError, RawObject, RawStream, extract_id};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value as Json;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpCollectorConfig {
    /// API root, e.g. `https://compute.example.com/v1/projects`
    pub base_url: String,
    /// Path below the scope, e.g. `instances`
    pub resource_path: String,
    /// Dotted path of the id inside each item
    pub id_field: String,
    pub page_size: u32,
    pub timeout: Duration,
    /// Bearer token
    pub token: Option<String>,
}

impl HttpCollectorConfig {
    pub fn new(base_url: impl Into<String>, resource_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            resource_path: resource_path.into(),
            id_field: "id".to_string(),
            page_size: 500,
            timeout: Duration::from_secs(30),
            token: None,
        }
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Read the bearer token from an environment variable
    pub fn with_token_from_env(self, var: &str) -> Result<Self> {
        let token = std::env::var(var)
            .map_err(|_| HttpCollectorError::MissingEnvVar(var.to_string()))?;
        Ok(self.with_token(token))
    }
}

/// One page of a listing
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub items: Vec<Json>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

pub struct HttpCollector {
    name: String,
    client: reqwest::Client,
    config: HttpCollectorConfig,
    limiter: Option<RateLimiter>,
}

impl HttpCollector {
    pub fn new(config: HttpCollectorConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(HttpCollectorError::InvalidConfig("base_url is empty".into()));
        }
        if config.page_size == 0 {
            return Err(HttpCollectorError::InvalidConfig(
                "page_size must be positive".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            name: format!("http:{}", config.resource_path),
            client,
            config,
            limiter: None,
        })
    }

    /// Share a limiter with the other collectors of the same API
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &HttpCollectorConfig {
        &self.config
    }

    fn scope_url(&self, scope: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            scope,
            self.config.resource_path.trim_start_matches('/')
        )
    }

    /// Fetch a single page
    pub async fn fetch_page(&self, scope: &str, page_token: Option<&str>) -> Result<Page> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = self.scope_url(scope);
        let mut query = vec![("maxResults", self.config.page_size.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let mut request = self.client.get(&url).query(&query);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), "Listing request rejected");
            return Err(HttpCollectorError::Status {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| HttpCollectorError::Decode {
            url,
            message: e.to_string(),
        })
    }

    fn to_raw(&self, scope: &str, items: Vec<Json>) -> Result<Vec<RawObject>> {
        items
            .into_iter()
            .map(|item| match extract_id(&item, &self.config.id_field) {
                Some(id) => Ok(RawObject::new(id, item)),
                None => Err(HttpCollectorError::MissingId {
                    field: self.config.id_field.clone(),
                    url: self.scope_url(scope),
                }),
            })
            .collect()
    }
}

/// Pagination cursor: `None` once the last page was read
type Cursor = Option<Option<String>>;

impl Collector for HttpCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_all<'a>(&'a self, scope: &'a str) -> RawStream<'a> {
        let start: Cursor = Some(None);
        let pages = stream::try_unfold((start, 0usize), move |(cursor, page)| async move {
            let Some(token) = cursor else {
                return Ok::<_, HttpCollectorError>(None);
            };
            let fetched = self.fetch_page(scope, token.as_deref()).await?;
            let next = fetched.next_page_token.filter(|t| !t.is_empty());
            if next.is_some() && next == token {
                return Err(HttpCollectorError::Pagination {
                    url: self.scope_url(scope),
                });
            }
            debug!(
                collector = %self.name,
                scope,
                page,
                items = fetched.items.len(),
                more = next.is_some(),
                "Fetched page"
            );
            let objects = self.to_raw(scope, fetched.items)?;
            Ok(Some((objects, (next.map(Some), page + 1))))
        });

        pages
            .map_err(LedgerError::from)
            .map_ok(|objects| {
                stream::iter(objects.into_iter().map(Ok::<RawObject, LedgerError>))
            })
            .try_flatten()
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_url() {
        let collector = HttpCollector::new(HttpCollectorConfig::new(
            "http://api.local/v1/projects/",
            "/zones/-/instances",
        ))
        .unwrap();
        assert_eq!(
            collector.scope_url("proj-a"),
            "http://api.local/v1/projects/proj-a/zones/-/instances"
        );
        assert_eq!(collector.name(), "http:/zones/-/instances");
    }

    #[test]
    fn test_invalid_config() {
        assert!(HttpCollector::new(HttpCollectorConfig::new("", "instances")).is_err());
        assert!(
            HttpCollector::new(HttpCollectorConfig::new("http://api", "instances").with_page_size(0))
                .is_err()
        );
    }

    #[test]
    fn test_page_deserialize() {
        let page: Page = serde_json::from_str(r#"{"items":[{"id":"1"}],"nextPageToken":"t2"}"#)
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("t2"));

        let empty: Page = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.next_page_token.is_none());
    }

    #[test]
    fn test_missing_token_env() {
        let err = HttpCollectorConfig::new("http://api", "instances")
            .with_token_from_env("CLOUDLEDGER_TEST_TOKEN_THAT_IS_NOT_SET")
            .unwrap_err();
        assert!(matches!(err, HttpCollectorError::MissingEnvVar(_)));
    }
}
