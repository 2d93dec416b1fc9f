use cloudledger::{
    Collector, LedgerError, MemoryStore, Reconciler, Store, Value, builtin,
};
use cloudledger_http::{HttpCollector, HttpCollectorConfig, RateLimitConfig, RateLimiter};
use futures_util::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SCOPE: &str = "proj-a";

fn config(server: &MockServer) -> HttpCollectorConfig {
    HttpCollectorConfig::new(server.uri(), "instances").with_page_size(2)
}

fn instance(id: u64, status: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("vm-{id}"),
        "status": status,
        "labels": {"env": "prod"},
        "licenses": ["debian-12"],
    })
}

async fn mount_pages(server: &MockServer, first: Vec<serde_json::Value>, second: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path("/proj-a/instances"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": first, "nextPageToken": "page-2"})),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/proj-a/instances"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": second})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_follows_page_tokens() {
    let server = MockServer::start().await;
    mount_pages(
        &server,
        vec![instance(1, "RUNNING"), instance(2, "RUNNING")],
        vec![instance(3, "STOPPING")],
    )
    .await;

    let collector = HttpCollector::new(config(&server)).unwrap();
    let objects: Vec<_> = collector.fetch_all(SCOPE).try_collect().await.unwrap();
    let ids: Vec<_> = objects.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(objects[2].payload["status"], "STOPPING");
}

#[tokio::test]
async fn test_sends_bearer_token_and_page_size() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/proj-a/instances"))
        .and(header("authorization", "Bearer s3cret"))
        .and(query_param("maxResults", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&server)
        .await;

    let collector = HttpCollector::new(config(&server).with_token("s3cret")).unwrap();
    let objects: Vec<_> = collector.fetch_all(SCOPE).try_collect().await.unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend unavailable"))
        .mount(&server)
        .await;

    let collector = HttpCollector::new(config(&server)).unwrap();
    let err = collector
        .fetch_all(SCOPE)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Transient(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_forbidden_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let collector = HttpCollector::new(config(&server)).unwrap();
    let err = collector
        .fetch_all(SCOPE)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Permanent(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_undecodable_page_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let collector = HttpCollector::new(config(&server)).unwrap();
    let err = collector
        .fetch_all(SCOPE)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Permanent(_)));
}

#[tokio::test]
async fn test_item_without_id_fails_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"items": [{"name": "orphan"}]})),
        )
        .mount(&server)
        .await;

    let collector = HttpCollector::new(config(&server)).unwrap();
    let err = collector
        .fetch_all(SCOPE)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Permanent(_)));
}

#[tokio::test]
async fn test_repeated_page_token_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": [instance(1, "RUNNING")], "nextPageToken": "again"})),
        )
        .mount(&server)
        .await;

    let collector = HttpCollector::new(config(&server)).unwrap();
    let err = collector
        .fetch_all(SCOPE)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Permanent(_)));
}

#[tokio::test]
async fn test_error_on_second_page_fails_whole_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": [instance(1, "RUNNING")], "nextPageToken": "p2"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let collector = HttpCollector::new(config(&server)).unwrap();
    let err = collector
        .fetch_all(SCOPE)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Transient(_)));
}

/// Listing through HTTP feeds a full run and sweep
#[tokio::test]
async fn test_reconcile_from_api() {
    let server = MockServer::start().await;
    mount_pages(
        &server,
        vec![instance(1, "RUNNING"), instance(2, "RUNNING")],
        vec![instance(3, "TERMINATED")],
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let desc = Arc::new(builtin::instance());
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let collector = HttpCollector::new(config(&server))
        .unwrap()
        .with_rate_limiter(limiter);
    let reconciler = Reconciler::new(desc.clone(), store.clone(), Arc::new(collector));
    reconciler.prepare().await.unwrap();

    let (run, sweep) = reconciler.run_and_sweep(SCOPE).await.unwrap();
    assert_eq!(run.entity_count, 3);
    assert_eq!(run.created, 3);
    assert_eq!(sweep.retired, 0);

    let mut tx = store.begin().await.unwrap();
    let live = tx.load_with_children(&desc, "3").await.unwrap().unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(live.entity.scalar("status"), &Value::Text("TERMINATED".into()));
    assert_eq!(store.entity_history(&desc, "1").await.unwrap().len(), 1);
}
