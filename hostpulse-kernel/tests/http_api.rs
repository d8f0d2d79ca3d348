use hostpulse_devkit::{base_time, MessageBuilder};
use hostpulse_kernel::http::{HostsResponse, LatestResponse, MetricsResponse};
use hostpulse_kernel::{build_router, AppState, HealthTracker, MetricStore};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;

struct TestServer {
    base: String,
    client: reqwest::Client,
    store: MetricStore,
}

impl TestServer {
    async fn start(api_key: Option<&str>) -> Self {
        let store = MetricStore::in_memory().await.unwrap();
        let app = build_router(AppState::new(
            store.clone(),
            HealthTracker::new(),
            api_key.map(str::to_string),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            store,
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_list_and_latest_metrics() {
    let server = TestServer::start(None).await;
    for minute in 0..3 {
        server
            .store
            .save(&MessageBuilder::host_a().minutes_after_base(minute).build())
            .await
            .unwrap();
    }

    let resp = server.get("/metrics?hostname=host-a&limit=2").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: MetricsResponse = resp.json().await.unwrap();
    assert_eq!(body.metrics.len(), 2);
    assert!(body.metrics[0].metric.time > body.metrics[1].metric.time);

    let body: LatestResponse = server
        .get("/metrics/latest?hostname=host-a")
        .await
        .json()
        .await
        .unwrap();
    let latest = body.metric.unwrap();
    assert_eq!(latest.metric.cpu, 42.5);
    assert_eq!(latest.metric.disk[0].path, "/");
}

#[tokio::test]
async fn test_time_range_query() {
    let server = TestServer::start(None).await;
    for minute in 0..5 {
        server
            .store
            .save(&MessageBuilder::host_a().minutes_after_base(minute).build())
            .await
            .unwrap();
    }
    let from = (base_time() + chrono::Duration::minutes(3)).to_rfc3339();

    let resp = server
        .client
        .get(format!("{}/metrics", server.base))
        .query(&[("hostname", "host-a"), ("from_time", from.as_str())])
        .send()
        .await
        .unwrap();
    let body: MetricsResponse = resp.json().await.unwrap();
    assert_eq!(body.metrics.len(), 2);
}

#[tokio::test]
async fn test_latest_for_unknown_host_is_null() {
    let server = TestServer::start(None).await;
    let resp = server.get("/metrics/latest?hostname=ghost").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["metric"].is_null());
}

#[tokio::test]
async fn test_latest_of_every_host() {
    let server = TestServer::start(None).await;
    let empty: MetricsResponse = server.get("/metrics/latest/all").await.json().await.unwrap();
    assert!(empty.metrics.is_empty());

    for (hostname, minute) in [("host-b", 0), ("host-a", 0), ("host-a", 5), ("host-b", 2)] {
        server
            .store
            .save(&MessageBuilder::new(hostname).minutes_after_base(minute).build())
            .await
            .unwrap();
    }

    let resp = server.get("/metrics/latest/all").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: MetricsResponse = resp.json().await.unwrap();
    let latest: Vec<_> = body
        .metrics
        .iter()
        .map(|m| (m.hostname().to_string(), m.metric.time))
        .collect();
    assert_eq!(
        latest,
        [
            ("host-a".to_string(), base_time() + chrono::Duration::minutes(5)),
            ("host-b".to_string(), base_time() + chrono::Duration::minutes(2)),
        ]
    );
}

#[tokio::test]
async fn test_invalid_arguments_are_400() {
    let server = TestServer::start(None).await;

    for path in [
        "/metrics",
        "/metrics?hostname=host-a&from_time=yesterday",
        "/metrics?hostname=host-a&limit=many",
        "/metrics/latest",
    ] {
        let resp = server.get(path).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{path}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_argument", "{path}");
    }
}

#[tokio::test]
async fn test_hosts_routes() {
    let server = TestServer::start(None).await;
    server
        .store
        .save(&MessageBuilder::host_a().build())
        .await
        .unwrap();

    let hosts: HostsResponse = server.get("/hosts").await.json().await.unwrap();
    assert_eq!(hosts.hosts.len(), 1);
    assert_eq!(hosts.hosts[0].hostname, "host-a");

    let resp = server.get("/hosts/host-a").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let host: Value = resp.json().await.unwrap();
    assert_eq!(host["platformver"], "12");

    let resp = server.get("/hosts/ghost").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "not_found");

    let history: MetricsResponse = server
        .get("/hosts/host-a/metrics")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(history.metrics.len(), 1);
}

#[tokio::test]
async fn test_internal_errors_hide_details() {
    let server = TestServer::start(None).await;
    server
        .store
        .save(&MessageBuilder::host_a().build())
        .await
        .unwrap();
    sqlx::query("UPDATE metrics SET network = '{'")
        .execute(server.store.pool())
        .await
        .unwrap();

    let resp = server.get("/metrics/latest?hostname=host-a").await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "internal");
    assert_eq!(body["message"], "internal error");
}

#[tokio::test]
async fn test_api_key_guards_everything_but_liveness() {
    let server = TestServer::start(Some("s3cret")).await;

    let resp = server.get("/health").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = server.get("/hosts").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unauthorized");

    let resp = server
        .client
        .get(format!("{}/hosts", server.base))
        .header("x-api-key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .client
        .get(format!("{}/system/health", server.base))
        .header("x-api-key", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health: Value = resp.json().await.unwrap();
    assert_eq!(health["store_status"], "ok");
}

#[tokio::test]
async fn test_no_api_key_means_open_api() {
    let server = TestServer::start(None).await;
    assert_eq!(server.get("/hosts").await.status(), StatusCode::OK);
    assert_eq!(server.get("/system/health").await.status(), StatusCode::OK);
}
