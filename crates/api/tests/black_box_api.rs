use std::collections::HashMap;
use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::Value;

use attackmap_infra::store::{InMemoryCache, InMemoryDurableStore};
use attackmap_infra::{AppContext, Settings};

struct TestServer {
    base_url: String,
    durable: Arc<InMemoryDurableStore>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(env: &[(&str, &str)]) -> Self {
        let vars: HashMap<String, String> = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let settings = Settings::from_lookup(|k| vars.get(k).cloned()).expect("valid settings");

        let durable = Arc::new(InMemoryDurableStore::new());
        let cache = Arc::new(InMemoryCache::new(settings.max_events_cache_size));
        let ctx = AppContext::build(settings, durable.clone(), cache).expect("context");
        let scheduler = ctx.start_jobs().expect("jobs");

        // Same router as prod, bound to an ephemeral port.
        let app = attackmap_api::app::build_app(ctx, scheduler);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            durable,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn get_json(client: &reqwest::Client, url: &str) -> (StatusCode, Value) {
    let res = client.get(url).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn events_eventually(client: &reqwest::Client, server: &TestServer, min: usize) -> Value {
    // The mock producer runs once on start; poll until its batch is stored.
    for _ in 0..100 {
        let (status, body) = get_json(client, &server.url("/api/v1/events")).await;
        assert_eq!(status, StatusCode::OK);
        if body["count"].as_u64().unwrap_or(0) as usize >= min {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("events did not appear within timeout");
}

#[tokio::test]
async fn root_and_probes_report_service_state() {
    let server = TestServer::spawn(&[]).await;
    let client = reqwest::Client::new();

    let (status, root) = get_json(&client, &server.url("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(root["status"], "operational");
    assert_eq!(root["endpoints"]["events"], "/api/v1/events");

    let (status, health) = get_json(&client, &server.url("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["services"]["database"]["status"], "healthy");
    assert_eq!(health["services"]["cache"]["status"], "healthy");

    let (status, ready) = get_json(&client, &server.url("/api/v1/health/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ready["ready"], true);

    let (_, live) = get_json(&client, &server.url("/api/v1/health/live")).await;
    assert_eq!(live["status"], "alive");

    let (_, version) = get_json(&client, &server.url("/api/v1/version")).await;
    assert_eq!(version["environment"], "production");
    assert_eq!(version["features"]["mock_events"], true);
}

#[tokio::test]
async fn unreachable_durable_store_degrades_health() {
    let server = TestServer::spawn(&[]).await;
    let client = reqwest::Client::new();
    server.durable.set_available(false);

    let (status, health) = get_json(&client, &server.url("/api/v1/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["services"]["database"]["status"], "unhealthy");

    let (status, ready) = get_json(&client, &server.url("/api/v1/health/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(ready["ready"], false);
}

#[tokio::test]
async fn mock_ingestion_feeds_the_events_listing() {
    let server = TestServer::spawn(&[("EVENTS_PER_FETCH", "5")]).await;
    let client = reqwest::Client::new();

    let body = events_eventually(&client, &server, 5).await;
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 5);
    assert!(events.iter().all(|e| e["enrichment"] == "pending"));

    let (status, limited) = get_json(&client, &server.url("/api/v1/events?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(limited["count"], 2);

    let (_, enriched) = get_json(&client, &server.url("/api/v1/events?status=enriched")).await;
    assert_eq!(enriched["count"], 0);

    let (_, future) = get_json(&client, &server.url("/api/v1/events?since=2999-01-01T00:00:00Z")).await;
    assert_eq!(future["count"], 0);
}

#[tokio::test]
async fn invalid_event_queries_are_rejected() {
    let server = TestServer::spawn(&[("MOCK_EVENT_GENERATION", "false")]).await;
    let client = reqwest::Client::new();

    for (query, code) in [
        ("limit=0", "invalid_limit"),
        ("limit=5000", "invalid_limit"),
        ("status=done", "invalid_status"),
        ("since=yesterday", "invalid_since"),
    ] {
        let (status, body) = get_json(&client, &server.url(&format!("/api/v1/events?{query}"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{query}");
        assert_eq!(body["error"], code, "{query}");
    }
}

#[tokio::test]
async fn admin_lists_registered_jobs() {
    let server = TestServer::spawn(&[("ENABLE_ABUSEIPDB", "true")]).await;
    let client = reqwest::Client::new();

    let (status, body) = get_json(&client, &server.url("/api/v1/admin/jobs")).await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["fetch_radar_data", "enrich_events", "cleanup_events"]);
    assert!(body["jobs"].as_array().unwrap().iter().all(|j| j["enabled"] == true));
}

#[tokio::test]
async fn stream_admission_is_capped() {
    let server = TestServer::spawn(&[("MAX_WEBSOCKET_CONNECTIONS", "1"), ("MOCK_EVENT_GENERATION", "false")]).await;
    let client = reqwest::Client::new();

    let mut first = client.get(server.url("/api/v1/events/stream")).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let hello = first.chunk().await.unwrap().expect("connected frame");
    assert!(String::from_utf8_lossy(&hello).contains("event: connected"));

    let (_, conns) = get_json(&client, &server.url("/api/v1/admin/connections")).await;
    assert_eq!(conns["live"], 1);
    assert_eq!(conns["max"], 1);

    let (status, body) = get_json(&client, &server.url("/api/v1/events/stream")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "capacity_exceeded");

    drop(first);
}

#[tokio::test]
async fn cors_allows_only_configured_origins() {
    let server = TestServer::spawn(&[("CORS_ALLOWED_ORIGINS", "http://localhost:3000")]).await;
    let client = reqwest::Client::new();

    let res = client
        .get(server.url("/api/v1/health"))
        .header("Origin", "http://localhost:3000")
        .send()
        .await
        .unwrap();
    assert_eq!(
        res.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:3000")
    );

    let preflight = client
        .request(reqwest::Method::OPTIONS, server.url("/api/v1/events"))
        .header("Origin", "http://localhost:3000")
        .header("Access-Control-Request-Method", "GET")
        .send()
        .await
        .unwrap();
    assert!(preflight.status().is_success());
    assert!(preflight.headers().contains_key("access-control-allow-methods"));

    let foreign = client
        .get(server.url("/api/v1/health"))
        .header("Origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert!(!foreign.headers().contains_key("access-control-allow-origin"));
}
