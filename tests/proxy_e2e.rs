//! End-to-end exercise of the registry reverse proxy (spec.md §8 scenario 1):
//! a real axum server, a real HTTP client, and a wiremock upstream registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use portalcrane::audit::AuditSink;
use portalcrane::auth::{jwt, PolicyResolver};
use portalcrane::config::Config;
use portalcrane::proxy::{self, ProxyState};
use portalcrane::store::folders::FolderStore;
use portalcrane::store::users::UserStore;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn spawn_proxy(registry_url: String, public_base_url: String) -> (SocketAddr, Arc<AuditSink>, String) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::parse_from([
        "portalcrane",
        "--registry-url",
        &registry_url,
        "--secret-key",
        "test-secret",
        "--admin-username",
        "admin",
        "--admin-password",
        "test-admin-pw",
        "--trivy-server-url",
        "http://127.0.0.1:4954",
        "--staging-root",
        dir.path().join("staging").to_str().unwrap(),
        "--registry-data-root",
        dir.path().join("registry-data").to_str().unwrap(),
        "--data-dir",
        dir.path().to_str().unwrap(),
        "--public-base-url",
        &public_base_url,
        "--supervisor-rpc-url",
        "http://127.0.0.1:9001/RPC2",
        "--registry-config-path",
        dir.path().join("registry-config.yml").to_str().unwrap(),
    ]);
    config.proxy_timeout_secs = 5;
    let config = Arc::new(config);

    let users = Arc::new(UserStore::open(config.data_dir.join("local_users.json")).await.unwrap());
    let folders = Arc::new(FolderStore::open(config.data_dir.join("folders.json")).await.unwrap());
    let resolver = Arc::new(PolicyResolver::new(Arc::clone(&config), users, folders));
    let audit = Arc::new(AuditSink::open(config.data_dir.join("audit-events.jsonl"), 50).await.unwrap());

    let token = jwt::create_access_token("test-secret", "admin", 60).unwrap();

    let state = Arc::new(ProxyState::new(config, resolver, Arc::clone(&audit)).unwrap());
    let app = proxy::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // give the listener a beat to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, audit, token)
}

#[tokio::test]
async fn manifest_pull_widens_accept_and_forwards_body_verbatim() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/library/alpine/manifests/3.19"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("docker-content-digest", "sha256:cafef00d")
                .set_body_raw(r#"{"schemaVersion":2}"#, "application/vnd.docker.distribution.manifest.v2+json"),
        )
        .mount(&upstream)
        .await;

    let (addr, audit, token) = spawn_proxy(upstream.uri(), format!("http://127.0.0.1:9")).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/v2/library/alpine/manifests/3.19"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert_eq!(body, r#"{"schemaVersion":2}"#);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let accept = received[0].headers.get("accept").unwrap().to_str().unwrap();
    assert!(accept.contains("application/vnd.oci.image.manifest.v1+json"));
    assert!(accept.contains("application/vnd.oci.image.index.v1+json"));

    let events = audit.recent(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "registry_pull");
    assert_eq!(events[0].http_status, 200);
}

#[tokio::test]
async fn unauthenticated_request_never_reaches_upstream() {
    let upstream = MockServer::start().await;
    // No mock mounted: any request that reaches upstream fails the test by
    // returning a 404 from wiremock's default "no match" behavior, which
    // would also make the assertion on `received_requests` below fail.

    let (addr, audit, _token) = spawn_proxy(upstream.uri(), "http://127.0.0.1:9".to_string()).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/v2/library/alpine/manifests/3.19"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(upstream.received_requests().await.unwrap().len(), 0);

    let events = audit.recent(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].http_status, 401);
}
