//! End-to-end tests against the public router: redirector, object
//! serving, index, health, and the signed webhook, with a fake origin
//! fetcher and deploy runtime injected behind the real traits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::LOCATION};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use tower::ServiceExt;
use url::Url;

use staffetta::cache::{CacheCoordinator, UrlPolicy};
use staffetta::config::{CacheSettings, DeploySettings, DeployTarget, PolicySettings};
use staffetta::deploy::{DeployError, DeployRuntime, DeploySequencer};
use staffetta::fetch::{FetchError, FetchedResource, OriginFetch};
use staffetta::infra::http::{AppState, build_router};
use staffetta::storage::{FsObjectStore, StorageGateway};

const PAYLOAD: &[u8] = b"compressed tarball payload";
const SECRET: &str = "webhook-secret";

enum Plan {
    Bytes(&'static [u8], &'static str),
    Unavailable,
}

struct FakeFetcher {
    calls: AtomicUsize,
    plan: Plan,
}

#[async_trait]
impl OriginFetch for FakeFetcher {
    async fn fetch(&self, _url: &Url) -> Result<FetchedResource, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.plan {
            Plan::Bytes(bytes, content_type) => Ok(FetchedResource {
                bytes: Bytes::from_static(bytes),
                content_type: Some(content_type.to_string()),
                etag: Some("test-etag".to_string()),
            }),
            Plan::Unavailable => Err(FetchError::Unavailable {
                reason: "origin is down".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct FakeRuntime {
    pulls: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl DeployRuntime for FakeRuntime {
    async fn pull_latest(&self) -> Result<(), DeployError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn build_image(&self) -> Result<(), DeployError> {
        Ok(())
    }

    async fn stop_container(&self, _target: &DeployTarget) -> Result<(), DeployError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_container(&self, _target: &DeployTarget) -> Result<(), DeployError> {
        Ok(())
    }
}

struct TestApp {
    router: Router,
    fetcher: Arc<FakeFetcher>,
    runtime: Arc<FakeRuntime>,
    // Keeps the object store directory alive for the duration of the test.
    _tmp: tempfile::TempDir,
}

fn test_app(plan: Plan, webhook_secret: Option<&str>) -> TestApp {
    let tmp = tempfile::tempdir().expect("tempdir");
    let public_base = Url::parse("http://cache.test/o/").expect("base url");
    let objects =
        Arc::new(FsObjectStore::new(tmp.path().to_path_buf(), public_base).expect("store"));

    let fetcher = Arc::new(FakeFetcher {
        calls: AtomicUsize::new(0),
        plan,
    });
    let coordinator = Arc::new(CacheCoordinator::new(
        CacheSettings {
            retry_cooldown: Duration::from_secs(60),
            min_object_bytes: 0,
        },
        fetcher.clone(),
        objects.clone(),
    ));

    let policy = Arc::new(
        UrlPolicy::from_settings(&PolicySettings {
            allow: vec!["files.test".to_string()],
            deny: vec!["favicon\\.ico".to_string()],
            pass: vec![".*/repomd\\.xml".to_string()],
        })
        .expect("policy"),
    );

    let runtime = Arc::new(FakeRuntime::default());
    let sequencer = DeploySequencer::spawn(
        DeploySettings {
            cooldown: Duration::from_secs(60),
            pull: vec!["git".to_string(), "pull".to_string()],
            build: vec!["true".to_string()],
            targets: vec![DeployTarget {
                name: "cache".to_string(),
                stop: vec!["true".to_string()],
                start: vec!["true".to_string()],
            }],
        },
        runtime.clone(),
    );

    let router = build_router(AppState {
        coordinator,
        policy,
        objects,
        sequencer,
        webhook_secret: webhook_secret.map(str::to_string),
    });

    TestApp {
        router,
        fetcher,
        runtime,
        _tmp: tmp,
    }
}

async fn get(router: &Router, path: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(
            Request::builder()
                .uri(path)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response")
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(LOCATION)
        .expect("location header")
        .to_str()
        .expect("location str")
        .to_string()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
}

fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn miss_fills_then_hits_without_refetching() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);

    let first = get(&app.router, "/files.test/pkg-1.0.tar.gz").await;
    assert_eq!(first.status(), StatusCode::FOUND);
    let target = location(&first);
    assert!(target.starts_with("http://cache.test/o/"));
    assert!(target.ends_with("/pkg-1.0.tar.gz"));

    let second = get(&app.router, "/files.test/pkg-1.0.tar.gz").await;
    assert_eq!(second.status(), StatusCode::FOUND);
    assert_eq!(location(&second), target);
    assert_eq!(app.fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stored_bytes_are_served_under_the_public_prefix() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);

    let redirect = get(&app.router, "/files.test/pkg-1.0.tar.gz").await;
    let target = Url::parse(&location(&redirect)).expect("location url");

    let served = get(&app.router, target.path()).await;
    assert_eq!(served.status(), StatusCode::OK);
    assert_eq!(
        served
            .headers()
            .get("content-type")
            .expect("content type")
            .to_str()
            .expect("str"),
        "application/gzip"
    );
    assert_eq!(&body_bytes(served).await[..], PAYLOAD);
}

#[tokio::test]
async fn unknown_object_keys_are_not_found() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);
    let response = get(&app.router, "/o/deadbeef/missing.tar.gz").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn denylisted_urls_are_rejected() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);
    let response = get(&app.router, "/files.test/favicon.ico").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unlisted_hosts_pass_through_to_the_origin() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);
    let response = get(&app.router, "/unknown.test/file.tgz").await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(location(&response), "https://unknown.test/file.tgz");
    assert_eq!(app.fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn passlisted_indexes_are_never_cached() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);
    let response = get(&app.router, "/files.test/repomd.xml").await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(location(&response), "https://files.test/repomd.xml");
}

#[tokio::test]
async fn unavailable_origin_maps_to_gateway_timeout() {
    let app = test_app(Plan::Unavailable, None);
    let response = get(&app.router, "/files.test/pkg-1.0.tar.gz").await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn html_bodies_redirect_to_the_origin_instead() {
    let app = test_app(Plan::Bytes(b"<html>down for maintenance</html>", "text/html"), None);
    let response = get(&app.router, "/files.test/pkg-1.0.tar.gz").await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "https://files.test/pkg-1.0.tar.gz");
}

#[tokio::test]
async fn health_endpoint_answers_no_content() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);
    let response = get(&app.router, "/_health").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn index_lists_cached_objects() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);
    get(&app.router, "/files.test/pkg-1.0.tar.gz").await;

    let response = get(&app.router, "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).expect("json body");
    assert_eq!(body["count"], 1);
    assert_eq!(body["objects"][0]["name"], "pkg-1.0.tar.gz");
    assert_eq!(
        body["objects"][0]["origin_url"],
        "https://files.test/pkg-1.0.tar.gz"
    );
}

#[tokio::test]
async fn webhook_is_disabled_without_a_secret() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), None);
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/_webhook")
                .body(Body::from("{}"))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_rejects_a_bad_signature() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), Some(SECRET));
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/_webhook")
                .header("x-hub-signature-256", sign("wrong-secret", b"{}"))
                .body(Body::from("{}"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.runtime.pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn webhook_accepts_a_valid_signature_and_deploys() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), Some(SECRET));
    let payload = br#"{"ref":"refs/heads/main"}"#;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/_webhook")
                .header("x-hub-signature-256", sign(SECRET, payload))
                .body(Body::from(&payload[..]))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).expect("json body");
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["disposition"], "started");

    for _ in 0..100 {
        if app.runtime.pulls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(app.runtime.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(app.runtime.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn warm_start_survives_a_restart() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let public_base = Url::parse("http://cache.test/o/").expect("base url");
    let settings = CacheSettings {
        retry_cooldown: Duration::from_secs(60),
        min_object_bytes: 0,
    };

    // First process: fill the cache once.
    let objects =
        Arc::new(FsObjectStore::new(tmp.path().to_path_buf(), public_base.clone()).expect("store"));
    let fetcher = Arc::new(FakeFetcher {
        calls: AtomicUsize::new(0),
        plan: Plan::Bytes(PAYLOAD, "application/gzip"),
    });
    let coordinator = Arc::new(CacheCoordinator::new(
        settings.clone(),
        fetcher.clone(),
        objects.clone(),
    ));
    let resource = staffetta::cache::normalize("https://files.test/pkg-1.0.tar.gz").expect("url");
    coordinator.resolve(&resource).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    // Second process: rebuild the table from the store listing.
    let objects =
        Arc::new(FsObjectStore::new(tmp.path().to_path_buf(), public_base).expect("store"));
    let fetcher = Arc::new(FakeFetcher {
        calls: AtomicUsize::new(0),
        plan: Plan::Unavailable,
    });
    let coordinator = Arc::new(CacheCoordinator::new(settings, fetcher.clone(), objects.clone()));
    let loaded = coordinator.warm_start(objects.list().await.expect("list"));
    assert_eq!(loaded, 1);

    match coordinator.resolve(&resource).await {
        staffetta::cache::Outcome::Hit(object) => assert_eq!(object.name, "pkg-1.0.tar.gz"),
        other => panic!("expected Hit, got {other:?}"),
    }
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deploy_status_is_reported() {
    let app = test_app(Plan::Bytes(PAYLOAD, "application/gzip"), Some(SECRET));
    let response = get(&app.router, "/_deploy").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).expect("json body");
    assert_eq!(body["state"], "idle");
    assert_eq!(body["pending"], false);
}
