//! HTTP API tests against the router, without binding a socket

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::Engine;
use forgestr::auth::{create_protection_event, BranchRule};
use forgestr::{
    ForgeServer, MaintainerResolver, OpenAccess, ProtectionEvaluator, ProvisioningScheduler,
    SchedulerConfig,
};
use forgestr_git::FsRepoManager;
use forgestr_relay::{
    public_key_hex, unix_now, Event, MemoryEventSource, RepoCoordinate, UnsignedEvent,
    KIND_OWNERSHIP_TRANSFER, KIND_REPO_ANNOUNCEMENT,
};
use secp256k1::{Keypair, Secp256k1};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const DOMAIN: &str = "git.example.com";

struct Key {
    keypair: Keypair,
    hex: String,
}

fn key(seed: u8) -> Key {
    let keypair = Keypair::from_seckey_slice(&Secp256k1::new(), &[seed; 32]).unwrap();
    let hex = public_key_hex(&keypair);
    Key { keypair, hex }
}

fn announcement(signer: &Key, repo: &str, extra: Vec<Vec<String>>) -> Event {
    let mut tags = vec![
        vec!["d".to_string(), repo.to_string()],
        vec![
            "clone".to_string(),
            format!("https://{}/{}/{}.git", DOMAIN, signer.hex, repo),
        ],
    ];
    tags.extend(extra);
    UnsignedEvent::new(KIND_REPO_ANNOUNCEMENT, tags, "")
        .sign(&signer.keypair)
        .unwrap()
}

fn transfer(signer: &Key, coordinate: &RepoCoordinate, to: &str, created_at: u64) -> Event {
    UnsignedEvent::new(
        KIND_OWNERSHIP_TRANSFER,
        vec![
            vec!["a".to_string(), coordinate.to_string()],
            vec!["p".to_string(), to.to_string()],
        ],
        "",
    )
    .with_created_at(created_at)
    .sign(&signer.keypair)
    .unwrap()
}

struct Harness {
    source: Arc<MemoryEventSource>,
    router: Router,
    _repos: TempDir,
}

fn harness(events: Vec<Event>, auth: bool) -> Harness {
    let source = Arc::new(MemoryEventSource::with_events(events));
    let repos = TempDir::new().unwrap();

    let maintainers = Arc::new(MaintainerResolver::new(source.clone()));
    let protection = Arc::new(ProtectionEvaluator::new(source.clone()));
    let scheduler = Arc::new(ProvisioningScheduler::new(
        source.clone(),
        Arc::new(FsRepoManager::new(repos.path())),
        Arc::new(OpenAccess),
        SchedulerConfig::new(DOMAIN),
    ));

    let mut server = ForgeServer::new(maintainers, protection, "127.0.0.1:0".to_string())
        .with_scheduler(scheduler);
    if auth {
        server = server.with_auth("admin".to_string(), "hunter2".to_string());
    }

    Harness {
        source,
        router: server.router(),
        _repos: repos,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn basic(request: Request<Body>, user: &str, pass: &str) -> Request<Body> {
    let (mut parts, body) = request.into_parts();
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
    parts.headers.insert(
        header::AUTHORIZATION,
        format!("Basic {}", encoded).parse().unwrap(),
    );
    Request::from_parts(parts, body)
}

#[tokio::test]
async fn test_public_repo_info() {
    let (owner, maintainer) = (key(1), key(2));
    let h = harness(
        vec![announcement(&owner, "forgestr", vec![vec!["maintainers".into(), maintainer.hex.clone()]])],
        false,
    );

    let (status, body) = send(&h.router, get(&format!("/api/repos/{}/forgestr", owner.hex))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner"], json!(owner.hex));
    assert_eq!(body["maintainers"], json!([owner.hex, maintainer.hex]));
    assert_eq!(body["is_private"], json!(false));
}

#[tokio::test]
async fn test_private_repo_hidden_from_strangers() {
    let (owner, maintainer, stranger) = (key(1), key(2), key(3));
    let h = harness(
        vec![announcement(
            &owner,
            "secret",
            vec![
                vec!["private".into(), "true".into()],
                vec!["maintainers".into(), maintainer.hex.clone()],
            ],
        )],
        false,
    );
    let base = format!("/api/repos/{}/secret", owner.hex);

    let (status, _) = send(&h.router, get(&base)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&h.router, get(&format!("{}?viewer={}", base, stranger.hex))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&h.router, get(&format!("{}?viewer={}", base, maintainer.hex))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_private"], json!(true));

    // unknown repositories look the same as hidden ones
    let (status, _) = send(&h.router, get(&format!("/api/repos/{}/nope", owner.hex))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_push_check_follows_protection_and_transfers() {
    let (a, b, maintainer, listed) = (key(1), key(2), key(3), key(4));
    let coordinate = RepoCoordinate::new(&a.hex, "repo").unwrap();
    let now = unix_now();

    let rules = vec![BranchRule {
        branch: "main".into(),
        require_pull_request: true,
        allowed_maintainers: vec![listed.hex.clone()],
        ..Default::default()
    }];
    // rules published by the new owner after the handover
    let protection = create_protection_event(&b.hex, "repo", &rules, now)
        .unwrap()
        .sign(&b.keypair)
        .unwrap();

    let h = harness(
        vec![
            announcement(&a, "repo", vec![vec!["maintainers".into(), maintainer.hex.clone()]]),
            transfer(&a, &coordinate, &b.hex, now - 20),
            protection,
        ],
        false,
    );
    let uri = format!("/api/repos/{}/repo/push-check", a.hex);

    let (_, body) = send(&h.router, post_json(&uri, json!({ "user": b.hex, "branch": "main" }))).await;
    assert_eq!(body["allowed"], json!(true));

    // the previous owner lost control
    let (_, body) = send(&h.router, post_json(&uri, json!({ "user": a.hex, "branch": "dev" }))).await;
    assert_eq!(body["allowed"], json!(false));

    let (_, body) = send(
        &h.router,
        post_json(&uri, json!({ "user": maintainer.hex, "branch": "refs/heads/main" })),
    )
    .await;
    assert_eq!(body["allowed"], json!(false));
    assert!(body["reason"].as_str().unwrap().contains("main"));

    let (_, body) =
        send(&h.router, post_json(&uri, json!({ "user": maintainer.hex, "branch": "dev" }))).await;
    assert_eq!(body["allowed"], json!(true));

    let (_, body) = send(&h.router, post_json(&uri, json!({ "user": listed.hex, "branch": "main" }))).await;
    assert_eq!(body["allowed"], json!(true));

    let (status, body) = send(&h.router, get(&format!("/api/repos/{}/repo/protection", a.hex))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner"], json!(b.hex));
    assert_eq!(body["rules"][0]["branch"], json!("main"));
}

#[tokio::test]
async fn test_push_check_fails_closed() {
    let owner = key(1);
    let h = harness(vec![announcement(&owner, "repo", vec![])], false);
    h.source.set_failing(true);

    let uri = format!("/api/repos/{}/repo/push-check", owner.hex);
    let (status, body) =
        send(&h.router, post_json(&uri, json!({ "user": owner.hex, "branch": "main" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], json!(false));
}

#[tokio::test]
async fn test_invalidate_refreshes_cached_set() {
    let (owner, m) = (key(1), key(2));
    let h = harness(vec![announcement(&owner, "repo", vec![])], false);
    let info = format!("/api/repos/{}/repo", owner.hex);

    let (_, before) = send(&h.router, get(&info)).await;
    assert_eq!(before["maintainers"], json!([owner.hex]));

    h.source.insert(
        UnsignedEvent::new(
            KIND_REPO_ANNOUNCEMENT,
            vec![
                vec!["d".into(), "repo".into()],
                vec!["maintainers".into(), m.hex.clone()],
            ],
            "",
        )
        .with_created_at(unix_now() + 1)
        .sign(&owner.keypair)
        .unwrap(),
    );

    // still served from cache
    let (_, cached) = send(&h.router, get(&info)).await;
    assert_eq!(cached, before);

    let (status, body) = send(
        &h.router,
        post_json(&format!("/api/repos/{}/repo/invalidate", owner.hex), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated"], json!(true));

    let (_, after) = send(&h.router, get(&info)).await;
    assert_eq!(after["maintainers"], json!([owner.hex, m.hex]));
}

#[tokio::test]
async fn test_admin_routes_require_basic_auth() {
    let owner = key(1);
    let h = harness(vec![announcement(&owner, "repo", vec![])], true);

    let (status, _) = send(&h.router, get("/api/attestations")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&h.router, basic(get("/api/attestations"), "admin", "wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&h.router, basic(get("/api/attestations"), "admin", "hunter2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], json!([]));

    // public routes stay open
    let (status, _) = send(&h.router, get(&format!("/api/repos/{}/repo", owner.hex))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_tick_endpoint_provisions_and_reports_attestations() {
    let owner = key(1);
    let h = harness(vec![announcement(&owner, "hosted", vec![])], false);

    let tick = || {
        Request::builder()
            .method("POST")
            .uri("/api/tick")
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&h.router, tick()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["created"], json!(1));

    // the repository now exists without a self-transfer
    let (_, body) = send(&h.router, tick()).await;
    assert_eq!(body["report"]["refreshed"], json!(1));

    let (_, body) = send(&h.router, get("/api/attestations")).await;
    let pending = body["pending"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["owner"], json!(owner.hex));
    assert_eq!(pending[0]["template"]["kind"], json!(KIND_OWNERSHIP_TRANSFER));
}
