//! API tests against a real server on an ephemeral port, with the
//! scheduler running no supervisors so every state change observed is
//! the handler's own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode as AxumStatusCode;
use axum::routing::post;
use reqwest::StatusCode;
use serde_json::{json, Value};

use elrond_core::model::RingState;
use elrond_core::store::Store;
use elrond_core::supervisor::Scheduler;
use elrond_core::webhook::WebhookSender;
use elrond_server::api::{self, AppState};

async fn spawn_server() -> (String, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        scheduler: Arc::new(Scheduler::new(Vec::new(), Duration::ZERO)),
        webhooks: WebhookSender::new(),
        environment: "test".to_string(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });

    (format!("http://{addr}"), store)
}

/// A webhook receiver counting deliveries.
async fn spawn_webhook_capture() -> (String, Arc<AtomicUsize>) {
    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deliveries);

    let app = axum::Router::new().route(
        "/hook",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                AxumStatusCode::OK
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/hook"), deliveries)
}

async fn create_ring(client: &reqwest::Client, base: &str, name: &str, priority: i64) -> Value {
    let response = client
        .post(format!("{base}/api/rings"))
        .json(&json!({
            "name": name,
            "priority": priority,
            "soakTime": 60,
            "image": "app",
            "version": "0.9",
            "installationGroup": {
                "name": format!("{name}-group"),
                "soakTime": 30,
                "provisionerGroupID": format!("pg-{name}"),
            },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    response.json().await.unwrap()
}

fn make_stable(store: &Store, ring_id: &str) {
    let mut ring = store.get_ring(ring_id).unwrap().unwrap();
    ring.state = RingState::Stable;
    store.update_ring(&ring).unwrap();
}

#[tokio::test]
async fn create_and_fetch_ring() {
    let (base, _store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();
    assert_eq!(id.len(), 26);
    assert_eq!(ring["state"], "creation-requested");
    assert_eq!(ring["priority"], 1);
    assert_eq!(ring["installationGroups"][0]["name"], "ring-0-group");

    let detail: Value = client
        .get(format!("{base}/api/ring/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["id"], *id);
    assert_eq!(detail["installationGroups"][0]["provisionerGroupID"], "pg-ring-0");

    let listing: Value = client
        .get(format!("{base}/api/rings"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn create_ring_requires_positive_priority() {
    let (base, _store) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/rings"))
        .json(&json!({"name": "ring-0", "priority": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_ring_is_404() {
    let (base, _store) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/api/ring/00000000000000000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// API security lock: the release is refused, the ring does not change
// state, and no webhook is emitted.
#[tokio::test]
async fn security_lock_blocks_release_without_webhook() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();
    make_stable(&store, id);

    let (hook_url, deliveries) = spawn_webhook_capture().await;
    let response = client
        .post(format!("{base}/api/webhooks"))
        .json(&json!({"ownerID": "tests", "url": hook_url}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = client
        .post(format!("{base}/api/security/ring/{id}/api/lock"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .post(format!("{base}/api/ring/{id}/release"))
        .json(&json!({"image": "app", "version": "1.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 0);
    assert_eq!(store.get_ring(id).unwrap().unwrap().state, RingState::Stable);

    // Unlocking lets the same release through, and the webhook fires.
    let response = client
        .post(format!("{base}/api/security/ring/{id}/api/unlock"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .post(format!("{base}/api/ring/{id}/release"))
        .json(&json!({"image": "app", "version": "1.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        store.get_ring(id).unwrap().unwrap().state,
        RingState::ReleasePending
    );

    for _ in 0..50 {
        if deliveries.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(deliveries.load(Ordering::SeqCst) >= 1);
}

// Submitting an identical release twice binds the ring to the same
// release record and grows the release table by exactly one.
#[tokio::test]
async fn identical_releases_dedupe() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();
    make_stable(&store, id);

    let releases_before = store.count_ring_releases().unwrap();

    let body = json!({"image": "app", "version": "1.0", "envVariables": {"K": "v"}});
    let first: Value = client
        .post(format!("{base}/api/ring/{id}/release"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = client
        .post(format!("{base}/api/ring/{id}/release"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(first["desiredReleaseID"], second["desiredReleaseID"]);
    assert_eq!(store.count_ring_releases().unwrap(), releases_before + 1);

    let release_id = first["desiredReleaseID"].as_str().unwrap();
    let release: Value = client
        .get(format!("{base}/api/release/{release_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(release["image"], "app");
    assert_eq!(release["envVariables"]["K"], "v");
}

#[tokio::test]
async fn release_all_is_refused_while_a_release_is_pending() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    for (name, priority) in [("ring-1", 1), ("ring-2", 2)] {
        let ring = create_ring(&client, &base, name, priority).await;
        make_stable(&store, ring["id"].as_str().unwrap());
    }

    let body = json!({"image": "app", "version": "1.0"});
    let response = client
        .post(format!("{base}/api/rings/release"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let released: Value = response.json().await.unwrap();
    assert_eq!(released.as_array().unwrap().len(), 2);

    let response = client
        .post(format!("{base}/api/rings/release"))
        .json(&json!({"image": "app", "version": "2.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn pause_resume_cancel_round_trip() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap().to_string();
    make_stable(&store, &id);

    let response = client
        .post(format!("{base}/api/rings/release"))
        .json(&json!({"image": "app", "version": "1.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        store.get_ring(&id).unwrap().unwrap().state,
        RingState::ReleasePending
    );

    let response = client
        .post(format!("{base}/api/rings/release/pause"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        store.get_ring(&id).unwrap().unwrap().state,
        RingState::ReleasePaused
    );

    let response = client
        .post(format!("{base}/api/rings/release/resume"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        store.get_ring(&id).unwrap().unwrap().state,
        RingState::ReleasePending
    );

    let response = client
        .post(format!("{base}/api/rings/release/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let cancelled = store.get_ring(&id).unwrap().unwrap();
    assert_eq!(cancelled.state, RingState::Stable);
    assert_eq!(cancelled.desired_release_id, cancelled.active_release_id);
}

#[tokio::test]
async fn row_lock_contention_is_409() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();
    assert!(store.lock_ring(id, "another-instance").unwrap());

    let response = client
        .post(format!("{base}/api/ring/{id}/update"))
        .json(&json!({"name": "renamed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn duplicate_membership_is_409() {
    let (base, _store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();

    let body = json!({"name": "ring-0-group", "soakTime": 30, "provisionerGroupID": "pg-ring-0"});
    let response = client
        .post(format!("{base}/api/ring/{id}/installationgroup"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn webhook_registration_round_trip() {
    let (base, _store) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/webhooks"))
        .json(&json!({"ownerID": "tests", "url": "https://hooks.example.com/a"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let webhook: Value = response.json().await.unwrap();
    let webhook_id = webhook["id"].as_str().unwrap();

    // Same live URL again is a conflict.
    let response = client
        .post(format!("{base}/api/webhooks"))
        .json(&json!({"ownerID": "tests", "url": "https://hooks.example.com/a"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let listing: Value = client
        .get(format!("{base}/api/webhooks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 1);

    let response = client
        .delete(format!("{base}/api/webhook/{webhook_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let listing: Value = client
        .get(format!("{base}/api/webhooks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn update_patches_only_supplied_fields() {
    let (base, _store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();

    let updated: Value = client
        .post(format!("{base}/api/ring/{id}/update"))
        .json(&json!({"priority": 3}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(updated["priority"], 3);
    // Untouched fields keep their values.
    assert_eq!(updated["name"], "ring-0");
    assert_eq!(updated["soakTime"], 60);
}

#[tokio::test]
async fn retry_creation_is_rejected_for_a_stable_ring() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();
    make_stable(&store, id);

    let response = client
        .post(format!("{base}/api/ring/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The failed retry released its row lock; later writes still work.
    let response = client
        .post(format!("{base}/api/ring/{id}/update"))
        .json(&json!({"name": "renamed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn ring_listing_pages() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    for (name, priority) in [("ring-1", 1), ("ring-2", 2), ("ring-3", 3)] {
        let ring = create_ring(&client, &base, name, priority).await;
        make_stable(&store, ring["id"].as_str().unwrap());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let page: Value = client
        .get(format!("{base}/api/rings?page=0&per_page=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page.as_array().unwrap().len(), 2);
    assert_eq!(page[0]["name"], "ring-1");

    let page: Value = client
        .get(format!("{base}/api/rings?page=1&per_page=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["name"], "ring-3");
}

#[tokio::test]
async fn delete_requests_ring_deletion() {
    let (base, store) = spawn_server().await;
    let client = reqwest::Client::new();

    let ring = create_ring(&client, &base, "ring-0", 1).await;
    let id = ring["id"].as_str().unwrap();
    make_stable(&store, id);

    let response = client
        .delete(format!("{base}/api/ring/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        store.get_ring(id).unwrap().unwrap().state,
        RingState::DeletionRequested
    );
}
