//! REST provider against an in-process stub API

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

use tidyrun_cleanup::{
    retry_failed_cleanups, CleanupExecutor, CleanupOptions, FailedCleanupStore, HandlerRegistry,
    RetryPolicy, TestIdentity,
};
use tidyrun_common::{
    CleanupConfig, HttpProviderConfig, ScanSource, SessionId, TrackedResource,
};

#[derive(Default)]
struct Stub {
    deleted: Mutex<Vec<String>>,
    refuse: Mutex<bool>,
}

async fn delete_row(State(stub): State<Arc<Stub>>, Path(id): Path<String>) -> StatusCode {
    if *stub.refuse.lock() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match id.as_str() {
        "missing" => StatusCode::NOT_FOUND,
        "locked" => StatusCode::FORBIDDEN,
        _ => {
            stub.deleted.lock().push(format!("row:{}", id));
            StatusCode::NO_CONTENT
        }
    }
}

async fn delete_user(State(stub): State<Arc<Stub>>, Path(id): Path<String>) -> StatusCode {
    stub.deleted.lock().push(format!("user:{}", id));
    StatusCode::NO_CONTENT
}

async fn list_users() -> Json<Value> {
    Json(json!({
        "total": 3,
        "users": [
            {"$id": "u-test", "email": "t@example.com", "$createdAt": "2024-05-01T12:00:00.000+00:00"},
            {"$id": "u-other", "email": "x@example.com", "$createdAt": "2024-05-01T12:05:00.000+00:00"},
            {"$id": "u-old", "email": "t@example.com", "$createdAt": "2024-04-01T00:00:00.000+00:00"}
        ]
    }))
}

async fn spawn_stub() -> (String, Arc<Stub>) {
    let stub = Arc::new(Stub::default());
    let app = Router::new()
        .route("/rows/:id", delete(delete_row))
        .route("/users/:id", delete(delete_user))
        .route("/users", get(list_users))
        .with_state(Arc::clone(&stub));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), stub)
}

fn http_config(endpoint: &str) -> CleanupConfig {
    let mut paths = BTreeMap::new();
    paths.insert("row".to_string(), "/rows/${id}".to_string());
    paths.insert("user".to_string(), "/users/${id}".to_string());
    CleanupConfig {
        provider: "http".into(),
        retries: 2,
        http: Some(HttpProviderConfig {
            endpoint: endpoint.to_string(),
            secret_headers: [("Authorization".to_string(), "Bearer s3cr3t".to_string())].into(),
            paths,
            scan: vec![ScanSource {
                resource_type: "user".into(),
                list_path: "/users".into(),
                items_pointer: "/users".into(),
                id_field: "$id".into(),
                created_field: "$createdAt".into(),
                permissions_field: "$permissions".into(),
            }],
            ..Default::default()
        }),
        ..CleanupConfig::default()
    }
}

#[tokio::test]
async fn deletes_rows_and_treats_404_as_done() {
    let (endpoint, stub) = spawn_stub().await;
    let config = http_config(&endpoint);
    let registry = HandlerRegistry::from_config(&config, std::path::Path::new(".")).unwrap();
    let executor = CleanupExecutor::new(Arc::new(registry));

    let resources = vec![
        TrackedResource::new("row", "r1"),
        TrackedResource::new("row", "missing"),
        TrackedResource::new("row", "locked"),
    ];
    let opts = CleanupOptions::from_config(&config).with_session(SessionId::from("sess_rest"));
    let report = executor.run(&resources, &opts).await;

    assert_eq!(report.deleted, vec!["row:r1", "row:missing"]);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].starts_with("row:locked ("));
    assert!(report.failed[0].contains("403"));
    assert_eq!(*stub.deleted.lock(), vec!["row:r1"]);
}

#[tokio::test]
async fn untracked_scan_removes_session_user_only() {
    let (endpoint, stub) = spawn_stub().await;
    let config = CleanupConfig {
        scan_untracked: true,
        ..http_config(&endpoint)
    };
    let registry = HandlerRegistry::from_config(&config, std::path::Path::new(".")).unwrap();
    let executor = CleanupExecutor::new(Arc::new(registry));

    let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let opts = CleanupOptions {
        identity: TestIdentity {
            user_id: Some("u-test".into()),
            email: Some("t@example.com".into()),
            team_ids: vec![],
            created_at: Some(created),
        },
        ..CleanupOptions::from_config(&config)
    }
    .with_session(SessionId::from("sess_scan"));

    let report = executor.run(&[], &opts).await;
    assert!(report.success);
    assert_eq!(report.deleted, vec!["user:u-test"]);
    assert_eq!(*stub.deleted.lock(), vec!["user:u-test"]);

    // A later start time excludes the user.
    stub.deleted.lock().clear();
    let opts = CleanupOptions {
        test_start_time: Some(created + Duration::hours(1)),
        ..opts
    };
    let report = executor.run(&[], &opts).await;
    assert!(report.deleted.is_empty());
}

#[tokio::test]
async fn failed_records_are_retried_and_removed() {
    let (endpoint, stub) = spawn_stub().await;
    let dir = TempDir::new().unwrap();
    let store = FailedCleanupStore::new(dir.path());
    let config = http_config(&endpoint);

    *stub.refuse.lock() = true;
    let registry = HandlerRegistry::from_config(&config, std::path::Path::new(".")).unwrap();
    let executor = CleanupExecutor::new(Arc::new(registry)).with_store(store.clone());
    let opts = CleanupOptions {
        retry: RetryPolicy::new(1),
        ..CleanupOptions::from_config(&config)
    }
    .with_session(SessionId::from("sess_retry"));
    let report = executor.run(&[TrackedResource::new("row", "r9")], &opts).await;
    assert!(!report.success);

    let raw = std::fs::read_to_string(store.path_for(&SessionId::from("sess_retry"))).unwrap();
    assert!(!raw.contains("s3cr3t"));

    *stub.refuse.lock() = false;
    let outcomes = retry_failed_cleanups(&store, Some(&config), dir.path())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].removed);
    assert_eq!(outcomes[0].report.deleted, vec!["row:r9"]);
    assert!(store.list().unwrap().is_empty());
    assert_eq!(*stub.deleted.lock(), vec!["row:r9"]);
}
