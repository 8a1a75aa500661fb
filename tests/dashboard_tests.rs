
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

use buildfarm::daemon::{DaemonStatus, GroupStatus};
use buildfarm::dashboard::{router, DashboardState};
use buildfarm::vm::VmManager;
use test_harness::{memory_store, ready_vm, vm_manager, DownStore};

fn test_app(status: DaemonStatus, vms: VmManager) -> (Router, watch::Sender<DaemonStatus>) {
    let (tx, rx) = watch::channel(status);
    (router(DashboardState { status: rx, vms }), tx)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_status_endpoint() {
    let status = DaemonStatus {
        running: true,
        server_start: None,
        last_cycle: None,
        groups: vec![GroupStatus {
            group_id: 0,
            name: "PC".to_string(),
            max_workers: 2,
            workers: 1,
        }],
    };
    let (app, _tx) = test_app(status, vm_manager(memory_store()));

    let (code, json) = get_json(app, "/api/status").await;

    assert_eq!(code, StatusCode::OK);
    assert_eq!(json["running"], true);
    assert_eq!(json["groups"][0]["name"], "PC");
    assert_eq!(json["groups"][0]["workers"], 1);
    assert_eq!(json["groups"][0]["max_workers"], 2);
}

#[tokio::test]
async fn test_status_follows_latest_snapshot() {
    let (app, tx) = test_app(DaemonStatus::default(), vm_manager(memory_store()));
    tx.send_replace(DaemonStatus {
        running: true,
        ..DaemonStatus::default()
    });

    let (_, json) = get_json(app, "/api/status").await;
    assert_eq!(json["running"], true);
}

#[tokio::test]
async fn test_vms_endpoint_lists_sorted_descriptors() {
    let vms = vm_manager(memory_store());
    ready_vm(&vms, "vm-b", "10.0.0.2", 0).await;
    ready_vm(&vms, "vm-a", "10.0.0.1", 1).await;
    vms.acquire_vm(1, "worker-1-0", "task-9", Utc::now()).await.unwrap();
    let (app, _tx) = test_app(DaemonStatus::default(), vms);

    let (code, json) = get_json(app, "/api/vms").await;

    assert_eq!(code, StatusCode::OK);
    let list = json.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["vm_name"], "vm-a");
    assert_eq!(list[0]["state"], "in_use");
    assert_eq!(list[0]["bound_to"], "worker-1-0");
    assert_eq!(list[1]["vm_name"], "vm-b");
    assert_eq!(list[1]["state"], "ready");
}

#[tokio::test]
async fn test_vms_endpoint_store_down() {
    let vms = vm_manager(Arc::new(DownStore));
    let (app, _tx) = test_app(DaemonStatus::default(), vms);

    let (code, json) = get_json(app, "/api/vms").await;

    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("unavailable"));
}

#[tokio::test]
async fn test_unknown_route() {
    let (app, _tx) = test_app(DaemonStatus::default(), vm_manager(memory_store()));

    let response = app
        .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
