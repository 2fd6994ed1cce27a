mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use recon_backend::models::ScanStatus;

async fn post_target(app: &TestApp, address: &str) -> serde_json::Value {
    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/api/targets",
            json!({ "name": "edge router", "address": address }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    extract_json(response).await
}

#[tokio::test]
async fn test_health_reports_memory_backend_and_load() {
    let app = create_test_app(3);
    let response = app
        .router()
        .oneshot(empty_request("GET", "/api/health"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = extract_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "recon-backend");
    assert_eq!(body["checks"]["database"]["backend"], "memory");
    assert_eq!(body["checks"]["scans"]["max_concurrent"], 3);
    assert_eq!(body["checks"]["scans"]["active"], 0);
}

#[tokio::test]
async fn test_target_create_get_and_list() {
    let app = create_test_app(1);
    let created = post_target(&app, " 192.168.1.10 ").await;
    assert_eq!(created["address"], "192.168.1.10");
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .router()
        .oneshot(empty_request("GET", &format!("/api/targets/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response).await["name"], "edge router");

    let response = app
        .router()
        .oneshot(empty_request("GET", "/api/targets?limit=10"))
        .await
        .unwrap();
    let list = extract_json(response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_target_address_validation() {
    let app = create_test_app(1);
    for address in ["", "-oN /tmp/x", "10.0.0.1 10.0.0.2"] {
        let response = app
            .router()
            .oneshot(json_request(
                "POST",
                "/api/targets",
                json!({ "name": "bad", "address": address }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{:?}", address);
        let body = extract_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }
}

#[tokio::test]
async fn test_unknown_target_is_404() {
    let app = create_test_app(1);
    let response = app
        .router()
        .oneshot(empty_request("GET", &format!("/api/targets/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = extract_json(response).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_create_scan_returns_status_snapshot() {
    let app = create_test_app(1);
    app.adapter.gate("10.20.0.1");
    let target = post_target(&app, "10.20.0.1").await;

    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/api/scans",
            json!({ "target_id": target["id"], "scanner": "line-stream", "args": "-sV" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = extract_json(response).await;
    assert_eq!(body["status"], "running");
    let scan_id: Uuid = body["scan_id"].as_str().unwrap().parse().unwrap();

    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/api/scans",
            json!({ "target_id": target["id"] }),
        ))
        .await
        .unwrap();
    let queued = extract_json(response).await;
    assert_eq!(queued["status"], "queued");
    assert_eq!(queued["queue_position"], 1);

    let response = app
        .router()
        .oneshot(empty_request("GET", "/api/scans/queue"))
        .await
        .unwrap();
    let state = extract_json(response).await;
    assert_eq!(state["active_count"], 1);
    assert_eq!(state["queue_size"], 1);
    assert_eq!(state["active_jobs"][0]["scan_id"], scan_id.to_string());

    app.adapter.release("10.20.0.1");
    app.wait_for(&scan_id, |j| j.status == ScanStatus::Completed).await;
}

#[tokio::test]
async fn test_plugin_scan_requires_plugin_name() {
    let app = create_test_app(1);
    let target = post_target(&app, "10.20.0.2").await;
    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/api/scans",
            json!({ "target_id": target["id"], "scanner": "plugin", "args": "  " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.adapter.started().is_empty());
}

#[tokio::test]
async fn test_scan_for_unknown_target_is_failed_immediately() {
    let app = create_test_app(1);
    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/api/scans",
            json!({ "target_id": Uuid::new_v4() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(extract_json(response).await["status"], "failed");
}

#[tokio::test]
async fn test_cancel_endpoint() {
    let app = create_test_app(1);
    app.adapter.gate("10.20.0.3");
    let target = app.create_target("10.20.0.3").await;
    let scan_id = app.submit(&target).await;

    let response = app
        .router()
        .oneshot(empty_request("POST", &format!("/api/scans/{}/cancel", scan_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response).await["accepted"], true);

    app.wait_for(&scan_id, |j| j.status == ScanStatus::Cancelled).await;

    let response = app
        .router()
        .oneshot(empty_request("POST", &format!("/api/scans/{}/cancel", scan_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response).await["accepted"], false);

    let response = app
        .router()
        .oneshot(empty_request(
            "POST",
            &format!("/api/scans/{}/cancel", Uuid::new_v4()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_endpoint_conflicts_on_running_scan() {
    let app = create_test_app(1);
    app.adapter.gate("10.20.0.4");
    let target = app.create_target("10.20.0.4").await;
    let scan_id = app.submit(&target).await;
    let uri = format!("/api/scans/{}", scan_id);

    let response = app.router().oneshot(empty_request("DELETE", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.manager().cancel(&scan_id);
    app.wait_for(&scan_id, |j| j.status.is_terminal()).await;

    let response = app.router().oneshot(empty_request("DELETE", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.router().oneshot(empty_request("GET", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_findings_flow_through_vulnerability_endpoints() {
    let app = create_test_app(1);
    app.adapter.script(
        "10.20.0.5",
        Script::Complete(single_port_report("10.20.0.5", 443, "https")),
    );
    let target = app.create_target("10.20.0.5").await;
    let scan_id = app.submit(&target).await;
    app.wait_for(&scan_id, |j| {
        j.status == ScanStatus::Completed && j.finding_count == 1
    })
    .await;

    let response = app
        .router()
        .oneshot(empty_request("GET", "/api/vulnerabilities"))
        .await
        .unwrap();
    let definitions = extract_json(response).await;
    assert_eq!(definitions[0]["name"], "Open Port 443/tcp (https)");
    assert_eq!(definitions[0]["severity"], "Info");

    let response = app
        .router()
        .oneshot(empty_request(
            "GET",
            &format!("/api/vulnerabilities/instances?scan_id={}", scan_id),
        ))
        .await
        .unwrap();
    let instances = extract_json(response).await;
    assert_eq!(instances.as_array().unwrap().len(), 1);
    assert_eq!(instances[0]["status"], "open");
    let instance_id = instances[0]["id"].as_str().unwrap().to_string();

    let response = app
        .router()
        .oneshot(json_request(
            "PATCH",
            &format!("/api/vulnerabilities/instances/{}", instance_id),
            json!({ "status": "false_positive" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response).await["status"], "false_positive");

    let response = app
        .router()
        .oneshot(json_request(
            "PATCH",
            &format!("/api/vulnerabilities/instances/{}", Uuid::new_v4()),
            json!({ "status": "fixed" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reingest_endpoint_is_idempotent() {
    let app = create_test_app(1);
    app.adapter.script(
        "10.20.0.6",
        Script::Complete(single_port_report("10.20.0.6", 25, "smtp")),
    );
    let target = app.create_target("10.20.0.6").await;
    let scan_id = app.submit(&target).await;
    app.wait_for(&scan_id, |j| {
        j.status == ScanStatus::Completed && j.finding_count == 1
    })
    .await;

    let response = app
        .router()
        .oneshot(empty_request("POST", &format!("/api/scans/{}/reingest", scan_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = extract_json(response).await;
    assert_eq!(summary["processed"], 1);
    assert_eq!(summary["definitions_created"], 0);
    assert_eq!(summary["instances_created"], 0);

    let job = app.job(&scan_id).await;
    assert_eq!(job.finding_count, 1);
    assert_eq!(job.severity_breakdown.get("Info"), Some(&1));
}

#[tokio::test]
async fn test_reingest_of_running_scan_conflicts() {
    let app = create_test_app(1);
    app.adapter.gate("10.20.0.7");
    let target = app.create_target("10.20.0.7").await;
    let scan_id = app.submit(&target).await;

    let response = app
        .router()
        .oneshot(empty_request("POST", &format!("/api/scans/{}/reingest", scan_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.adapter.release("10.20.0.7");
    app.wait_for(&scan_id, |j| j.status.is_terminal()).await;
}

#[tokio::test]
async fn test_scan_list_is_paged() {
    let app = create_test_app(4);
    let target = app.create_target("10.20.0.8").await;
    for _ in 0..3 {
        let scan_id = app.submit(&target).await;
        app.wait_for(&scan_id, |j| j.status.is_terminal()).await;
    }

    let response = app
        .router()
        .oneshot(empty_request("GET", "/api/scans?limit=2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response).await.as_array().unwrap().len(), 2);
}
