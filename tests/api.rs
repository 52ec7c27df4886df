//! HTTP surface tests against an in-memory state.
//!
//! Only store-backed endpoints are exercised here — bus-backed paths need
//! the cellular daemon and are covered at the component level.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use mifictl::auth::DEFAULT_PASSWORD;
use mifictl::routes::build_router;
use mifictl::{AppState, Config};

async fn state() -> AppState {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();
    // Leak the tempdir so paths stay valid for the whole test.
    std::mem::forget(dir);

    let mut config = Config::default();
    config.usb.mode_cfg = format!("{root}/mode.cfg");
    config.usb.mode_tmp_cfg = format!("{root}/mode_tmp.cfg");
    config.usb.gadget_root = format!("{root}/gadget");
    config.usb.udc_class_dir = format!("{root}/udc");
    config.rathole.bin_path = format!("{root}/rathole");
    config.rathole.config_path = format!("{root}/client.toml");
    config.rathole.log_path = format!("{root}/rathole.log");
    config.rathole.pid_path = format!("{root}/rathole.pid");

    AppState::build_in_memory(config).await.unwrap()
}

async fn request(
    app: axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn login(state: &AppState) -> String {
    let (status, body) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/login",
        None,
        Some(serde_json::json!({"password": DEFAULT_PASSWORD})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn options_returns_cors_headers() {
    let state = state().await;
    let app = build_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/sms")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(
        headers["access-control-allow-methods"],
        "GET, POST, DELETE, OPTIONS"
    );
    assert_eq!(headers["access-control-allow-headers"], "Content-Type");
}

#[tokio::test]
async fn authed_endpoint_rejects_missing_and_bad_tokens() {
    let state = state().await;

    let (status, _) = request(build_router(state.clone()), "GET", "/api/sms", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(
        build_router(state),
        "GET",
        "/api/sms",
        Some("deadbeefdeadbeefdeadbeefdeadbeef"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_logout_flow() {
    let state = state().await;

    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/login",
        None,
        Some(serde_json::json!({"password": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = login(&state).await;

    let (status, body) = request(
        build_router(state.clone()),
        "GET",
        "/api/auth/status",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logged_in"], Value::Bool(true));

    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/logout",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(build_router(state), "GET", "/api/sms", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn security_recovery_flow() {
    let state = state().await;
    let token = login(&state).await;

    // Questions start unset.
    let (status, body) = request(
        build_router(state.clone()),
        "GET",
        "/api/auth/security/status",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_set"], Value::Bool(false));

    // Set them (authenticated).
    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/security/setup",
        Some(&token),
        Some(serde_json::json!({
            "question1": "first pet", "answer1": "rex",
            "question2": "home town", "answer2": "leiden",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Second setup attempt is rejected with the distinguishable code.
    let (status, body) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/security/setup",
        Some(&token),
        Some(serde_json::json!({
            "question1": "other", "answer1": "x",
            "question2": "other2", "answer2": "y",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "ALREADY_SET");

    // Change the password, then recover it without a token.
    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/password",
        Some(&token),
        Some(serde_json::json!({
            "old_password": DEFAULT_PASSWORD,
            "new_password": "hunter2",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Wrong answers fail.
    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/security/reset-password",
        None,
        Some(serde_json::json!({
            "answer1": "rex", "answer2": "utrecht", "confirm": "已知晓风险",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Missing confirmation constant fails.
    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/security/reset-password",
        None,
        Some(serde_json::json!({
            "answer1": "rex", "answer2": "leiden", "confirm": "yes",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Correct answers + constant reset to the default password.
    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/auth/security/reset-password",
        None,
        Some(serde_json::json!({
            "answer1": "rex", "answer2": "leiden", "confirm": "已知晓风险",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        build_router(state),
        "POST",
        "/api/auth/login",
        None,
        Some(serde_json::json!({"password": DEFAULT_PASSWORD})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn ipv6_rule_crud_over_http() {
    let state = state().await;
    let token = login(&state).await;

    let (status, body) = request(
        build_router(state.clone()),
        "POST",
        "/api/ipv6-proxy/rules",
        Some(&token),
        Some(serde_json::json!({"local_port": 80, "ipv6_port": 8080})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["data"]["id"].as_i64().unwrap();

    let (status, body) = request(
        build_router(state.clone()),
        "GET",
        "/api/ipv6-proxy/rules",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rules = body["data"].as_array().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0]["local_port"], 80);
    assert_eq!(rules[0]["ipv6_port"], 8080);
    assert_eq!(rules[0]["enabled"], Value::Bool(true));

    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/ipv6-proxy/rules",
        Some(&token),
        Some(serde_json::json!({"local_port": 80, "ipv6_port": 70000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        build_router(state.clone()),
        "DELETE",
        &format!("/api/ipv6-proxy/rules/{id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        build_router(state),
        "DELETE",
        &format!("/api/ipv6-proxy/rules/{id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ipv6_config_autostart_coupling_over_http() {
    let state = state().await;
    let token = login(&state).await;

    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/ipv6-proxy/config",
        Some(&token),
        Some(serde_json::json!({
            "enabled": false,
            "auto_start": true,
            "send_enabled": false,
            "send_interval": 30,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        build_router(state),
        "GET",
        "/api/ipv6-proxy/config",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], Value::Bool(true));
    assert_eq!(body["data"]["auto_start"], Value::Bool(true));
    assert_eq!(body["data"]["send_interval"], 30);
}

#[tokio::test]
async fn rathole_config_and_server_export_over_http() {
    let state = state().await;
    let token = login(&state).await;

    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/rathole/config",
        Some(&token),
        Some(serde_json::json!({
            "server_addr": "198.51.100.5:2333",
            "auto_start": false,
            "enabled": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/rathole/services",
        Some(&token),
        Some(serde_json::json!({
            "name": "web", "token": "t1", "local_addr": "127.0.0.1:80",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        build_router(state.clone()),
        "GET",
        "/api/rathole/server-config",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let toml = body["data"]["config"].as_str().unwrap();
    assert!(toml.contains("bind_addr = \"[::]:2333\""));
    assert!(toml.contains("[server.services.web]"));

    let (status, body) = request(
        build_router(state),
        "GET",
        "/api/rathole/status",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["running"], Value::Bool(false));
    assert_eq!(body["data"]["service_count"], 1);
}

#[tokio::test]
async fn usb_mode_endpoint_roundtrip() {
    let state = state().await;
    let token = login(&state).await;

    let (status, body) = request(
        build_router(state.clone()),
        "POST",
        "/api/usb/mode",
        Some(&token),
        Some(serde_json::json!({"mode": "cdc_ncm", "permanent": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Code"], 0);

    let (status, body) = request(
        build_router(state.clone()),
        "GET",
        "/api/usb/mode",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Data"]["mode"], "cdc_ncm");
    assert_eq!(body["Data"]["mode_value"], 1);
    assert_eq!(body["Data"]["is_temporary"], Value::Bool(false));

    let (status, body) = request(
        build_router(state),
        "POST",
        "/api/usb/mode",
        Some(&token),
        Some(serde_json::json!({"mode": "nonsense"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Code"], 1);
}

#[tokio::test]
async fn apn_template_crud_over_http() {
    let state = state().await;
    let token = login(&state).await;

    let (status, body) = request(
        build_router(state.clone()),
        "POST",
        "/api/apn/templates",
        Some(&token),
        Some(serde_json::json!({"name": "cmnet", "apn": "cmnet"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["data"]["id"].as_i64().unwrap();

    // Duplicate name is a client error.
    let (status, _) = request(
        build_router(state.clone()),
        "POST",
        "/api/apn/templates",
        Some(&token),
        Some(serde_json::json!({"name": "cmnet", "apn": "other"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        build_router(state.clone()),
        "PUT",
        &format!("/api/apn/templates/{id}"),
        Some(&token),
        Some(serde_json::json!({"name": "cmnet", "apn": "cmnet2", "protocol": "ipv6"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        build_router(state.clone()),
        "GET",
        "/api/apn/templates",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["apn"], "cmnet2");

    let (status, _) = request(
        build_router(state),
        "DELETE",
        &format!("/api/apn/templates/{id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_api_path_is_404() {
    let state = state().await;
    let app = build_router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn root_serves_landing_page() {
    let state = state().await;
    let app = build_router(state);
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("mifictl"));
}
