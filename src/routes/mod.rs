//! HTTP route handlers.
//!
//! One sub-module per endpoint family; handlers are thin decode → component
//! → encode shims. Two response envelopes coexist (both are API contract):
//! the legacy `{"Code":0,"Error":"","Data":…}` shape on the oldest
//! endpoints and `{"status":"ok","message":…,"data":…}` on the rest. Which
//! shape an endpoint uses is fixed — clients pattern-match on it.

pub mod apn;
pub mod assets;
pub mod auth;
pub mod data;
pub mod info;
pub mod ipv6;
pub mod modem;
pub mod rathole;
pub mod sms;
pub mod usb;

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Legacy success envelope.
pub(crate) fn ok_legacy(data: Value) -> Json<Value> {
    Json(json!({"Code": 0, "Error": "", "Data": data}))
}

/// Legacy failure envelope (HTTP 200 with a non-zero code, as the oldest
/// clients expect).
pub(crate) fn err_legacy(message: impl Into<String>) -> Json<Value> {
    Json(json!({"Code": 1, "Error": message.into(), "Data": null}))
}

/// Newer success envelope.
pub(crate) fn ok_status(message: impl Into<String>, data: Value) -> Json<Value> {
    Json(json!({"status": "ok", "message": message.into(), "data": data}))
}

/// Newer failure reported in-band (HTTP 200), used where the original did.
pub(crate) fn soft_error(message: impl Into<String>) -> Json<Value> {
    Json(json!({"status": "error", "message": message.into()}))
}

/// Error with a real HTTP status.
pub(crate) fn api_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": message.into()})))
}

pub(crate) type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// CORS contract: every endpoint answers OPTIONS with 200 and the
/// preflight headers; every other response carries the allow-origin header.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return (
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    "GET, POST, DELETE, OPTIONS",
                ),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
            ],
            StatusCode::OK,
        )
            .into_response();
    }

    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// Assemble the full application router.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/status", get(auth::status))
        .route("/api/auth/security/status", get(auth::security_status))
        .route("/api/auth/security/questions", get(auth::security_questions))
        .route("/api/auth/security/verify", post(auth::security_verify))
        .route(
            "/api/auth/security/reset-password",
            post(auth::security_reset_password),
        );

    let authed = Router::new()
        .route("/api/info", get(info::info))
        .route("/api/at", post(modem::execute_at))
        .route("/api/set_network", post(modem::set_network))
        .route("/api/switch", post(modem::switch_slot))
        .route("/api/airplane_mode", post(modem::airplane_mode))
        .route("/api/current_band", get(modem::current_band))
        .route("/api/data", get(data::data_get).post(data::data_set))
        .route("/api/roaming", get(data::roaming_get).post(data::roaming_set))
        .route("/api/sms", get(sms::list).post(sms::send))
        .route("/api/sms/sent", get(sms::sent_list))
        .route("/api/sms/sent/{id}", delete(sms::sent_delete))
        .route(
            "/api/sms/webhook",
            get(sms::webhook_get).post(sms::webhook_save),
        )
        .route("/api/sms/webhook/test", post(sms::webhook_test))
        .route("/api/sms/webhook-logs", get(sms::webhook_logs))
        .route("/api/sms/config", get(sms::config_get).post(sms::config_save))
        .route("/api/sms/fix", get(sms::fix_get).post(sms::fix_set))
        .route("/api/sms/{id}", delete(sms::delete))
        .route(
            "/api/apn/templates",
            get(apn::templates_list).post(apn::templates_create),
        )
        .route(
            "/api/apn/templates/{id}",
            put(apn::templates_update).delete(apn::templates_delete),
        )
        .route("/api/apn/config", get(apn::config_get).post(apn::config_set))
        .route("/api/apn/apply", post(apn::apply))
        .route("/api/apn/clear", post(apn::clear))
        .route(
            "/api/rathole/config",
            get(rathole::config_get).post(rathole::config_set),
        )
        .route("/api/rathole/autostart", post(rathole::autostart))
        .route(
            "/api/rathole/services",
            get(rathole::services_list).post(rathole::service_add),
        )
        .route(
            "/api/rathole/services/{id}",
            put(rathole::service_update).delete(rathole::service_delete),
        )
        .route("/api/rathole/start", post(rathole::start))
        .route("/api/rathole/stop", post(rathole::stop))
        .route("/api/rathole/status", get(rathole::status))
        .route("/api/rathole/logs", get(rathole::logs))
        .route("/api/rathole/server-config", get(rathole::server_config))
        .route("/api/rathole/install-script", get(rathole::install_script))
        .route(
            "/api/ipv6-proxy/config",
            get(ipv6::config_get).post(ipv6::config_set),
        )
        .route(
            "/api/ipv6-proxy/rules",
            get(ipv6::rules_list).post(ipv6::rule_add),
        )
        .route(
            "/api/ipv6-proxy/rules/{id}",
            put(ipv6::rule_update).delete(ipv6::rule_delete),
        )
        .route("/api/ipv6-proxy/start", post(ipv6::start))
        .route("/api/ipv6-proxy/stop", post(ipv6::stop))
        .route("/api/ipv6-proxy/restart", post(ipv6::restart))
        .route("/api/ipv6-proxy/send", post(ipv6::send_now))
        .route("/api/ipv6-proxy/test", post(ipv6::test_send))
        .route("/api/ipv6-proxy/status", get(ipv6::status))
        .route("/api/ipv6-proxy/send-logs", get(ipv6::send_logs))
        .route("/api/usb/mode", get(usb::mode_get).post(usb::mode_set))
        .route("/api/usb-advance", post(usb::advance))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/password", post(auth::change_password))
        .route("/api/auth/security/setup", post(auth::security_setup))
        .route(
            "/api/auth/security/factory-reset",
            post(auth::security_factory_reset),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_token,
        ));

    Router::new()
        .merge(public)
        .merge(authed)
        .fallback(assets::fallback)
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
