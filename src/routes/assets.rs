//! Embedded web UI fallback.
//!
//! Non-`/api/` paths go through the asset resolver. The UI bundle itself is
//! packed by the firmware build and is opaque to this daemon; the stub here
//! serves a minimal landing page at `/` so a bare device is still
//! recognisable, and 404s everything else.

use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

const INDEX_HTML: &str = "<!doctype html>\n<html><head><title>mifictl</title></head>\
<body><h1>mifictl</h1><p>Management API is up. The web UI bundle is not installed.</p>\
</body></html>\n";

/// Resolve an embedded asset. Returns body + content type on a hit.
fn resolve(path: &str) -> Option<(&'static str, &'static str)> {
    match path {
        "/" | "/index.html" => Some((INDEX_HTML, "text/html; charset=utf-8")),
        _ => None,
    }
}

/// Router fallback: asset hit or 404.
pub async fn fallback(uri: Uri) -> Response {
    match resolve(uri.path()) {
        Some((body, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Endpoint not found").into_response(),
    }
}
