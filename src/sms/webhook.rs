//! Webhook delivery for incoming SMS.
//!
//! The body template knows `#{sender}`, `#{content}` and `#{time}`,
//! substituted in a single pass. Custom headers are one `Name: value` per
//! line; when none of them declares a Content-Type, `application/json` is
//! injected. Delivery is capped at 10 s total and never retried — the log
//! ring records each attempt and the caller decides.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::util::{local_time_string, substitute, unix_timestamp};

/// Total time budget per delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory log capacity.
const LOG_CAPACITY: usize = 100;

/// Client-side failure markers. A response carrying one of these came from
/// the transport, not the remote service.
const CLIENT_ERROR_MARKERS: [&str; 4] = [
    "curl:",
    "Could not resolve",
    "Connection refused",
    "Connection timed out",
];

/// Webhook configuration singleton (SMS).
#[derive(Debug, Clone, Serialize)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub platform: String,
    pub url: String,
    pub body: String,
    pub headers: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            platform: "pushplus".to_string(),
            url: String::new(),
            body: String::new(),
            headers: String::new(),
        }
    }
}

/// One delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookLogEntry {
    pub id: i64,
    pub sender: String,
    pub request: String,
    pub response: String,
    /// 1 = delivered, 0 = failed.
    pub result: i64,
    pub created_at: i64,
}

/// Fixed-size ring of delivery attempts, newest first on read.
pub struct WebhookLogRing {
    inner: Mutex<RingState>,
    capacity: usize,
}

struct RingState {
    entries: VecDeque<WebhookLogEntry>,
    next_id: i64,
}

impl WebhookLogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingState {
                entries: VecDeque::with_capacity(capacity),
                next_id: 0,
            }),
            capacity,
        }
    }

    pub fn sms_default() -> Self {
        Self::new(LOG_CAPACITY)
    }

    pub fn push(&self, sender: &str, request: &str, response: &str, ok: bool) {
        let mut inner = self.inner.lock().expect("webhook log lock");
        inner.next_id += 1;
        let entry = WebhookLogEntry {
            id: inner.next_id,
            sender: sender.to_string(),
            request: request.to_string(),
            response: response.to_string(),
            result: i64::from(ok),
            created_at: unix_timestamp(),
        };
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
    }

    /// Newest-first snapshot, at most `max` entries.
    pub fn recent(&self, max: usize) -> Vec<WebhookLogEntry> {
        let inner = self.inner.lock().expect("webhook log lock");
        inner.entries.iter().rev().take(max).cloned().collect()
    }

    /// Request field of the newest entry, for tests and status displays.
    pub fn latest_request(&self) -> Option<String> {
        let inner = self.inner.lock().expect("webhook log lock");
        inner.entries.back().map(|e| e.request.clone())
    }
}

/// Render the body template for a message.
pub fn render_body(template: &str, sender: &str, content: &str) -> String {
    substitute(
        template,
        &[
            ("sender", sender),
            ("content", content),
            ("time", &local_time_string()),
        ],
    )
}

/// Parse the multiline header block into name/value pairs. Lines without a
/// colon are ignored; surrounding whitespace and CRs are trimmed.
pub fn parse_headers(block: &str) -> Vec<(String, String)> {
    block
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_end_matches('\r');
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Delivery outcome rule: success iff the response is non-empty and carries
/// no client-side failure marker.
pub fn is_delivery_success(response: &str) -> bool {
    !response.is_empty() && !CLIENT_ERROR_MARKERS.iter().any(|m| response.contains(m))
}

/// POST `body` to `url` with the configured headers. Returns the response
/// text (or the transport error rendered as text) and the outcome.
pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    headers_block: &str,
    body: String,
) -> (String, bool) {
    let headers = parse_headers(headers_block);
    let mut request = client.post(url).timeout(DELIVERY_TIMEOUT);

    let has_content_type = headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
    if !has_content_type {
        request = request.header("Content-Type", "application/json");
    }
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }

    debug!(url, "webhook POST");
    let response = match request.body(body).send().await {
        Ok(resp) => match resp.text().await {
            Ok(text) => text,
            Err(e) => format!("Connection refused: {e}"),
        },
        Err(e) if e.is_timeout() => format!("Connection timed out: {e}"),
        Err(e) if e.is_connect() => format!("Connection refused: {e}"),
        Err(e) => format!("Could not resolve or deliver: {e}"),
    };

    let ok = is_delivery_success(&response);
    info!(ok, "webhook delivery finished");
    (response, ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_body_substitutes_all_variables() {
        let body = render_body("{\"s\":\"#{sender}\",\"c\":\"#{content}\"}", "+100", "hello");
        assert_eq!(body, "{\"s\":\"+100\",\"c\":\"hello\"}");
    }

    #[test]
    fn render_body_does_not_reexpand_values() {
        let body = render_body("#{content}", "+1", "#{sender}");
        assert_eq!(body, "#{sender}");
    }

    #[test]
    fn parse_headers_handles_crlf_and_blank_lines() {
        let block = "X-Token: abc\r\n\r\nContent-Type: text/plain\r\nnot a header\n";
        let headers = parse_headers(block);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("X-Token".to_string(), "abc".to_string()));
        assert_eq!(
            headers[1],
            ("Content-Type".to_string(), "text/plain".to_string())
        );
    }

    #[test]
    fn delivery_success_rule() {
        assert!(is_delivery_success("{\"code\":200}"));
        assert!(!is_delivery_success(""));
        assert!(!is_delivery_success("curl: (6) Could not resolve host"));
        assert!(!is_delivery_success("Connection refused"));
        assert!(!is_delivery_success("Connection timed out after 10s"));
    }

    #[test]
    fn ring_caps_at_capacity_and_reads_newest_first() {
        let ring = WebhookLogRing::new(3);
        for i in 0..5 {
            ring.push("+1", &format!("req{i}"), "ok", true);
        }
        let recent = ring.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].request, "req4");
        assert_eq!(recent[2].request, "req2");
        // IDs keep climbing past the cap.
        assert_eq!(recent[0].id, 5);
        assert_eq!(ring.latest_request().as_deref(), Some("req4"));
    }

    #[test]
    fn ring_recent_respects_max() {
        let ring = WebhookLogRing::new(10);
        for i in 0..6 {
            ring.push("+1", &format!("req{i}"), "", false);
        }
        let recent = ring.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request, "req5");
    }
}
