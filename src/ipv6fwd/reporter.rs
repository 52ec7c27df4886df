//! Periodic IPv6 address reporter.
//!
//! When reporting is enabled, a timer fires every `send_interval` minutes
//! and POSTs the device's global IPv6 address to the configured webhook.
//! The body template knows `#{ipv6}` (and its `#{sender}` alias),
//! `#{port}`, `#{link}` and `#{time}`. A failed attempt retries up to 30
//! times at 10 s intervals; the manual "test" path tries exactly once.
//! Every attempt lands in a 30-entry in-memory ring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::sms::webhook;
use crate::util::{local_time_string, substitute, unix_timestamp};

use super::{Ipv6Config, Ipv6Forwarder};

/// Ring capacity.
const LOG_CAPACITY: usize = 30;
/// Retry ladder: 30 attempts, 10 s apart.
const MAX_RETRIES: u32 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// One report attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SendLogEntry {
    pub id: i64,
    pub ipv6: String,
    pub content: String,
    pub response: String,
    pub result: i64,
    pub created_at: i64,
}

/// Fixed-size ring of report attempts.
pub struct SendLogRing {
    inner: Mutex<RingState>,
}

struct RingState {
    entries: VecDeque<SendLogEntry>,
    next_id: i64,
}

impl SendLogRing {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingState {
                entries: VecDeque::with_capacity(LOG_CAPACITY),
                next_id: 0,
            }),
        }
    }

    fn push(&self, ipv6: &str, content: &str, response: &str, ok: bool) {
        let mut inner = self.inner.lock().expect("send log lock");
        inner.next_id += 1;
        let entry = SendLogEntry {
            id: inner.next_id,
            ipv6: ipv6.to_string(),
            content: content.to_string(),
            response: response.to_string(),
            result: i64::from(ok),
            created_at: unix_timestamp(),
        };
        if inner.entries.len() == LOG_CAPACITY {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
    }

    /// Newest-first snapshot, at most `max` entries.
    pub fn recent(&self, max: usize) -> Vec<SendLogEntry> {
        let inner = self.inner.lock().expect("send log lock");
        inner.entries.iter().rev().take(max).cloned().collect()
    }
}

impl Default for SendLogRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the report body for the given address and enabled ports.
///
/// `#{link}` joins the `[addr]:port` pairs with a literal `\n` escape so
/// the value stays legal inside a JSON string template.
pub fn render_report(template: &str, ipv6: &str, enabled_ports: &[u16]) -> String {
    let ports = if enabled_ports.is_empty() {
        "port".to_string()
    } else {
        enabled_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    };

    let link = if enabled_ports.is_empty() {
        format!("[{ipv6}]:port")
    } else {
        enabled_ports
            .iter()
            .map(|p| format!("[{ipv6}]:{p}"))
            .collect::<Vec<_>>()
            .join("\\n")
    };

    substitute(
        template,
        &[
            ("ipv6", ipv6),
            ("sender", ipv6),
            ("port", &ports),
            ("link", &link),
            ("time", &local_time_string()),
        ],
    )
}

impl Ipv6Forwarder {
    /// One report attempt. Returns the outcome.
    async fn report_once(&self, config: &Ipv6Config) -> bool {
        let Some(ipv6) = self.global_ipv6_addr().await else {
            debug!("no global IPv6 address yet");
            return false;
        };

        let enabled_ports: Vec<u16> = self
            .rule_list()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.ipv6_port)
            .collect();

        let body = render_report(&config.webhook_body, &ipv6, &enabled_ports);
        let (response, ok) = webhook::deliver(
            self.http(),
            &config.webhook_url,
            &config.webhook_headers,
            body.clone(),
        )
        .await;
        self.send_log.push(&ipv6, &body, &response, ok);
        ok
    }

    /// Report with the retry ladder (or a single attempt when `retry` is
    /// false).
    pub async fn send_report(&self, retry: bool) -> bool {
        let config = match self.config().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "reporter config read failed");
                return false;
            }
        };
        if config.webhook_url.is_empty() {
            debug!("reporter webhook URL not configured");
            return false;
        }

        let attempts = if retry { MAX_RETRIES } else { 1 };
        for attempt in 1..=attempts {
            if self.report_once(&config).await {
                info!(attempt, "IPv6 report delivered");
                return true;
            }
            if attempt < attempts {
                debug!(attempt, max = attempts, "IPv6 report failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        warn!("IPv6 report failed");
        false
    }

    /// (Re)arm the periodic reporter to the current config. Cancels any
    /// previous timer; does nothing further when reporting is disabled.
    pub async fn rearm_reporter(self: &Arc<Self>) {
        let mut slot = self.reporter_slot().lock().await;
        if let Some(task) = slot.take() {
            task.abort();
            debug!("reporter timer cancelled");
        }

        let config = match self.config().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "reporter config read failed");
                return;
            }
        };
        if !config.send_enabled || config.send_interval <= 0 {
            return;
        }

        let interval = Duration::from_secs(config.send_interval as u64 * 60);
        let forwarder = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                forwarder.send_report(true).await;
            }
        }));
        info!(minutes = config.send_interval, "reporter timer armed");
    }

    /// Boot-time hook: arm the timer and fire one report if configured.
    pub async fn start_reporter(self: &Arc<Self>) {
        self.rearm_reporter().await;

        let config = match self.config().await {
            Ok(c) => c,
            Err(_) => return,
        };
        if config.send_enabled && !config.webhook_url.is_empty() {
            let forwarder = Arc::clone(self);
            tokio::spawn(async move {
                forwarder.send_report(true).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_report_with_ports() {
        let body = render_report(
            "{\"ipv6\":\"#{ipv6}\",\"ports\":\"#{port}\",\"link\":\"#{link}\"}",
            "2409::1",
            &[8080, 2222],
        );
        assert_eq!(
            body,
            "{\"ipv6\":\"2409::1\",\"ports\":\"8080,2222\",\"link\":\"[2409::1]:8080\\n[2409::1]:2222\"}"
        );
    }

    #[test]
    fn render_report_without_ports_uses_placeholders() {
        let body = render_report("#{port} #{link}", "2409::1", &[]);
        assert_eq!(body, "port [2409::1]:port");
    }

    #[test]
    fn render_report_sender_aliases_ipv6() {
        let body = render_report("#{sender}", "2409::1", &[80]);
        assert_eq!(body, "2409::1");
    }

    #[test]
    fn send_log_ring_caps_at_thirty() {
        let ring = SendLogRing::new();
        for i in 0..40 {
            ring.push("2409::1", &format!("c{i}"), "ok", true);
        }
        let recent = ring.recent(100);
        assert_eq!(recent.len(), 30);
        assert_eq!(recent[0].content, "c39");
        assert_eq!(recent[29].content, "c10");
        assert_eq!(recent[0].id, 40);
    }
}
