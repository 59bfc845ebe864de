//! Periodic register dump to the HTTP telemetry collector.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use crate::registers::{SharedBank, REGISTER_COUNT};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// `v0;v1;...;v29;` with a trailing separator.
pub fn format_dump(values: &[u32; REGISTER_COUNT]) -> String {
    let mut out = String::with_capacity(REGISTER_COUNT * 4);
    for v in values {
        out.push_str(&v.to_string());
        out.push(';');
    }
    out
}

pub struct TelemetrySink {
    client: reqwest::Client,
    url: String,
}

impl TelemetrySink {
    pub fn new(endpoint: &str, addr: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}/{addr}", endpoint.trim_end_matches('/')),
        })
    }

    pub async fn send(&self, bank: &SharedBank) -> Result<()> {
        let body = format_dump(&bank.snapshot());
        self.client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("POST {}", self.url))?;
        Ok(())
    }

    /// Post forever. A run of failures is logged once at warn.
    pub async fn run(self, bank: SharedBank, interval: Duration) {
        info!(url = %self.url, interval_ms = interval.as_millis() as u64, "telemetry started");
        let mut ticker = tokio::time::interval(interval);
        let mut failing = false;
        loop {
            ticker.tick().await;
            match self.send(&bank).await {
                Ok(()) => {
                    if failing {
                        info!("telemetry delivered again");
                    }
                    failing = false;
                }
                Err(e) if failing => debug!("telemetry failed: {e:#}"),
                Err(e) => {
                    warn!("telemetry failed: {e:#}");
                    failing = true;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{reg, RegisterBank};
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dump_of_zero_bank() {
        let dump = format_dump(&[0; REGISTER_COUNT]);
        assert_eq!(dump, "0;".repeat(REGISTER_COUNT));
    }

    #[test]
    fn dump_keeps_register_order() {
        let mut values = [0; REGISTER_COUNT];
        values[0] = 2432;
        values[1] = 17;
        values[29] = 5;
        let dump = format_dump(&values);
        assert!(dump.starts_with("2432;17;0;"));
        assert!(dump.ends_with(";0;5;"));
        assert_eq!(dump.matches(';').count(), REGISTER_COUNT);
    }

    #[test]
    fn url_joins_endpoint_and_address() {
        let sink = TelemetrySink::new("http://collector:3001/toExcel/", "B827EB123456").unwrap();
        assert_eq!(sink.url, "http://collector:3001/toExcel/B827EB123456");
    }

    type Received = Arc<Mutex<Vec<(String, String, String)>>>;

    async fn collect(
        State(received): State<Received>,
        Path(addr): Path<String>,
        headers: HeaderMap,
        body: String,
    ) {
        let ct = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        received.lock().unwrap().push((addr, ct, body));
    }

    #[tokio::test]
    async fn send_posts_dump_to_collector() {
        let received: Received = Arc::default();
        let app = Router::new()
            .route("/toExcel/{addr}", post(collect))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let bank = RegisterBank::shared();
        bank.write(reg::MOISTURE_PERCENT, 42);
        let endpoint = format!("http://127.0.0.1:{port}/toExcel");
        let sink = TelemetrySink::new(&endpoint, "AABBCC").unwrap();
        sink.send(&bank).await.unwrap();

        let got = received.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "AABBCC");
        assert_eq!(got[0].1, "application/octet-stream");
        assert!(got[0].2.starts_with("0;42;"));
    }

    #[tokio::test]
    async fn send_reports_unreachable_collector() {
        let sink = TelemetrySink::new("http://127.0.0.1:9", "AABBCC").unwrap();
        assert!(sink.send(&RegisterBank::shared()).await.is_err());
    }
}
