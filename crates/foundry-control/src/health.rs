//! Liveness probes.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ControlResult;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// The service answered as expected.
    Healthy,
    /// It did not. Probes are retried, so this is not an error.
    Unhealthy(String),
}

impl HealthStatus {
    /// Whether the probe succeeded.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Checks whether a service is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    /// Probe the service behind `endpoint`.
    async fn check(&self, endpoint: &str) -> HealthStatus;
}

/// Probes with an HTTP `GET` on a fixed path; only `200 OK` counts.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    /// Create a probe for `path` with a per-request timeout.
    pub fn new(path: impl Into<String>, timeout: Duration) -> ControlResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            path: path.into(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, endpoint: &str) -> HealthStatus {
        let url = self.url(endpoint);
        match self.client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => HealthStatus::Healthy,
            Ok(response) => HealthStatus::Unhealthy(format!("status {}", response.status())),
            Err(e) => {
                debug!(url = %url, error = %e, "health request failed");
                HealthStatus::Unhealthy(e.to_string())
            }
        }
    }
}

/// Scripted probe for tests.
#[derive(Debug)]
pub struct MockProbe {
    healthy_after: Option<u32>,
    attempts: AtomicU32,
}

impl MockProbe {
    /// Healthy on the first probe.
    #[must_use]
    pub const fn healthy() -> Self {
        Self::healthy_after(1)
    }

    /// Never healthy.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            healthy_after: None,
            attempts: AtomicU32::new(0),
        }
    }

    /// Healthy from the `n`th probe on.
    #[must_use]
    pub const fn healthy_after(n: u32) -> Self {
        Self {
            healthy_after: Some(n),
            attempts: AtomicU32::new(0),
        }
    }

    /// Probes made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::healthy()
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn check(&self, _endpoint: &str) -> HealthStatus {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.healthy_after {
            Some(n) if attempt >= n => HealthStatus::Healthy,
            _ => HealthStatus::Unhealthy(format!("attempt {attempt}: not ready")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0_u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn probe() -> HttpHealthProbe {
        HttpHealthProbe::new("/health", Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn ok_is_healthy() {
        let endpoint = serve_once("200 OK").await;
        assert_eq!(probe().check(&endpoint).await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn other_status_is_unhealthy() {
        let endpoint = serve_once("503 Service Unavailable").await;
        assert!(!probe().check(&endpoint).await.is_healthy());
    }

    #[tokio::test]
    async fn closed_port_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!probe().check(&format!("http://{addr}")).await.is_healthy());
    }

    #[test]
    fn url_joins_cleanly() {
        assert_eq!(probe().url("http://localhost:8001/"), "http://localhost:8001/health");
    }

    #[tokio::test]
    async fn mock_counts_attempts() {
        let probe = MockProbe::healthy_after(3);
        assert!(!probe.check("x").await.is_healthy());
        assert!(!probe.check("x").await.is_healthy());
        assert!(probe.check("x").await.is_healthy());
        assert_eq!(probe.attempts(), 3);
    }
}
