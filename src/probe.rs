//! Endpoint health probing
//!
//! An LFR member is healthy when `GET http://<address>:<port>/health`
//! answers 200 within the timeout. Transport errors and timeouts count as
//! unhealthy.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::Result;

/// Probes a single member address
#[async_trait]
pub trait EndpointProber: Send + Sync {
    /// Returns `true` when the member answered healthy
    async fn probe(&self, address: &str, timeout: Duration) -> bool;
}

/// HTTP `/health` prober
#[derive(Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    port: u16,
}

impl HttpProber {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, port })
    }

    /// Health URL for a member address
    pub fn health_url(&self, address: &str) -> String {
        match address.parse::<IpAddr>() {
            Ok(ip) => format!("http://{}/health", SocketAddr::new(ip, self.port)),
            Err(_) => format!("http://{}:{}/health", address, self.port),
        }
    }
}

#[async_trait]
impl EndpointProber for HttpProber {
    async fn probe(&self, address: &str, timeout: Duration) -> bool {
        let url = self.health_url(address);
        debug!("Querying LFR health endpoint: {}", url);

        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                warn!(
                    "Health endpoint {} returned status {}",
                    url,
                    response.status()
                );
                false
            }
            Err(e) => {
                warn!("Failed to query health endpoint {}: {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};

    use super::*;

    #[test]
    fn test_health_url_formats() {
        let prober = HttpProber::new(8080).unwrap();
        assert_eq!(prober.health_url("10.1.2.3"), "http://10.1.2.3:8080/health");
        assert_eq!(prober.health_url("fd00::1"), "http://[fd00::1]:8080/health");
        assert_eq!(
            prober.health_url("lfr-nginx.logging.svc"),
            "http://lfr-nginx.logging.svc:8080/health"
        );
    }

    async fn serve(status: AxumStatus) -> u16 {
        let app = Router::new().route("/health", get(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_probe_ok_is_healthy() {
        let port = serve(AxumStatus::OK).await;
        let prober = HttpProber::new(port).unwrap();
        assert!(prober.probe("127.0.0.1", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_probe_non_200_is_unhealthy() {
        let port = serve(AxumStatus::SERVICE_UNAVAILABLE).await;
        let prober = HttpProber::new(port).unwrap();
        assert!(!prober.probe("127.0.0.1", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_probe_connection_refused_is_unhealthy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = HttpProber::new(port).unwrap();
        assert!(!prober.probe("127.0.0.1", Duration::from_secs(2)).await);
    }
}
