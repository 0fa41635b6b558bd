//! Readiness probing of the proxy's port

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::error::{AuthProxyError, Result};

/// Waits for a port to start accepting connections
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Succeeds once `port` accepts a connection, fails with
    /// [`AuthProxyError::ProbeTimeout`] once `limit` has elapsed
    async fn wait_until_used(&self, port: u16, interval: Duration, limit: Duration) -> Result<()>;
}

/// Probes by opening short-lived TCP connections
#[derive(Debug, Clone, Copy)]
pub struct TcpReadinessProbe {
    host: IpAddr,
}

impl TcpReadinessProbe {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }

    async fn poll(&self, addr: SocketAddr, interval: Duration) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();

            match timeout(interval, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    debug!(%addr, attempt, "Port accepted connection");
                    return;
                }
                Ok(Err(e)) => debug!(%addr, attempt, error = %e, "Port not accepting yet"),
                Err(_) => debug!(%addr, attempt, "Connection attempt timed out"),
            }

            let spent = started.elapsed();
            if spent < interval {
                sleep(interval - spent).await;
            }
        }
    }
}

impl Default for TcpReadinessProbe {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl PortProbe for TcpReadinessProbe {
    async fn wait_until_used(&self, port: u16, interval: Duration, limit: Duration) -> Result<()> {
        let addr = SocketAddr::new(self.host, port);
        timeout(limit, self.poll(addr, interval))
            .await
            .map_err(|_| AuthProxyError::ProbeTimeout {
                port,
                timeout_ms: limit.as_millis() as u64,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_succeeds_immediately_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        TcpReadinessProbe::default()
            .wait_until_used(port, Duration::from_millis(50), Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_succeeds_once_port_opens_late() {
        let port = unused_port().await;
        let opener = tokio::spawn(async move {
            sleep(Duration::from_millis(2000)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            sleep(Duration::from_secs(10)).await;
            drop(listener);
        });

        let started = Instant::now();
        TcpReadinessProbe::default()
            .wait_until_used(port, Duration::from_millis(500), Duration::from_millis(10_000))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(1900));
        assert!(elapsed < Duration::from_millis(10_000));
        opener.abort();
    }

    #[tokio::test]
    async fn test_times_out_when_nothing_listens() {
        let port = unused_port().await;

        let started = Instant::now();
        let err = TcpReadinessProbe::default()
            .wait_until_used(port, Duration::from_millis(50), Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(
            err,
            AuthProxyError::ProbeTimeout {
                port,
                timeout_ms: 300
            }
        );
    }
}
