//! Transport-level reachability probe.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Reports whether something is listening at `host:port`.
///
/// Implementations never fail: DNS errors, refusals and timeouts are all `false`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Opens a TCP connection and drops it immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        // The timeout also bounds name resolution.
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            Ok(Err(err)) => {
                trace!(host, port, error = %err, "probe connection failed");
                false
            }
            Err(_) => {
                trace!(host, port, "probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachable_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe;
        assert!(probe.is_reachable("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_unreachable_when_port_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpProbe;
        assert!(!probe.is_reachable("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_unreachable() {
        let probe = TcpProbe;
        assert!(
            !probe
                .is_reachable("no-such-host.invalid", 80, Duration::from_millis(500))
                .await
        );
    }
}
