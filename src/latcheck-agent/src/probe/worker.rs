//! Single-probe execution.
//!
//! `Prober` is the seam between the coordinator and the network: production
//! uses ICMP echo via `surge-ping`, tests script the replies. A probe never
//! fails as an error; anything that goes wrong (timeout, unreachable, raw
//! socket denied) is the sentinel latency.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use latcheck_proto::MAX_LATENCY;
use tokio::time::timeout;
use tracing::trace;

/// Echo payload carried in every probe.
const PROBE_PAYLOAD: &[u8; 32] = b"latcheck probe payload, 32 byte!";

/// Reply deadline for one echo.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One echo against one target.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Round-trip time in milliseconds, clamped below [`MAX_LATENCY`];
    /// exactly [`MAX_LATENCY`] when the target did not answer.
    async fn probe(&self, target: Ipv4Addr) -> u32;
}

/// ICMP echo prober.
pub struct IcmpProber {
    reply_timeout: Duration,
}

impl IcmpProber {
    pub fn new() -> Self {
        Self {
            reply_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(reply_timeout: Duration) -> Self {
        Self { reply_timeout }
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, target: Ipv4Addr) -> u32 {
        let echo = surge_ping::ping(IpAddr::V4(target), PROBE_PAYLOAD);
        match timeout(self.reply_timeout, echo).await {
            Ok(Ok((_reply, rtt))) => {
                let millis = rtt.as_millis() as u32;
                trace!(target = %target, rtt_ms = millis, "echo reply");
                millis.min(MAX_LATENCY - 1)
            }
            Ok(Err(e)) => {
                trace!(target = %target, error = %e, "probe failed");
                MAX_LATENCY
            }
            Err(_) => {
                trace!(target = %target, "probe timed out");
                MAX_LATENCY
            }
        }
    }
}
