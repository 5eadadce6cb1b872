//! Queue sizing from the bandwidth-delay product.

use crate::error::{Result, SimError};

/// Default link MTU in bytes.
pub const DEFAULT_MTU: u32 = 1500;

/// Headroom applied when converting the BDP to a packet count.
const PACKET_HEADROOM: f64 = 1.1;

/// Queue capacity derived from one topology's RTT and bottleneck bandwidth.
///
/// Always computed fresh from the link parameters; it is a plain value and
/// is never shared between topologies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueCapacity {
    /// Bandwidth-delay product in bytes, unrounded.
    pub bytes: f64,
    /// `floor(bytes / mtu * 1.1) + 1`, at least one packet.
    pub packets: u64,
    pub mtu: u32,
}

impl QueueCapacity {
    /// `rtt_ms × bw_mbps × 10^6 / 1000 / 8` bytes, i.e. RTT(s) × bits/s / 8.
    pub fn from_bdp(rtt_ms: f64, bw_mbps: f64, mtu: u32) -> Result<Self> {
        if !rtt_ms.is_finite() || rtt_ms <= 0.0 {
            return Err(SimError::config(format!("RTT must be positive, got {rtt_ms} ms")));
        }
        if !bw_mbps.is_finite() || bw_mbps <= 0.0 {
            return Err(SimError::config(format!(
                "bandwidth must be positive, got {bw_mbps} Mbps"
            )));
        }
        if mtu == 0 {
            return Err(SimError::config("MTU must be non-zero"));
        }

        let bytes = rtt_ms * bw_mbps * 1_000_000.0 / 1000.0 / 8.0;
        let packets = (bytes / mtu as f64 * PACKET_HEADROOM).floor() as u64 + 1;
        Ok(Self {
            bytes,
            packets,
            mtu,
        })
    }

    /// Byte limit as passed to `tc` (rounded up to a whole byte).
    pub fn limit_bytes(&self) -> u64 {
        self.bytes.ceil() as u64
    }
}
