//! Interconnect bandwidth requests

use crate::error::{BackendError, Result, ScalingError};
use std::sync::Arc;

/// Instantaneous bandwidth per level (MB/s)
pub const BW_LEVELS_MBPS: [u32; 8] = [640, 1064, 1600, 2128, 3200, 3600, 3936, 4264];

/// Interconnect bandwidth-scaling fabric
pub trait BandwidthBackend: Send + Sync {
    fn request_level(&self, level: usize) -> std::result::Result<(), BackendError>;
}

/// Maps a shared-domain level to a fabric request
pub struct BandwidthRequester {
    backend: Arc<dyn BandwidthBackend>,
    levels: usize,
}

impl BandwidthRequester {
    pub fn new(backend: Arc<dyn BandwidthBackend>) -> Self {
        Self {
            backend,
            levels: BW_LEVELS_MBPS.len(),
        }
    }

    /// Bandwidth of a level in MB/s
    pub fn level_mbps(level: usize) -> Option<u32> {
        BW_LEVELS_MBPS.get(level).copied()
    }

    /// Out-of-range levels are rejected before reaching the fabric
    pub fn request(&self, level: usize) -> Result<()> {
        if level >= self.levels {
            return Err(ScalingError::BandwidthFailure {
                level,
                reason: "level out of range".into(),
            });
        }
        self.backend
            .request_level(level)
            .map_err(|e| ScalingError::BandwidthFailure {
                level,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedSoc;

    #[test]
    fn test_request_reaches_backend() {
        let soc = Arc::new(SimulatedSoc::with_trace());
        let requester = BandwidthRequester::new(soc.clone());

        requester.request(4).unwrap();
        assert_eq!(soc.bandwidth_level(), Some(4));
        assert_eq!(BandwidthRequester::level_mbps(4), Some(3200));
    }

    #[test]
    fn test_out_of_range_level_never_sent() {
        let soc = Arc::new(SimulatedSoc::with_trace());
        let requester = BandwidthRequester::new(soc.clone());

        let err = requester.request(8).unwrap_err();
        assert!(matches!(err, ScalingError::BandwidthFailure { level: 8, .. }));
        assert_eq!(soc.bandwidth_level(), None);
    }

    #[test]
    fn test_backend_failure_is_wrapped() {
        let soc = Arc::new(SimulatedSoc::with_trace());
        soc.fail_bandwidth(true);
        let requester = BandwidthRequester::new(soc.clone());

        let err = requester.request(2).unwrap_err();
        assert!(!err.is_fatal());
    }
}
