//! Error types for scaling operations

use crate::hotplug::{CoreLifecycle, HotplugEvent};
use thiserror::Error;

/// Failure reported by an external collaborator (regulator network or
/// interconnect fabric).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct BackendError {
    pub code: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Scaling error types
#[derive(Debug, Error)]
pub enum ScalingError {
    /// No table row matches the requested frequency exactly
    #[error("No table entry for {0} kHz")]
    InvalidFrequency(u32),

    /// Core index out of range
    #[error("Core {0} does not exist")]
    InvalidCore(usize),

    /// Regulator backend rejected a voltage request
    #[error("Rail {rail} rejected {target_uv} uV: {source}")]
    RailFailure {
        rail: String,
        target_uv: u32,
        #[source]
        source: BackendError,
    },

    /// Bandwidth request failed
    #[error("Bandwidth level {level} request failed: {reason}")]
    BandwidthFailure { level: usize, reason: String },

    /// Administrative override value out of range
    #[error("Invalid voltage {uv} uV: {reason}")]
    InvalidVoltage { uv: i64, reason: String },

    /// Frequency plan failed validation
    #[error("Invalid frequency plan: {0}")]
    InvalidPlan(String),

    /// No built-in plan for this chip
    #[error("Unsupported chip: {0}")]
    UnsupportedChip(String),

    /// Lifecycle event delivered out of order
    #[error("Core {core}: {event:?} is not valid while {state:?}")]
    InvalidHotplugEvent {
        core: usize,
        event: HotplugEvent,
        state: CoreLifecycle,
    },

    /// Rate request for a core that is not online
    #[error("Core {core} is {state:?}")]
    CoreOffline { core: usize, state: CoreLifecycle },
}

/// Result type for scaling operations
pub type Result<T> = std::result::Result<T, ScalingError>;

impl ScalingError {
    /// Fail-fast errors abort the call; the rest are best-effort and only
    /// ever leave the chip over-volted or over-provisioned.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::BandwidthFailure { .. })
    }

    /// Check if the request itself was malformed (nothing was mutated)
    pub fn is_rejected_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrequency(_)
                | Self::InvalidCore(_)
                | Self::InvalidVoltage { .. }
                | Self::InvalidHotplugEvent { .. }
                | Self::CoreOffline { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rail_failure_keeps_backend_source() {
        let err = ScalingError::RailFailure {
            rail: "krait0_mem".into(),
            target_uv: 1_050_000,
            source: BackendError::new(-5, "rpm timeout"),
        };

        assert!(err.is_fatal());
        assert!(!err.is_rejected_request());
        assert_eq!(
            err.to_string(),
            "Rail krait0_mem rejected 1050000 uV: rpm timeout (code -5)"
        );
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "rpm timeout (code -5)");
    }

    #[test]
    fn test_bandwidth_failure_is_best_effort() {
        let err = ScalingError::BandwidthFailure {
            level: 4,
            reason: "fabric busy".into(),
        };
        assert!(!err.is_fatal());
        assert!(ScalingError::InvalidFrequency(123).is_rejected_request());
    }
}
