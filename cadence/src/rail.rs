//! Voltage rails and the regulator backend contract

use crate::error::{BackendError, Result, ScalingError};
use crate::mux::Domain;
use serde::{Deserialize, Serialize};

/// Rail role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RailKind {
    /// Per-core supply
    Core,
    /// Shared cache-adjacent memory rail
    Mem,
    /// Shared digital logic rail
    Dig,
    /// Synthesizer supply A
    PllA,
    /// Synthesizer supply B
    PllB,
}

/// A rail as addressed by one voter. Shared rails are aggregated by the
/// regulator network across voters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RailId {
    pub kind: RailKind,
    pub voter: Domain,
}

impl RailId {
    pub fn new(kind: RailKind, voter: Domain) -> Self {
        Self { kind, voter }
    }
}

/// Regulator supply network
pub trait RailBackend: Send + Sync {
    /// Request `target_uv`, never exceeding `max_uv`
    fn set_voltage(&self, rail: RailId, target_uv: u32, max_uv: u32) -> std::result::Result<(), BackendError>;

    /// Turn the rail on
    fn enable(&self, rail: RailId) -> std::result::Result<(), BackendError>;
}

/// Static rail description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailSpec {
    pub name: String,
    pub max_uv: u32,
}

impl RailSpec {
    pub fn new(name: impl Into<String>, max_uv: u32) -> Self {
        Self {
            name: name.into(),
            max_uv,
        }
    }
}

/// A rail with a cache of the last applied voltage
#[derive(Debug, Clone, Serialize)]
pub struct Rail {
    pub id: RailId,
    pub name: String,
    pub max_uv: u32,
    pub current_uv: u32,
}

impl Rail {
    pub fn new(id: RailId, spec: &RailSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            max_uv: spec.max_uv,
            current_uv: 0,
        }
    }

    /// Apply a voltage and update the cache only on success
    pub fn apply(&mut self, backend: &dyn RailBackend, target_uv: u32) -> Result<()> {
        backend
            .set_voltage(self.id, target_uv, self.max_uv)
            .map_err(|source| ScalingError::RailFailure {
                rail: self.name.clone(),
                target_uv,
                source,
            })?;
        self.current_uv = target_uv;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{HwEvent, SimulatedSoc};

    #[test]
    fn test_apply_updates_cache_only_on_success() {
        let soc = SimulatedSoc::with_trace();
        let id = RailId::new(RailKind::Mem, Domain::Core(0));
        let mut rail = Rail::new(id, &RailSpec::new("krait0_mem", 1_150_000));

        rail.apply(&soc, 1_050_000).unwrap();
        assert_eq!(rail.current_uv, 1_050_000);
        assert_eq!(
            soc.trace(),
            vec![HwEvent::SetVoltage {
                rail: id,
                uv: 1_050_000,
                max_uv: 1_150_000
            }]
        );

        soc.fail_rail(id);
        let err = rail.apply(&soc, 1_150_000).unwrap_err();
        assert!(matches!(err, ScalingError::RailFailure { target_uv: 1_150_000, .. }));
        assert_eq!(rail.current_uv, 1_050_000);
    }
}
