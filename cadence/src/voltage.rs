//! Voltage sequencing
//!
//! Raising goes memory → logic → core; lowering is the exact reverse. The
//! memory rail must never sit below what the logic rail needs, and the core
//! rail is only touched from the owning core.

use crate::error::Result;
use crate::mux::Domain;
use crate::rail::{Rail, RailBackend, RailId, RailKind, RailSpec};
use crate::table::{CoreLevelId, FrequencyPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Logic-rail requirement of a synthesizer running above the low multiplier range
pub const PLL_NOMINAL_VDD_UV: u32 = 1_050_000;
/// Logic-rail requirement of a synthesizer in the low multiplier range
pub const PLL_LOW_VDD_UV: u32 = 850_000;
/// Highest multiplier that runs at the low requirement
pub const PLL_LOW_VDD_L_MAX: u32 = 0x28;

/// Extra core voltage when boost is on
pub const BOOST_UV: u32 = 25_000;

/// Default core-rail floor
pub const DEFAULT_FLOOR_UV: u32 = 700_000;
/// Floor for parts that cannot run below it
pub const RAISED_FLOOR_UV: u32 = 1_150_000;
/// Accepted floor range
pub const MIN_FLOOR_UV: u32 = 700_000;
pub const MAX_FLOOR_UV: u32 = 1_400_000;

/// Rail voltages needed by one core row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoltageTargets {
    pub core_uv: u32,
    pub mem_uv: u32,
    pub dig_uv: u32,
}

impl VoltageTargets {
    /// `vdd_core_uv` is passed separately since the core column can be
    /// overridden at runtime.
    pub fn for_level(plan: &FrequencyPlan, level: CoreLevelId, vdd_core_uv: u32, boost: bool) -> Self {
        let domain = plan.domain_level(plan.vote_of(level));

        let pll_dig_uv = if !domain.speed.source.is_synthesizer() {
            0
        } else if domain.speed.pll_l > PLL_LOW_VDD_L_MAX {
            PLL_NOMINAL_VDD_UV
        } else {
            PLL_LOW_VDD_UV
        };

        Self {
            core_uv: vdd_core_uv + if boost { BOOST_UV } else { 0 },
            mem_uv: domain.vdd_mem_uv,
            dig_uv: domain.vdd_dig_uv.max(pll_dig_uv),
        }
    }
}

/// Rail descriptions for one core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRailSpec {
    pub core: RailSpec,
    pub mem: RailSpec,
    pub dig: RailSpec,
}

/// The three rails a core votes on
#[derive(Debug, Clone, Serialize)]
pub struct CoreRails {
    pub core: Rail,
    pub mem: Rail,
    pub dig: Rail,
}

impl CoreRails {
    pub fn new(cpu: usize, spec: &CoreRailSpec) -> Self {
        let voter = Domain::Core(cpu);
        Self {
            core: Rail::new(RailId::new(RailKind::Core, voter), &spec.core),
            mem: Rail::new(RailId::new(RailKind::Mem, voter), &spec.mem),
            dig: Rail::new(RailId::new(RailKind::Dig, voter), &spec.dig),
        }
    }
}

/// Ordered rail transitions
pub struct VoltageSequencer {
    backend: Arc<dyn RailBackend>,
}

impl VoltageSequencer {
    pub fn new(backend: Arc<dyn RailBackend>) -> Self {
        Self { backend }
    }

    /// Raise every rail that is below its target. Stops at the first
    /// failure; the clock switch must not go ahead in that case.
    pub fn raise(&self, cpu: usize, rails: &mut CoreRails, targets: &VoltageTargets, touch_core: bool) -> Result<()> {
        if targets.mem_uv > rails.mem.current_uv {
            rails
                .mem
                .apply(self.backend.as_ref(), targets.mem_uv)
                .inspect_err(|e| error!("vdd_mem (cpu{}) increase failed: {}", cpu, e))?;
        }

        if targets.dig_uv > rails.dig.current_uv {
            rails
                .dig
                .apply(self.backend.as_ref(), targets.dig_uv)
                .inspect_err(|e| error!("vdd_dig (cpu{}) increase failed: {}", cpu, e))?;
        }

        if touch_core && targets.core_uv > rails.core.current_uv {
            rails
                .core
                .apply(self.backend.as_ref(), targets.core_uv)
                .inspect_err(|e| error!("vdd_core (cpu{}) increase failed: {}", cpu, e))?;
        }

        Ok(())
    }

    /// Lower every rail that is above its target, never taking the core
    /// rail under `floor_uv`. Stops at the first failure, which leaves the
    /// remaining rails higher than needed.
    pub fn lower(
        &self,
        cpu: usize,
        rails: &mut CoreRails,
        targets: &VoltageTargets,
        floor_uv: u32,
        touch_core: bool,
    ) -> Result<()> {
        let core_uv = targets.core_uv.max(floor_uv);
        if touch_core && core_uv < rails.core.current_uv {
            rails
                .core
                .apply(self.backend.as_ref(), core_uv)
                .inspect_err(|e| error!("vdd_core (cpu{}) decrease failed: {}", cpu, e))?;
        }

        if targets.dig_uv < rails.dig.current_uv {
            rails
                .dig
                .apply(self.backend.as_ref(), targets.dig_uv)
                .inspect_err(|e| error!("vdd_dig (cpu{}) decrease failed: {}", cpu, e))?;
        }

        if targets.mem_uv < rails.mem.current_uv {
            rails
                .mem
                .apply(self.backend.as_ref(), targets.mem_uv)
                .inspect_err(|e| error!("vdd_mem (cpu{}) decrease failed: {}", cpu, e))?;
        }

        Ok(())
    }

    /// Bring up a core rail at its initial voltage. Failures are logged.
    pub fn init_core_rail(&self, cpu: usize, rails: &mut CoreRails, uv: u32) {
        debug!("Initializing {} at {} uV", rails.core.name, uv);

        if let Err(e) = rails.core.apply(self.backend.as_ref(), uv) {
            error!("Setting cpu{} core rail failed: {}", cpu, e);
        }
        if let Err(e) = self.backend.enable(rails.core.id) {
            error!("Enabling {} failed: {}", rails.core.name, e);
        }
    }
}
