//! Frequency plan selection
//!
//! Picks a built-in plan from the chip's speed-bin fuses and assembles the
//! platform description the engine is built from.

use crate::engine::{PlatformConfig, OVERCLOCK_MAX_UV};
use crate::error::{Result, ScalingError};
use crate::mux::{select, Domain, PllSupply};
use crate::rail::RailSpec;
use crate::table::{ClockSource, CoreLevel, DomainLevel, FrequencyPlan, Speed, STANDBY_KHZ};
use crate::voltage::{CoreRailSpec, DEFAULT_FLOOR_UV, RAISED_FLOOR_UV};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

/// Reference crystal the synthesizer multiplies (kHz)
const SYNTH_REF_KHZ: u32 = 27_000;

/// CPU ids of parts that cannot hold state below the raised floor
const RAISED_FLOOR_CPUIDS: [u32; 3] = [0x511F_04D0, 0x511F_04D1, 0x510F_06F0];

/// Supported chips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipId {
    Msm8960,
    Apq8064,
    Msm8930,
    Msm8627,
}

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipId::Msm8960 => "msm8960",
            ChipId::Apq8064 => "apq8064",
            ChipId::Msm8930 => "msm8930",
            ChipId::Msm8627 => "msm8627",
        };
        f.write_str(name)
    }
}

/// Speed-bin fuse rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseBits {
    /// Upper word of row 0: max-frequency and leakage bins
    pub row0: u32,
    /// Lower word of row 1: process variation
    pub row1: u32,
}

impl FuseBits {
    /// Process-variation bin; 7 in the primary field means "see backup"
    pub fn pvs(&self) -> u32 {
        let pvs = (self.row1 >> 10) & 0x7;
        if pvs == 0x7 {
            (self.row1 >> 13) & 0x7
        } else {
            pvs
        }
    }

    pub fn fmax(&self) -> u32 {
        (self.row0 >> 20) & 0x3
    }

    pub fn leakage(&self) -> u32 {
        (self.row0 >> 16) & 0x3
    }
}

/// Built-in plan variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Slow,
    Nominal,
    Fast,
    Fast3,
}

impl PlanId {
    pub fn name(self) -> &'static str {
        match self {
            PlanId::Slow => "krait_v2_slow",
            PlanId::Nominal => "krait_v2_nom",
            PlanId::Fast => "krait_v2_fast",
            PlanId::Fast3 => "krait_v2_f3",
        }
    }
}

/// Everything read from the chip at start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipIdentity {
    pub chip: ChipId,
    pub fuses: FuseBits,
    pub cpuid: u32,
}

/// Map a chip and its fuses to a plan
pub fn select_plan(chip: ChipId, fuses: FuseBits) -> Result<PlanId> {
    if chip != ChipId::Msm8960 {
        return Err(ScalingError::UnsupportedChip(chip.to_string()));
    }

    let pvs = fuses.pvs();
    let fmax = fuses.fmax();
    let leakage = fuses.leakage();

    let plan = match pvs {
        0x0 | 0x7 => PlanId::Slow,
        0x1 => PlanId::Nominal,
        0x3 if fmax == 0x3 => PlanId::Fast3,
        0x3 => PlanId::Fast,
        _ => {
            warn!("Unknown PVS bin {}, defaulting to slow", pvs);
            PlanId::Slow
        }
    };
    info!("PVS {} FMAX {} leakage L{}: using {}", pvs, fmax, leakage, plan.name());
    Ok(plan)
}

pub fn needs_raised_floor(cpuid: u32) -> bool {
    RAISED_FLOOR_CPUIDS.contains(&cpuid)
}

/// Core-rail floor for a CPU id
pub fn floor_for(cpuid: u32) -> u32 {
    if needs_raised_floor(cpuid) {
        RAISED_FLOOR_UV
    } else {
        DEFAULT_FLOOR_UV
    }
}

fn standby() -> Speed {
    Speed {
        khz: STANDBY_KHZ,
        source: ClockSource::Standby,
        pri_sel: select::PRI_SECONDARY,
        sec_sel: select::SEC_STANDBY,
        pll_l: 0,
    }
}

fn aux(khz: u32) -> Speed {
    Speed {
        khz,
        source: ClockSource::Aux,
        pri_sel: select::PRI_SECONDARY,
        sec_sel: select::SEC_AUX,
        pll_l: 0,
    }
}

/// Synthesizer row; low frequencies run the synthesizer at twice the rate
/// through the half-rate divider.
fn synth(khz: u32, div2: bool) -> Speed {
    let (pri_sel, pll_l) = if div2 {
        (select::PRI_SYNTH_DIV2, 2 * khz / SYNTH_REF_KHZ)
    } else {
        (select::PRI_SYNTH, khz / SYNTH_REF_KHZ)
    };
    Speed {
        khz,
        source: ClockSource::Synthesizer,
        pri_sel,
        sec_sel: select::SEC_STANDBY,
        pll_l,
    }
}

const L2_KHZ: [u32; 20] = [
    STANDBY_KHZ, 384_000, 432_000, 486_000, 540_000, 594_000, 648_000, 702_000, 756_000, 810_000,
    864_000, 918_000, 972_000, 1_026_000, 1_080_000, 1_134_000, 1_188_000, 1_242_000, 1_296_000,
    1_350_000,
];
const L2_BW: [usize; 20] = [0, 1, 2, 2, 2, 2, 4, 4, 4, 4, 4, 6, 6, 6, 6, 6, 6, 6, 6, 6];

const CPU_KHZ: [u32; 34] = [
    STANDBY_KHZ, 384_000, 432_000, 486_000, 540_000, 594_000, 648_000, 702_000, 756_000, 810_000,
    864_000, 918_000, 972_000, 1_026_000, 1_080_000, 1_134_000, 1_188_000, 1_242_000, 1_296_000,
    1_350_000, 1_404_000, 1_458_000, 1_512_000, 1_566_000, 1_620_000, 1_674_000, 1_728_000,
    1_782_000, 1_836_000, 1_890_000, 1_944_000, 1_998_000, 2_052_000, 2_106_000,
];
/// First overclock row; disabled until a scaling limit enables it
const CPU_OC_FIRST: usize = 23;

const SLOW_VDD_CORE: [u32; 34] = [
    950_000, 950_000, 975_000, 975_000, 1_000_000, 1_000_000, 1_025_000, 1_025_000, 1_075_000,
    1_075_000, 1_100_000, 1_100_000, 1_125_000, 1_125_000, 1_175_000, 1_175_000, 1_200_000,
    1_200_000, 1_225_000, 1_225_000, 1_237_500, 1_237_500, 1_250_000, 1_250_000, 1_262_500,
    1_262_500, 1_275_000, 1_275_000, 1_287_500, 1_300_000, 1_325_000, 1_350_000, 1_375_000,
    1_400_000,
];
const F3_VDD_CORE: [u32; 34] = [
    850_000, 850_000, 875_000, 875_000, 900_000, 900_000, 925_000, 925_000, 975_000, 975_000,
    1_000_000, 1_000_000, 1_012_500, 1_012_500, 1_050_000, 1_050_000, 1_075_000, 1_075_000,
    1_100_000, 1_100_000, 1_112_500, 1_112_500, 1_125_000, 1_125_000, 1_137_500, 1_137_500,
    1_150_000, 1_150_000, 1_162_500, 1_175_000, 1_200_000, 1_225_000, 1_250_000, 1_275_000,
];

fn l2_levels() -> Vec<DomainLevel> {
    L2_KHZ
        .iter()
        .zip(L2_BW)
        .enumerate()
        .map(|(i, (&khz, bw_level))| {
            let speed = match i {
                0 => standby(),
                1 => aux(khz),
                _ => synth(khz, khz <= 540_000),
            };
            let uv = if i < 8 { 1_050_000 } else { 1_150_000 };
            DomainLevel {
                speed,
                vdd_dig_uv: uv,
                vdd_mem_uv: uv,
                bw_level,
            }
        })
        .collect()
}

/// Shared-domain level each core row votes for
fn l2_vote(plan: PlanId, row: usize) -> usize {
    match row {
        0 => 0,
        1 => 1,
        2..=13 => 7,
        14..=22 if plan == PlanId::Fast3 => 16,
        _ => 19,
    }
}

fn vdd_core(plan: PlanId, row: usize) -> u32 {
    match plan {
        PlanId::Slow => SLOW_VDD_CORE[row],
        PlanId::Nominal => SLOW_VDD_CORE[row] - 50_000,
        PlanId::Fast => SLOW_VDD_CORE[row] - 100_000,
        PlanId::Fast3 => F3_VDD_CORE[row],
    }
}

/// Built-in Krait v2 plan
pub fn builtin_plan(plan: PlanId) -> Result<FrequencyPlan> {
    let rows = CPU_KHZ
        .iter()
        .enumerate()
        .map(|(row, &khz)| {
            let speed = match row {
                0 => standby(),
                1 => aux(khz),
                _ => synth(khz, khz <= 540_000),
            };
            CoreLevel {
                enabled: row != 0 && row < CPU_OC_FIRST,
                speed,
                domain_level: l2_vote(plan, row),
                vdd_core_uv: vdd_core(plan, row),
            }
        })
        .collect();

    FrequencyPlan::new(plan.name(), l2_levels(), rows)
}

/// Two-core platform description around `plan`
pub fn msm8960_platform(plan: FrequencyPlan, cpuid: u32) -> PlatformConfig {
    let cores = (0..2)
        .map(|cpu| CoreRailSpec {
            core: RailSpec::new(format!("krait{}", cpu), 1_300_000),
            mem: RailSpec::new("krait0_mem", 1_150_000),
            dig: RailSpec::new("krait0_dig", 1_150_000),
        })
        .collect();

    let supply = PllSupply {
        a: RailSpec::new("hfpll", 2_100_000),
        b: RailSpec::new("hfpll", 1_800_000),
    };
    let pll_supplies: HashMap<Domain, PllSupply> = [Domain::Core(0), Domain::Core(1), Domain::Shared]
        .into_iter()
        .map(|domain| (domain, supply.clone()))
        .collect();

    PlatformConfig {
        plan,
        cores,
        pll_supplies,
        floor_uv: floor_for(cpuid),
        boost: false,
        overclock_max_uv: OVERCLOCK_MAX_UV,
    }
}

/// Select and build the built-in plan for `identity`
pub fn platform_for(identity: &ChipIdentity) -> Result<PlatformConfig> {
    let plan_id = select_plan(identity.chip, identity.fuses)?;
    let plan = builtin_plan(plan_id)?;
    Ok(msm8960_platform(plan, identity.cpuid))
}
