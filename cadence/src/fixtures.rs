//! Small two-level plan and simulated platform shared by unit tests

use crate::engine::{Backends, PlatformConfig, ScalingEngine, OVERCLOCK_MAX_UV};
use crate::mux::{select, Domain, PllSupply};
use crate::rail::RailSpec;
use crate::sim::SimulatedSoc;
use crate::table::{ClockSource, CoreLevel, DomainLevel, FrequencyPlan, Speed, STANDBY_KHZ};
use crate::voltage::{CoreRailSpec, DEFAULT_FLOOR_UV};
use std::collections::HashMap;
use std::sync::Arc;

fn aux(khz: u32) -> Speed {
    Speed {
        khz,
        source: ClockSource::Aux,
        pri_sel: select::PRI_SECONDARY,
        sec_sel: select::SEC_AUX,
        pll_l: 0,
    }
}

fn synth(khz: u32, pll_l: u32) -> Speed {
    Speed {
        khz,
        source: ClockSource::Synthesizer,
        pri_sel: select::PRI_SYNTH,
        sec_sel: select::SEC_STANDBY,
        pll_l,
    }
}

fn domain(speed: Speed, uv: u32, bw_level: usize) -> DomainLevel {
    DomainLevel {
        speed,
        vdd_dig_uv: uv,
        vdd_mem_uv: uv,
        bw_level,
    }
}

fn row(enabled: bool, speed: Speed, domain_level: usize, vdd_core_uv: u32) -> CoreLevel {
    CoreLevel {
        enabled,
        speed,
        domain_level,
        vdd_core_uv,
    }
}

/// L2 at 200/400/800 MHz; cores at standby, 200, 400, 800 MHz plus a
/// disabled 1 GHz overclock row.
pub fn plan() -> FrequencyPlan {
    let standby = Speed {
        khz: STANDBY_KHZ,
        source: ClockSource::Standby,
        pri_sel: select::PRI_SECONDARY,
        sec_sel: select::SEC_STANDBY,
        pll_l: 0,
    };

    FrequencyPlan::new(
        "test",
        vec![
            domain(aux(200_000), 950_000, 0),
            domain(synth(400_000, 0x0F), 1_000_000, 2),
            domain(synth(800_000, 0x1E), 1_100_000, 4),
        ],
        vec![
            row(false, standby, 0, 900_000),
            row(true, aux(200_000), 0, 900_000),
            row(true, synth(400_000, 0x0F), 1, 1_000_000),
            row(true, synth(800_000, 0x1E), 2, 1_100_000),
            row(false, synth(1_000_000, 0x25), 2, 1_250_000),
        ],
    )
    .unwrap()
}

pub fn core_rail_spec(cpu: usize) -> CoreRailSpec {
    CoreRailSpec {
        core: RailSpec::new(format!("krait{}", cpu), 1_300_000),
        mem: RailSpec::new("krait0_mem", 1_150_000),
        dig: RailSpec::new("krait0_dig", 1_150_000),
    }
}

pub fn platform(cores: usize) -> PlatformConfig {
    let supply = PllSupply {
        a: RailSpec::new("hfpll_a", 2_100_000),
        b: RailSpec::new("hfpll_b", 1_800_000),
    };
    let mut pll_supplies: HashMap<Domain, PllSupply> =
        (0..cores).map(|cpu| (Domain::Core(cpu), supply.clone())).collect();
    pll_supplies.insert(Domain::Shared, supply);

    PlatformConfig {
        plan: plan(),
        cores: (0..cores).map(core_rail_spec).collect(),
        pll_supplies,
        floor_uv: DEFAULT_FLOOR_UV,
        boost: false,
        overclock_max_uv: OVERCLOCK_MAX_UV,
    }
}

pub fn engine(cores: usize) -> (Arc<SimulatedSoc>, ScalingEngine) {
    let soc = Arc::new(SimulatedSoc::with_trace());
    let engine = ScalingEngine::new(platform(cores), Backends::simulated(soc.clone())).unwrap();
    (soc, engine)
}
