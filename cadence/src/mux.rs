//! Clock source multiplexer and frequency synthesizer control
//!
//! Every clocked domain (each core and the shared cache domain) has one
//! control register holding a two-stage mux, plus a synthesizer block. The
//! primary mux picks between the synthesizer (full or half rate) and the
//! secondary path; the secondary mux picks one of the always-on references.

use crate::rail::{RailBackend, RailId, RailKind, RailSpec};
use crate::table::Speed;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Primary and secondary select values
pub mod select {
    /// Primary: route the secondary mux output
    pub const PRI_SECONDARY: u32 = 0;
    /// Primary: synthesizer
    pub const PRI_SYNTH: u32 = 1;
    /// Primary: synthesizer divided by two
    pub const PRI_SYNTH_DIV2: u32 = 2;
    /// Secondary: low-speed standby reference
    pub const SEC_STANDBY: u32 = 0;
    /// Secondary: auxiliary mid-speed reference
    pub const SEC_AUX: u32 = 2;
}

const PRI_MASK: u32 = 0x3;
const SEC_SHIFT: u32 = 2;
const SEC_MASK: u32 = 0x3 << SEC_SHIFT;
const GATE_HOLD: u32 = 1 << 4;
const DIV2_MASK: u32 = 0x3 << 6;

/// Auxiliary input select routing the mid-speed reference to the secondary mux
pub const AUX_SELECT_REFERENCE: u32 = 0x3;

/// Minimum time for a mux switch to settle
pub const MUX_SETTLE_US: u32 = 1;
/// Bypass release to reset release; hardware needs 5
pub const PLL_RESET_DELAY_US: u32 = 10;
/// Lock acquisition
pub const PLL_LOCK_DELAY_US: u32 = 60;

/// Synthesizer mode register values
pub mod pll_mode {
    /// Output off, bypass on, reset asserted
    pub const OFF: u32 = 0x0;
    pub const BYPASS_RELEASED: u32 = 0x2;
    pub const RESET_RELEASED: u32 = 0x6;
    pub const OUTPUT_ENABLED: u32 = 0x7;
}

/// Integer-mode configuration applied once at init
pub const PLL_CONFIG_CTL: u32 = 0x7845_C665;
pub const PLL_DROOP_CTL: u32 = 0x0108_C000;

/// Synthesizer supply targets
pub const PLL_SUPPLY_A_UV: u32 = 2_100_000;
pub const PLL_SUPPLY_B_UV: u32 = 1_800_000;

/// A clocked domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Core(usize),
    Shared,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Core(cpu) => write!(f, "cpu{}", cpu),
            Domain::Shared => write!(f, "l2"),
        }
    }
}

/// Synthesizer registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PllRegister {
    Mode,
    ConfigCtl,
    LVal,
    MVal,
    NVal,
    DroopCtl,
}

/// Register access for the clock hardware
pub trait ClockHardware: Send + Sync {
    fn read_ctl(&self, domain: Domain) -> u32;
    fn write_ctl(&self, domain: Domain, value: u32);
    fn write_aux_select(&self, domain: Domain, value: u32);
    fn write_pll(&self, domain: Domain, reg: PllRegister, value: u32);
    /// Busy-wait; must not sleep
    fn delay_us(&self, us: u32);
}

/// Saved mux state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxSelects {
    pub pri: u32,
    pub sec: u32,
}

/// Synthesizer supply rails of one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PllSupply {
    pub a: RailSpec,
    pub b: RailSpec,
}

/// Mux and synthesizer programming for all domains
pub struct ClockSourceMux {
    hw: Arc<dyn ClockHardware>,
    rails: Arc<dyn RailBackend>,
    supplies: HashMap<Domain, PllSupply>,
}

impl ClockSourceMux {
    pub fn new(
        hw: Arc<dyn ClockHardware>,
        rails: Arc<dyn RailBackend>,
        supplies: HashMap<Domain, PllSupply>,
    ) -> Self {
        Self { hw, rails, supplies }
    }

    pub fn read_primary_select(&self, domain: Domain) -> u32 {
        self.hw.read_ctl(domain) & PRI_MASK
    }

    /// Single write, then settle. No gating needed on the primary path.
    pub fn write_primary_select(&self, domain: Domain, sel: u32) {
        let mut regval = self.hw.read_ctl(domain);
        regval &= !PRI_MASK;
        regval |= sel & PRI_MASK;
        self.hw.write_ctl(domain, regval);
        self.hw.delay_us(MUX_SETTLE_US);
    }

    pub fn read_secondary_select(&self, domain: Domain) -> u32 {
        (self.hw.read_ctl(domain) & SEC_MASK) >> SEC_SHIFT
    }

    /// Gate-hold around the select write so the output cannot glitch
    pub fn write_secondary_select(&self, domain: Domain, sel: u32) {
        let mut regval = self.hw.read_ctl(domain);
        regval |= GATE_HOLD;
        self.hw.write_ctl(domain, regval);

        regval &= !SEC_MASK;
        regval |= (sel << SEC_SHIFT) & SEC_MASK;
        self.hw.write_ctl(domain, regval);

        self.hw.delay_us(MUX_SETTLE_US);

        regval &= !GATE_HOLD;
        self.hw.write_ctl(domain, regval);
    }

    pub fn selects(&self, domain: Domain) -> MuxSelects {
        MuxSelects {
            pri: self.read_primary_select(domain),
            sec: self.read_secondary_select(domain),
        }
    }

    pub fn restore_selects(&self, domain: Domain, selects: MuxSelects) {
        self.write_secondary_select(domain, selects.sec);
        self.write_primary_select(domain, selects.pri);
    }

    /// Route the domain to the standby reference
    pub fn park(&self, domain: Domain) {
        self.write_secondary_select(domain, select::SEC_STANDBY);
        self.write_primary_select(domain, select::PRI_SECONDARY);
    }

    /// Disable, load the multiplier and re-enable. The synthesizer must not
    /// be the selected source.
    pub fn program_synthesizer(&self, domain: Domain, speed: &Speed) {
        debug!("Programming {} synthesizer for {} kHz (L=0x{:02X})", domain, speed.khz, speed.pll_l);
        self.disable_synthesizer(domain, false);
        self.hw.write_pll(domain, PllRegister::LVal, speed.pll_l);
        self.enable_synthesizer(domain);
    }

    /// Energize the supplies, then walk the mode register out of bypass and
    /// reset. Supply failures are logged and the sequence continues.
    pub fn enable_synthesizer(&self, domain: Domain) {
        if let Some(supply) = self.supplies.get(&domain) {
            self.request_supply(domain, RailKind::PllA, PLL_SUPPLY_A_UV, supply.a.max_uv, &supply.a.name);
            self.request_supply(domain, RailKind::PllB, PLL_SUPPLY_B_UV, supply.b.max_uv, &supply.b.name);
        }

        self.hw.write_pll(domain, PllRegister::Mode, pll_mode::BYPASS_RELEASED);
        self.hw.delay_us(PLL_RESET_DELAY_US);

        self.hw.write_pll(domain, PllRegister::Mode, pll_mode::RESET_RELEASED);
        self.hw.delay_us(PLL_LOCK_DELAY_US);

        self.hw.write_pll(domain, PllRegister::Mode, pll_mode::OUTPUT_ENABLED);
    }

    /// Force bypass and reset. With `release_supply` the synthesizer is
    /// being powered down and its supplies are dropped too.
    pub fn disable_synthesizer(&self, domain: Domain, release_supply: bool) {
        self.hw.write_pll(domain, PllRegister::Mode, pll_mode::OFF);

        if !release_supply {
            return;
        }
        if let Some(supply) = self.supplies.get(&domain) {
            self.request_supply(domain, RailKind::PllB, 0, 0, &supply.b.name);
            self.request_supply(domain, RailKind::PllA, 0, 0, &supply.a.name);
        }
    }

    /// One-time setup: park on the auxiliary reference, configure the
    /// synthesizer in integer mode at `speed`, then select `speed`.
    pub fn init_domain(&self, domain: Domain, speed: &Speed) {
        debug!("Initializing {} clock at {} kHz", domain, speed.khz);

        self.hw.write_aux_select(domain, AUX_SELECT_REFERENCE);
        self.write_secondary_select(domain, select::SEC_AUX);
        self.write_primary_select(domain, select::PRI_SECONDARY);

        self.disable_synthesizer(domain, false);
        self.hw.write_pll(domain, PllRegister::ConfigCtl, PLL_CONFIG_CTL);
        self.hw.write_pll(domain, PllRegister::MVal, 0);
        self.hw.write_pll(domain, PllRegister::NVal, 1);
        self.hw.write_pll(domain, PllRegister::DroopCtl, PLL_DROOP_CTL);
        self.hw.write_pll(domain, PllRegister::LVal, speed.pll_l);
        self.enable_synthesizer(domain);

        let regval = self.hw.read_ctl(domain) & !DIV2_MASK;
        self.hw.write_ctl(domain, regval);

        self.write_secondary_select(domain, speed.sec_sel);
        self.write_primary_select(domain, speed.pri_sel);
    }

    fn request_supply(&self, domain: Domain, kind: RailKind, uv: u32, max_uv: u32, name: &str) {
        if let Err(e) = self.rails.set_voltage(RailId::new(kind, domain), uv, max_uv) {
            error!("{} supply {} request for {} uV failed: {}", domain, name, uv, e);
        }
    }
}
