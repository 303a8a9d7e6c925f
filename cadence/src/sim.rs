//! Simulated SoC
//!
//! In-memory register file, regulator network and interconnect. Rail or
//! bandwidth faults can be injected. A soc built with
//! [`SimulatedSoc::with_trace`] also records every access so callers can
//! check ordering; the plain one keeps no history.

use crate::bandwidth::BandwidthBackend;
use crate::error::BackendError;
use crate::mux::{ClockHardware, Domain, PllRegister};
use crate::rail::{RailBackend, RailId};
use spin::Mutex;
use std::collections::{HashMap, HashSet};

/// Error code reported for injected faults
pub const SIM_FAULT_CODE: i32 = -110;

/// One hardware access
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwEvent {
    CtlWrite { domain: Domain, value: u32 },
    AuxSelect { domain: Domain, value: u32 },
    PllWrite { domain: Domain, reg: PllRegister, value: u32 },
    Delay(u32),
    SetVoltage { rail: RailId, uv: u32, max_uv: u32 },
    EnableRail(RailId),
    Bandwidth(usize),
}

#[derive(Default)]
struct SocState {
    ctl: HashMap<Domain, u32>,
    aux: HashMap<Domain, u32>,
    pll: HashMap<(Domain, PllRegister), u32>,
    voltages: HashMap<RailId, u32>,
    enabled: HashSet<RailId>,
    failing_rails: HashSet<RailId>,
    bandwidth: Option<usize>,
    bandwidth_fails: bool,
    trace: Option<Vec<HwEvent>>,
}

impl SocState {
    fn record(&mut self, event: HwEvent) {
        if let Some(trace) = &mut self.trace {
            trace.push(event);
        }
    }
}

/// Simulated clock, regulator and interconnect hardware
#[derive(Default)]
pub struct SimulatedSoc {
    state: Mutex<SocState>,
}

impl SimulatedSoc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every access
    pub fn with_trace() -> Self {
        let soc = Self::default();
        soc.state.lock().trace = Some(Vec::new());
        soc
    }

    /// All accesses so far, oldest first. Empty unless tracing.
    pub fn trace(&self) -> Vec<HwEvent> {
        self.state.lock().trace.clone().unwrap_or_default()
    }

    pub fn clear_trace(&self) {
        if let Some(trace) = &mut self.state.lock().trace {
            trace.clear();
        }
    }

    /// Voltage requests in order, including rejected ones
    pub fn rail_requests(&self) -> Vec<(RailId, u32)> {
        self.state
            .lock()
            .trace
            .iter()
            .flatten()
            .filter_map(|e| match e {
                HwEvent::SetVoltage { rail, uv, .. } => Some((*rail, *uv)),
                _ => None,
            })
            .collect()
    }

    /// Last voltage the network accepted for a rail
    pub fn voltage(&self, rail: RailId) -> Option<u32> {
        self.state.lock().voltages.get(&rail).copied()
    }

    pub fn is_enabled(&self, rail: RailId) -> bool {
        self.state.lock().enabled.contains(&rail)
    }

    /// Reject every request for `rail` until healed
    pub fn fail_rail(&self, rail: RailId) {
        self.state.lock().failing_rails.insert(rail);
    }

    pub fn heal_rail(&self, rail: RailId) {
        self.state.lock().failing_rails.remove(&rail);
    }

    pub fn fail_bandwidth(&self, fail: bool) {
        self.state.lock().bandwidth_fails = fail;
    }

    /// Last accepted bandwidth level
    pub fn bandwidth_level(&self) -> Option<usize> {
        self.state.lock().bandwidth
    }

    pub fn pll_register(&self, domain: Domain, reg: PllRegister) -> u32 {
        self.state.lock().pll.get(&(domain, reg)).copied().unwrap_or(0)
    }

    pub fn aux_select(&self, domain: Domain) -> u32 {
        self.state.lock().aux.get(&domain).copied().unwrap_or(0)
    }

    fn check_rail(state: &SocState, rail: RailId) -> Result<(), BackendError> {
        if state.failing_rails.contains(&rail) {
            return Err(BackendError::new(SIM_FAULT_CODE, "simulated regulator fault"));
        }
        Ok(())
    }
}

impl ClockHardware for SimulatedSoc {
    fn read_ctl(&self, domain: Domain) -> u32 {
        self.state.lock().ctl.get(&domain).copied().unwrap_or(0)
    }

    fn write_ctl(&self, domain: Domain, value: u32) {
        let mut state = self.state.lock();
        state.ctl.insert(domain, value);
        state.record(HwEvent::CtlWrite { domain, value });
    }

    fn write_aux_select(&self, domain: Domain, value: u32) {
        let mut state = self.state.lock();
        state.aux.insert(domain, value);
        state.record(HwEvent::AuxSelect { domain, value });
    }

    fn write_pll(&self, domain: Domain, reg: PllRegister, value: u32) {
        let mut state = self.state.lock();
        state.pll.insert((domain, reg), value);
        state.record(HwEvent::PllWrite { domain, reg, value });
    }

    fn delay_us(&self, us: u32) {
        self.state.lock().record(HwEvent::Delay(us));
    }
}

impl RailBackend for SimulatedSoc {
    fn set_voltage(&self, rail: RailId, target_uv: u32, max_uv: u32) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(HwEvent::SetVoltage {
            rail,
            uv: target_uv,
            max_uv,
        });
        Self::check_rail(&state, rail)?;
        if target_uv > max_uv {
            return Err(BackendError::new(-22, "voltage above rail maximum"));
        }
        state.voltages.insert(rail, target_uv);
        Ok(())
    }

    fn enable(&self, rail: RailId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(HwEvent::EnableRail(rail));
        Self::check_rail(&state, rail)?;
        state.enabled.insert(rail);
        Ok(())
    }
}

impl BandwidthBackend for SimulatedSoc {
    fn request_level(&self, level: usize) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(HwEvent::Bandwidth(level));
        if state.bandwidth_fails {
            return Err(BackendError::new(SIM_FAULT_CODE, "simulated fabric fault"));
        }
        state.bandwidth = Some(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rail::RailKind;

    #[test]
    fn test_untraced_soc_keeps_no_history() {
        let soc = SimulatedSoc::new();
        let rail = RailId::new(RailKind::Core, Domain::Core(0));

        for _ in 0..1000 {
            soc.write_ctl(Domain::Core(0), 0x3);
            soc.set_voltage(rail, 1_000_000, 1_300_000).unwrap();
            soc.request_level(2).unwrap();
        }

        assert!(soc.trace().is_empty());
        assert!(soc.rail_requests().is_empty());
        assert!(soc.state.lock().trace.is_none());
        // Device state is still tracked.
        assert_eq!(soc.read_ctl(Domain::Core(0)), 0x3);
        assert_eq!(soc.voltage(rail), Some(1_000_000));
        assert_eq!(soc.bandwidth_level(), Some(2));
    }

    #[test]
    fn test_traced_soc_records_in_order() {
        let soc = SimulatedSoc::with_trace();
        let rail = RailId::new(RailKind::Mem, Domain::Shared);

        soc.set_voltage(rail, 1_050_000, 1_150_000).unwrap();
        soc.delay_us(5);

        assert_eq!(
            soc.trace(),
            vec![
                HwEvent::SetVoltage { rail, uv: 1_050_000, max_uv: 1_150_000 },
                HwEvent::Delay(5),
            ]
        );
        soc.clear_trace();
        assert!(soc.trace().is_empty());
    }
}
