//! Scaling engine
//!
//! Orchestrates one transition: look up the row, raise voltages, switch the
//! core clock, vote for the shared domain and switch it, update bandwidth,
//! then lower voltages.
//!
//! Locking:
//! - the scaling lock (blocking) serializes ordinary and hot-plug calls and
//!   guards the rail caches and the overridable table columns
//! - each core's clock record sits behind its own spinlock so the idle path
//!   can switch its own core without the scaling lock
//! - the vote lock (spinlock) makes vote + shared-domain switch atomic
//!
//! Order is always scaling → core clock → vote.

use crate::bandwidth::{BandwidthBackend, BandwidthRequester};
use crate::error::{Result, ScalingError};
use crate::mux::{select, ClockHardware, ClockSourceMux, Domain, MuxSelects, PllSupply};
use crate::rail::RailBackend;
use crate::sim::SimulatedSoc;
use crate::table::{CoreLevelId, DomainLevelId, FrequencyPlan, Speed, STANDBY_KHZ};
use crate::voltage::{
    CoreRailSpec, CoreRails, VoltageSequencer, VoltageTargets, MAX_FLOOR_UV, MIN_FLOOR_UV,
};
use crate::vote::DomainVoteAggregator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Core-rail ceiling once overclock rows are enabled
pub const OVERCLOCK_MAX_UV: u32 = 1_400_000;

/// Why a rate change was requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetRateReason {
    /// Policy-driven
    #[default]
    Normal,
    /// Issued from a surviving core on behalf of one going down or coming up
    Hotplug,
    /// Idle power collapse entry/exit
    PowerCollapse,
    /// Wait-for-interrupt entry/exit
    WaitForInterrupt,
}

impl SetRateReason {
    /// Latency-critical calls that skip the scaling lock and never touch voltage
    pub fn is_idle(self) -> bool {
        matches!(self, Self::PowerCollapse | Self::WaitForInterrupt)
    }
}

/// What a transition may touch from the executing context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Access {
    /// The target core's mux registers are only reachable from that core
    can_touch_mux: bool,
    /// The core regulator must be driven from the owning core
    can_touch_core_rail: bool,
}

impl Access {
    fn new(reason: SetRateReason, is_self: bool) -> Self {
        let local = is_self && reason != SetRateReason::Hotplug;
        Self {
            can_touch_mux: local,
            can_touch_core_rail: local,
        }
    }
}

/// Everything the engine needs to know about the chip, fixed at start
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub plan: FrequencyPlan,
    /// One entry per core
    pub cores: Vec<CoreRailSpec>,
    /// Synthesizer supplies, for domains that have them
    pub pll_supplies: HashMap<Domain, PllSupply>,
    pub floor_uv: u32,
    pub boost: bool,
    pub overclock_max_uv: u32,
}

/// External collaborators
#[derive(Clone)]
pub struct Backends {
    pub clock: Arc<dyn ClockHardware>,
    pub rails: Arc<dyn RailBackend>,
    pub bandwidth: Arc<dyn BandwidthBackend>,
}

impl Backends {
    pub fn simulated(soc: Arc<SimulatedSoc>) -> Self {
        Self {
            clock: soc.clone(),
            rails: soc.clone(),
            bandwidth: soc,
        }
    }
}

/// Per-core clock record
#[derive(Debug, Clone)]
struct CoreClock {
    current: CoreLevelId,
    first_transition: bool,
    transitions: u64,
    last_change: Option<DateTime<Utc>>,
}

/// State behind the scaling lock
struct ScalingState {
    rails: Vec<CoreRails>,
    vdd_core_uv: Vec<u32>,
    enabled: Vec<bool>,
    boot_max: CoreLevelId,
    floor_uv: u32,
    boost: bool,
}

/// One row of the administrative voltage table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoltageEntry {
    pub khz: u32,
    pub uv: u32,
}

/// Per-core status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreStatus {
    pub cpu: usize,
    pub khz: u32,
    pub vote_khz: u32,
    pub first_transition: bool,
    pub transitions: u64,
    pub last_change: Option<DateTime<Utc>>,
    pub core_uv: u32,
    pub mem_uv: u32,
    pub dig_uv: u32,
}

/// Shared-domain status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStatus {
    pub khz: u32,
    pub level: usize,
    pub bw_level: usize,
    pub bw_mbps: Option<u32>,
}

/// Engine status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub plan: String,
    pub cores: Vec<CoreStatus>,
    pub shared: SharedStatus,
    pub floor_uv: u32,
    pub boost: bool,
}

/// Multi-domain frequency and voltage scaling engine
pub struct ScalingEngine {
    plan: FrequencyPlan,
    mux: ClockSourceMux,
    sequencer: VoltageSequencer,
    bandwidth: BandwidthRequester,
    votes: DomainVoteAggregator,
    clocks: Vec<spin::Mutex<CoreClock>>,
    scaling: std::sync::Mutex<ScalingState>,
    overclock_max_uv: u32,
}

impl ScalingEngine {
    /// Bring every domain up at the fastest row enabled for scaling
    pub fn new(config: PlatformConfig, backends: Backends) -> Result<Self> {
        let PlatformConfig {
            plan,
            cores,
            pll_supplies,
            floor_uv,
            boost,
            overclock_max_uv,
        } = config;

        if cores.is_empty() {
            return Err(ScalingError::InvalidPlan("platform has no cores".into()));
        }
        let max = plan
            .max_scaling_level()
            .ok_or_else(|| ScalingError::InvalidPlan("no row enabled for scaling".into()))?;
        let max_level = *plan.core_level(max);
        let vote = plan.vote_of(max);
        info!(
            "Plan {}: max CPU freq {} kHz, L2 {} kHz",
            plan.name(),
            max_level.speed.khz,
            plan.domain_level(vote).speed.khz
        );

        let mux = ClockSourceMux::new(backends.clock, backends.rails.clone(), pll_supplies);
        let sequencer = VoltageSequencer::new(backends.rails);
        let bandwidth = BandwidthRequester::new(backends.bandwidth);

        let mut rails: Vec<CoreRails> = cores
            .iter()
            .enumerate()
            .map(|(cpu, spec)| CoreRails::new(cpu, spec))
            .collect();
        for (cpu, core_rails) in rails.iter_mut().enumerate() {
            sequencer.init_core_rail(cpu, core_rails, max_level.vdd_core_uv);
        }

        if let Err(e) = bandwidth.request(plan.domain_level(vote).bw_level) {
            warn!("Initial bandwidth request failed: {}", e);
        }

        mux.init_domain(Domain::Shared, &plan.domain_level(vote).speed);
        for cpu in 0..cores.len() {
            mux.init_domain(Domain::Core(cpu), &max_level.speed);
        }

        let clocks = (0..cores.len())
            .map(|_| {
                spin::Mutex::new(CoreClock {
                    current: max,
                    first_transition: true,
                    transitions: 0,
                    last_change: None,
                })
            })
            .collect();

        let state = ScalingState {
            rails,
            vdd_core_uv: plan.core_levels().iter().map(|l| l.vdd_core_uv).collect(),
            enabled: plan.core_levels().iter().map(|l| l.enabled).collect(),
            boot_max: max,
            floor_uv,
            boost,
        };

        Ok(Self {
            votes: DomainVoteAggregator::new(cores.len(), vote),
            plan,
            mux,
            sequencer,
            bandwidth,
            clocks,
            scaling: std::sync::Mutex::new(state),
            overclock_max_uv,
        })
    }

    pub fn plan(&self) -> &FrequencyPlan {
        &self.plan
    }

    pub fn num_cores(&self) -> usize {
        self.clocks.len()
    }

    /// Current frequency of a core (kHz)
    pub fn get_rate(&self, cpu: usize) -> Result<u32> {
        self.check_cpu(cpu)?;
        let current = self.clocks[cpu].lock().current;
        Ok(self.plan.core_level(current).speed.khz)
    }

    /// Level the shared domain is running at
    pub fn shared_level(&self) -> DomainLevelId {
        self.votes.current()
    }

    /// A core's current shared-domain vote
    pub fn vote_of(&self, cpu: usize) -> Result<DomainLevelId> {
        self.check_cpu(cpu)?;
        Ok(self.votes.vote_of(cpu))
    }

    /// Copy of a core's rail bookkeeping
    pub fn rails_of(&self, cpu: usize) -> Result<CoreRails> {
        self.check_cpu(cpu)?;
        Ok(self.lock_scaling().rails[cpu].clone())
    }

    /// Move `cpu` to exactly `khz`.
    ///
    /// Hot-plug calls are issued from a surviving core, so they never touch
    /// the target core's mux or core rail.
    pub fn set_rate(&self, cpu: usize, khz: u32, reason: SetRateReason) -> Result<()> {
        self.check_cpu(cpu)?;
        let access = Access::new(reason, reason != SetRateReason::Hotplug);

        if reason.is_idle() {
            return self.idle_transition(cpu, khz, access);
        }

        let mut guard = self.lock_scaling();
        let state = &mut *guard;

        let target = self
            .plan
            .find_core_level(khz)
            .ok_or(ScalingError::InvalidFrequency(khz))?;
        if self.is_noop(cpu, target) {
            return Ok(());
        }

        let targets = VoltageTargets::for_level(&self.plan, target, state.vdd_core_uv[target.0], state.boost);

        self.sequencer
            .raise(cpu, &mut state.rails[cpu], &targets, access.can_touch_core_rail)?;

        self.switch_core_clock(cpu, target, access);

        let shared = self.vote_and_switch_domain(cpu, target);

        let bw_level = self.plan.domain_level(shared).bw_level;
        if let Err(e) = self.bandwidth.request(bw_level) {
            warn!("{}", e);
        }

        if let Err(e) = self.sequencer.lower(
            cpu,
            &mut state.rails[cpu],
            &targets,
            state.floor_uv,
            access.can_touch_core_rail,
        ) {
            warn!("cpu{} voltage decrease incomplete: {}", cpu, e);
        }

        self.clocks[cpu].lock().first_transition = false;
        debug!("cpu{} speed change complete", cpu);
        Ok(())
    }

    /// Idle entry/exit: clocks and vote only. The caller guarantees the
    /// target is safe at the voltage already held.
    fn idle_transition(&self, cpu: usize, khz: u32, access: Access) -> Result<()> {
        let target = self
            .plan
            .find_core_level(khz)
            .ok_or(ScalingError::InvalidFrequency(khz))?;
        if self.is_noop(cpu, target) {
            return Ok(());
        }

        self.switch_core_clock(cpu, target, access);
        self.vote_and_switch_domain(cpu, target);
        Ok(())
    }

    fn is_noop(&self, cpu: usize, target: CoreLevelId) -> bool {
        let clock = self.clocks[cpu].lock();
        clock.current == target && !clock.first_transition
    }

    fn switch_core_clock(&self, cpu: usize, target: CoreLevelId, access: Access) {
        let mut clock = self.clocks[cpu].lock();
        let from = self.plan.core_level(clock.current).speed;
        let to = self.plan.core_level(target).speed;

        debug!("Switching cpu{} from {} kHz to {} kHz", cpu, from.khz, to.khz);
        self.switch_speed(Domain::Core(cpu), &from, &to, access.can_touch_mux);

        if clock.current != target {
            clock.current = target;
            clock.transitions += 1;
            clock.last_change = Some(Utc::now());
        }
    }

    fn vote_and_switch_domain(&self, cpu: usize, target: CoreLevelId) -> DomainLevelId {
        let vote = self.plan.vote_of(target);
        self.votes.record_vote(cpu, vote, |from, to| {
            let from = self.plan.domain_level(from).speed;
            let to = self.plan.domain_level(to).speed;
            debug!("Switching l2 from {} kHz to {} kHz", from.khz, to.khz);
            // The shared domain is always reachable from the executing core.
            self.switch_speed(Domain::Shared, &from, &to, true);
        })
    }

    /// Four-way dispatch on (source kind, target kind)
    fn switch_speed(&self, domain: Domain, from: &Speed, to: &Speed, can_touch_mux: bool) {
        if from == to {
            return;
        }

        match (from.source.is_synthesizer(), to.source.is_synthesizer()) {
            (true, true) => {
                // Park on the auxiliary reference, which needs no extra
                // voltage, while the synthesizer is reprogrammed.
                if can_touch_mux {
                    self.mux.write_secondary_select(domain, select::SEC_AUX);
                    self.mux.write_primary_select(domain, select::PRI_SECONDARY);
                }
                self.mux.program_synthesizer(domain, to);
                if can_touch_mux {
                    self.mux.write_primary_select(domain, to.pri_sel);
                }
            }
            (true, false) => {
                // A downed core is already halted; only its synthesizer
                // can be stopped from here.
                if can_touch_mux {
                    self.mux.write_secondary_select(domain, to.sec_sel);
                    self.mux.write_primary_select(domain, to.pri_sel);
                }
                self.mux.disable_synthesizer(domain, true);
            }
            (false, true) => {
                self.mux.program_synthesizer(domain, to);
                // The mux was not changed on the way down either.
                if can_touch_mux {
                    self.mux.write_primary_select(domain, to.pri_sel);
                }
            }
            (false, false) => {
                if can_touch_mux {
                    self.mux.write_secondary_select(domain, to.sec_sel);
                }
            }
        }
    }

    /// Save the core's mux selects and route it to the standby reference.
    /// Must run on `cpu` itself.
    pub fn park_core_mux(&self, cpu: usize) -> Result<MuxSelects> {
        self.check_cpu(cpu)?;
        let _clock = self.clocks[cpu].lock();
        let saved = self.mux.selects(Domain::Core(cpu));
        self.mux.park(Domain::Core(cpu));
        Ok(saved)
    }

    /// Put back selects saved by [`park_core_mux`](Self::park_core_mux).
    /// Must run on `cpu` itself.
    pub fn restore_core_mux(&self, cpu: usize, selects: MuxSelects) -> Result<()> {
        self.check_cpu(cpu)?;
        let _clock = self.clocks[cpu].lock();
        self.mux.restore_selects(Domain::Core(cpu), selects);
        Ok(())
    }

    // ---- policy-facing table views ----

    /// Rows the policy layer may select, ascending
    pub fn scaling_frequencies(&self) -> Vec<u32> {
        let state = self.lock_scaling();
        self.plan
            .core_levels()
            .iter()
            .zip(&state.enabled)
            .filter(|(_, enabled)| **enabled)
            .map(|(level, _)| level.speed.khz)
            .collect()
    }

    /// Every row except standby
    pub fn all_frequencies(&self) -> Vec<u32> {
        self.plan
            .core_levels()
            .iter()
            .map(|l| l.speed.khz)
            .filter(|khz| *khz != STANDBY_KHZ)
            .collect()
    }

    pub fn max_scaling_frequency(&self) -> Option<u32> {
        self.scaling_frequencies().last().copied()
    }

    // ---- administrative override ----

    /// Core voltage column, standby row excluded
    pub fn voltage_table(&self) -> Vec<VoltageEntry> {
        let state = self.lock_scaling();
        self.plan
            .core_levels()
            .iter()
            .zip(&state.vdd_core_uv)
            .filter(|(level, _)| level.speed.khz != STANDBY_KHZ)
            .map(|(level, uv)| VoltageEntry {
                khz: level.speed.khz,
                uv: *uv,
            })
            .collect()
    }

    pub fn set_core_voltage(&self, khz: u32, uv: u32) -> Result<()> {
        self.apply_voltage_table(&[VoltageEntry { khz, uv }])
    }

    /// Bulk update keyed by frequency. Nothing changes unless every entry
    /// is valid.
    pub fn apply_voltage_table(&self, entries: &[VoltageEntry]) -> Result<()> {
        let mut state = self.lock_scaling();

        let mut updates = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = self.override_row(entry.khz)?;
            let uv = self.check_override_uv(&state, id, i64::from(entry.uv))?;
            updates.push((id, uv));
        }

        for (id, uv) in updates {
            state.vdd_core_uv[id.0] = uv;
        }
        info!("Updated core voltage for {} table rows", entries.len());
        Ok(())
    }

    /// Shift every non-standby row by `delta_uv`
    pub fn adjust_core_voltages(&self, delta_uv: i32) -> Result<()> {
        let mut state = self.lock_scaling();

        let mut updated = state.vdd_core_uv.clone();
        for (row, (level, uv)) in self.plan.core_levels().iter().zip(updated.iter_mut()).enumerate() {
            if level.speed.khz == STANDBY_KHZ {
                continue;
            }
            *uv = self.check_override_uv(&state, CoreLevelId(row), i64::from(*uv) + i64::from(delta_uv))?;
        }

        state.vdd_core_uv = updated;
        info!("Adjusted core voltages by {} uV", delta_uv);
        Ok(())
    }

    pub fn voltage_floor(&self) -> u32 {
        self.lock_scaling().floor_uv
    }

    /// Minimum core voltage applied when lowering
    pub fn set_voltage_floor(&self, uv: u32) -> Result<()> {
        if !(MIN_FLOOR_UV..=MAX_FLOOR_UV).contains(&uv) {
            return Err(ScalingError::InvalidVoltage {
                uv: i64::from(uv),
                reason: format!("floor must be within {}..={} uV", MIN_FLOOR_UV, MAX_FLOOR_UV),
            });
        }
        self.lock_scaling().floor_uv = uv;
        info!("Core voltage floor set to {} uV", uv);
        Ok(())
    }

    pub fn boost(&self) -> bool {
        self.lock_scaling().boost
    }

    /// Takes effect on the next transition
    pub fn set_boost(&self, enabled: bool) {
        self.lock_scaling().boost = enabled;
    }

    /// Enable the rows above the boot-time maximum up to `max_khz`.
    /// Returns the resulting scaling frequencies.
    pub fn set_scaling_limit(&self, max_khz: u32) -> Vec<u32> {
        {
            let mut state = self.lock_scaling();
            let first_extra = state.boot_max.0 + 1;
            let mut any_extra = false;

            for (i, level) in self.plan.core_levels().iter().enumerate().skip(first_extra) {
                let enabled = level.speed.khz <= max_khz;
                state.enabled[i] = enabled;
                any_extra |= enabled;
            }

            if any_extra {
                for rails in &mut state.rails {
                    rails.core.max_uv = rails.core.max_uv.max(self.overclock_max_uv);
                }
            }
            info!("Scaling limit set to {} kHz", max_khz);
        }
        self.scaling_frequencies()
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.lock_scaling();
        let shared = self.votes.snapshot();

        let cores = self
            .clocks
            .iter()
            .enumerate()
            .map(|(cpu, clock)| {
                let clock = clock.lock().clone();
                let rails = &state.rails[cpu];
                CoreStatus {
                    cpu,
                    khz: self.plan.core_level(clock.current).speed.khz,
                    vote_khz: self.plan.domain_level(shared.votes()[cpu]).speed.khz,
                    first_transition: clock.first_transition,
                    transitions: clock.transitions,
                    last_change: clock.last_change,
                    core_uv: rails.core.current_uv,
                    mem_uv: rails.mem.current_uv,
                    dig_uv: rails.dig.current_uv,
                }
            })
            .collect();

        let level = self.plan.domain_level(shared.current());
        EngineStatus {
            plan: self.plan.name().to_string(),
            cores,
            shared: SharedStatus {
                khz: level.speed.khz,
                level: shared.current().0,
                bw_level: level.bw_level,
                bw_mbps: BandwidthRequester::level_mbps(level.bw_level),
            },
            floor_uv: state.floor_uv,
            boost: state.boost,
        }
    }

    fn override_row(&self, khz: u32) -> Result<CoreLevelId> {
        if khz == STANDBY_KHZ {
            return Err(ScalingError::InvalidFrequency(khz));
        }
        self.plan
            .find_core_level(khz)
            .ok_or(ScalingError::InvalidFrequency(khz))
    }

    /// Rows above the boot maximum only ever run with the overclock
    /// ceiling in place, so they are checked against it.
    fn check_override_uv(&self, state: &ScalingState, row: CoreLevelId, uv: i64) -> Result<u32> {
        let rail_max = state
            .rails
            .iter()
            .map(|r| r.core.max_uv)
            .min()
            .unwrap_or(0);
        let ceiling = if row > state.boot_max {
            rail_max.max(self.overclock_max_uv)
        } else {
            rail_max
        };
        if uv < 1 || uv > i64::from(ceiling) {
            return Err(ScalingError::InvalidVoltage {
                uv,
                reason: format!("must be within 1..={} uV", ceiling),
            });
        }
        Ok(uv as u32)
    }

    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.clocks.len() {
            return Err(ScalingError::InvalidCore(cpu));
        }
        Ok(())
    }

    fn lock_scaling(&self) -> MutexGuard<'_, ScalingState> {
        self.scaling.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::mux::{pll_mode, PllRegister};
    use crate::rail::{RailId, RailKind};
    use crate::sim::HwEvent;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::thread;

    const FREQS: [u32; 3] = [200_000, 400_000, 800_000];

    fn core_events(soc: &SimulatedSoc, cpu: usize) -> Vec<HwEvent> {
        soc.trace()
            .into_iter()
            .filter(|e| match e {
                HwEvent::CtlWrite { domain, .. } | HwEvent::PllWrite { domain, .. } => {
                    *domain == Domain::Core(cpu)
                }
                _ => false,
            })
            .collect()
    }

    fn has_voltage_or_bandwidth(soc: &SimulatedSoc) -> bool {
        soc.trace()
            .iter()
            .any(|e| matches!(e, HwEvent::SetVoltage { .. } | HwEvent::Bandwidth(_)))
    }

    /// Shared level must equal the maximum vote and every rail must cover
    /// its core's current row.
    fn assert_invariants(engine: &ScalingEngine) {
        let votes: Vec<_> = (0..engine.num_cores())
            .map(|cpu| engine.vote_of(cpu).unwrap())
            .collect();
        assert_eq!(engine.shared_level(), *votes.iter().max().unwrap());

        let floor = engine.voltage_floor();
        for cpu in 0..engine.num_cores() {
            let khz = engine.get_rate(cpu).unwrap();
            if khz == STANDBY_KHZ {
                continue;
            }
            let level = engine.plan().find_core_level(khz).unwrap();
            let uv = engine.voltage_table().iter().find(|e| e.khz == khz).unwrap().uv;
            let need = VoltageTargets::for_level(engine.plan(), level, uv, engine.boost());
            let rails = engine.rails_of(cpu).unwrap();
            assert!(rails.mem.current_uv >= need.mem_uv);
            assert!(rails.dig.current_uv >= need.dig_uv);
            assert!(rails.core.current_uv >= need.core_uv);
            assert!(rails.core.current_uv >= floor);
        }
    }

    #[test]
    fn test_init_brings_domains_up_at_max_scaling_row() {
        let (soc, engine) = fixtures::engine(2);

        for cpu in 0..2 {
            assert_eq!(engine.get_rate(cpu).unwrap(), 800_000);
            assert_eq!(engine.vote_of(cpu).unwrap(), DomainLevelId(2));
            let core = RailId::new(RailKind::Core, Domain::Core(cpu));
            assert_eq!(soc.voltage(core), Some(1_100_000));
            assert!(soc.is_enabled(core));
        }
        assert_eq!(engine.shared_level(), DomainLevelId(2));
        assert_eq!(soc.bandwidth_level(), Some(4));
        assert!(engine.status().cores.iter().all(|c| c.first_transition));
    }

    #[test]
    fn test_two_core_shared_domain_scenario() {
        let (_soc, engine) = fixtures::engine(2);

        engine.set_rate(0, 800_000, SetRateReason::Normal).unwrap();
        assert_eq!(engine.shared_level(), DomainLevelId(2));

        engine.set_rate(1, 200_000, SetRateReason::Normal).unwrap();
        assert_eq!(engine.vote_of(1).unwrap(), DomainLevelId(0));
        assert_eq!(engine.shared_level(), DomainLevelId(2));

        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();
        assert_eq!(engine.shared_level(), DomainLevelId(0));

        assert_eq!(engine.get_rate(0).unwrap(), 200_000);
        assert_eq!(engine.get_rate(1).unwrap(), 200_000);
        assert_invariants(&engine);
    }

    #[test]
    fn test_first_transition_runs_even_at_current_rate() {
        let (soc, engine) = fixtures::engine(1);
        soc.clear_trace();

        engine.set_rate(0, 800_000, SetRateReason::Normal).unwrap();

        let trace = soc.trace();
        assert!(trace.contains(&HwEvent::Bandwidth(4)));
        let mem = RailId::new(RailKind::Mem, Domain::Core(0));
        assert_eq!(soc.voltage(mem), Some(1_100_000));
        assert!(core_events(&soc, 0).is_empty());
        assert!(!engine.status().cores[0].first_transition);
    }

    #[test]
    fn test_repeated_rate_is_noop() {
        let (soc, engine) = fixtures::engine(1);
        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();
        soc.clear_trace();

        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();

        assert!(soc.trace().is_empty());
        assert_eq!(engine.status().cores[0].transitions, 1);
    }

    #[test]
    fn test_invalid_requests_mutate_nothing() {
        let (soc, engine) = fixtures::engine(2);
        soc.clear_trace();

        assert!(matches!(
            engine.set_rate(0, 300_000, SetRateReason::Normal),
            Err(ScalingError::InvalidFrequency(300_000))
        ));
        assert!(matches!(
            engine.set_rate(2, 400_000, SetRateReason::Normal),
            Err(ScalingError::InvalidCore(2))
        ));
        assert!(matches!(engine.get_rate(5), Err(ScalingError::InvalidCore(5))));

        assert!(soc.trace().is_empty());
        assert!(engine.status().cores[0].first_transition);
    }

    #[test]
    fn test_raise_failure_aborts_before_clock_mutation() {
        let (soc, engine) = fixtures::engine(2);
        let dig = RailId::new(RailKind::Dig, Domain::Core(0));
        soc.fail_rail(dig);
        soc.clear_trace();

        let err = engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap_err();

        assert!(matches!(err, ScalingError::RailFailure { .. }));
        assert!(core_events(&soc, 0).is_empty());
        assert!(!soc.trace().iter().any(|e| matches!(e, HwEvent::Bandwidth(_))));
        assert_eq!(engine.get_rate(0).unwrap(), 800_000);
        assert_eq!(engine.vote_of(0).unwrap(), DomainLevelId(2));
        assert!(engine.status().cores[0].first_transition);

        // Memory rail went up before the failure and stays there.
        let mem = RailId::new(RailKind::Mem, Domain::Core(0));
        assert_eq!(soc.voltage(mem), Some(1_000_000));

        soc.heal_rail(dig);
        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();
        assert_eq!(engine.get_rate(0).unwrap(), 400_000);
    }

    #[test]
    fn test_lower_failure_is_not_fatal() {
        let (soc, engine) = fixtures::engine(1);
        engine.set_rate(0, 800_000, SetRateReason::Normal).unwrap();
        soc.fail_rail(RailId::new(RailKind::Core, Domain::Core(0)));

        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();

        assert_eq!(engine.get_rate(0).unwrap(), 200_000);
        let rails = engine.rails_of(0).unwrap();
        assert_eq!(rails.core.current_uv, 1_100_000);
        // Stopped at the core rail; shared rails were not lowered either.
        assert_eq!(rails.mem.current_uv, 1_100_000);
    }

    #[test]
    fn test_bandwidth_failure_is_not_fatal() {
        let (soc, engine) = fixtures::engine(1);
        soc.fail_bandwidth(true);

        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();

        assert_eq!(engine.get_rate(0).unwrap(), 400_000);
        assert_eq!(engine.rails_of(0).unwrap().core.current_uv, 1_000_000);
        assert_eq!(soc.bandwidth_level(), Some(4));
    }

    #[test]
    fn test_synthesizer_to_synthesizer_parks_on_aux() {
        let (soc, engine) = fixtures::engine(1);
        engine.set_rate(0, 800_000, SetRateReason::Normal).unwrap();
        soc.clear_trace();

        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();

        let events = core_events(&soc, 0);
        let park = events
            .iter()
            .position(|e| matches!(e, HwEvent::CtlWrite { value, .. } if value & 0x3 == select::PRI_SECONDARY && (value >> 2) & 0x3 == select::SEC_AUX))
            .unwrap();
        let program = events
            .iter()
            .position(|e| matches!(e, HwEvent::PllWrite { reg: PllRegister::LVal, value: 0x0F, .. }))
            .unwrap();
        assert!(park < program);
        assert_eq!(
            events.last(),
            Some(&HwEvent::CtlWrite {
                domain: Domain::Core(0),
                value: (select::SEC_AUX << 2) | select::PRI_SYNTH
            })
        );
        assert_eq!(soc.pll_register(Domain::Core(0), PllRegister::Mode), pll_mode::OUTPUT_ENABLED);
    }

    #[test]
    fn test_synthesizer_to_reference_powers_synthesizer_down() {
        let (soc, engine) = fixtures::engine(1);
        engine.set_rate(0, 800_000, SetRateReason::Normal).unwrap();
        soc.clear_trace();

        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();

        let ctl = soc.read_ctl(Domain::Core(0));
        assert_eq!(ctl & 0x3, select::PRI_SECONDARY);
        assert_eq!((ctl >> 2) & 0x3, select::SEC_AUX);
        assert_eq!(soc.pll_register(Domain::Core(0), PllRegister::Mode), pll_mode::OFF);
        assert_eq!(soc.voltage(RailId::new(RailKind::PllA, Domain::Core(0))), Some(0));
        assert_eq!(soc.voltage(RailId::new(RailKind::PllB, Domain::Core(0))), Some(0));
    }

    #[test]
    fn test_reference_to_synthesizer_programs_before_select() {
        let (soc, engine) = fixtures::engine(1);
        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();
        soc.clear_trace();

        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();

        let events = core_events(&soc, 0);
        let enabled = events
            .iter()
            .position(|e| matches!(e, HwEvent::PllWrite { reg: PllRegister::Mode, value: pll_mode::OUTPUT_ENABLED, .. }))
            .unwrap();
        let selected = events
            .iter()
            .position(|e| matches!(e, HwEvent::CtlWrite { value, .. } if value & 0x3 == select::PRI_SYNTH))
            .unwrap();
        assert!(enabled < selected);
        assert_eq!(soc.voltage(RailId::new(RailKind::PllA, Domain::Core(0))), Some(2_100_000));
    }

    #[test]
    fn test_reference_to_reference_only_switches_secondary() {
        let (soc, engine) = fixtures::engine(1);
        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();
        soc.clear_trace();

        engine.set_rate(0, STANDBY_KHZ, SetRateReason::Normal).unwrap();

        let events = core_events(&soc, 0);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(e, HwEvent::CtlWrite { .. })));
        assert_eq!((soc.read_ctl(Domain::Core(0)) >> 2) & 0x3, select::SEC_STANDBY);
    }

    #[test]
    fn test_idle_transition_skips_voltage_and_bandwidth() {
        let (soc, engine) = fixtures::engine(2);
        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();
        engine.set_rate(1, 200_000, SetRateReason::Normal).unwrap();
        soc.clear_trace();

        engine.set_rate(0, STANDBY_KHZ, SetRateReason::PowerCollapse).unwrap();

        assert!(!has_voltage_or_bandwidth(&soc));
        assert_eq!(engine.get_rate(0).unwrap(), STANDBY_KHZ);
        assert_eq!(engine.vote_of(0).unwrap(), DomainLevelId(0));

        engine.set_rate(0, 200_000, SetRateReason::WaitForInterrupt).unwrap();
        assert!(!has_voltage_or_bandwidth(&soc));
        assert_eq!(engine.get_rate(0).unwrap(), 200_000);
    }

    #[test]
    fn test_idle_transition_does_not_take_scaling_lock() {
        let (_soc, engine) = fixtures::engine(1);
        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();

        let _held = engine.lock_scaling();
        engine.set_rate(0, STANDBY_KHZ, SetRateReason::PowerCollapse).unwrap();
        assert_eq!(engine.get_rate(0).unwrap(), STANDBY_KHZ);
    }

    #[test]
    fn test_shared_domain_switch_follows_max_vote() {
        let (soc, engine) = fixtures::engine(2);
        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();
        engine.set_rate(1, 200_000, SetRateReason::Normal).unwrap();
        assert_eq!(soc.pll_register(Domain::Shared, PllRegister::Mode), pll_mode::OFF);

        engine.set_rate(1, 400_000, SetRateReason::Normal).unwrap();

        assert_eq!(engine.shared_level(), DomainLevelId(1));
        assert_eq!(soc.read_ctl(Domain::Shared) & 0x3, select::PRI_SYNTH);
        assert_eq!(soc.pll_register(Domain::Shared, PllRegister::LVal), 0x0F);
        assert_eq!(soc.bandwidth_level(), Some(2));
    }

    #[test]
    fn test_floor_and_boost_apply_on_next_transition() {
        let (_soc, engine) = fixtures::engine(1);
        engine.set_voltage_floor(1_000_000).unwrap();
        engine.set_rate(0, 200_000, SetRateReason::Normal).unwrap();
        assert_eq!(engine.rails_of(0).unwrap().core.current_uv, 1_000_000);

        engine.set_boost(true);
        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();
        assert_eq!(engine.rails_of(0).unwrap().core.current_uv, 1_025_000);
    }

    #[test]
    fn test_floor_range_is_enforced() {
        let (_soc, engine) = fixtures::engine(1);
        assert!(engine.set_voltage_floor(650_000).is_err());
        assert!(engine.set_voltage_floor(1_450_000).is_err());
        assert_eq!(engine.voltage_floor(), 700_000);
    }

    #[test]
    fn test_voltage_override_by_frequency() {
        let (_soc, engine) = fixtures::engine(1);
        let table = engine.voltage_table();
        assert_eq!(table.len(), 4);
        assert!(table.iter().all(|e| e.khz != STANDBY_KHZ));

        engine.set_core_voltage(400_000, 1_050_000).unwrap();
        engine.set_rate(0, 400_000, SetRateReason::Normal).unwrap();
        assert_eq!(engine.rails_of(0).unwrap().core.current_uv, 1_050_000);

        assert!(matches!(
            engine.set_core_voltage(450_000, 1_000_000),
            Err(ScalingError::InvalidFrequency(450_000))
        ));
        assert!(matches!(
            engine.set_core_voltage(STANDBY_KHZ, 1_000_000),
            Err(ScalingError::InvalidFrequency(_))
        ));
        assert!(matches!(
            engine.set_core_voltage(400_000, 2_000_000),
            Err(ScalingError::InvalidVoltage { .. })
        ));
    }

    #[test]
    fn test_bulk_overrides_are_all_or_nothing() {
        let (_soc, engine) = fixtures::engine(1);
        let before = engine.voltage_table();

        let err = engine.apply_voltage_table(&[
            VoltageEntry { khz: 200_000, uv: 850_000 },
            VoltageEntry { khz: 333_000, uv: 900_000 },
        ]);
        assert!(err.is_err());
        assert!(engine.adjust_core_voltages(1_000_000).is_err());
        assert_eq!(engine.voltage_table(), before);

        engine.adjust_core_voltages(-50_000).unwrap();
        let after = engine.voltage_table();
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(new.uv, old.uv - 50_000);
        }
    }

    #[test]
    fn test_scaling_limit_enables_overclock_rows() {
        let (_soc, engine) = fixtures::engine(1);
        assert_eq!(engine.scaling_frequencies(), vec![200_000, 400_000, 800_000]);
        assert_eq!(engine.all_frequencies(), vec![200_000, 400_000, 800_000, 1_000_000]);

        let freqs = engine.set_scaling_limit(1_000_000);
        assert_eq!(freqs, vec![200_000, 400_000, 800_000, 1_000_000]);
        assert_eq!(engine.rails_of(0).unwrap().core.max_uv, OVERCLOCK_MAX_UV);
        assert_eq!(engine.max_scaling_frequency(), Some(1_000_000));

        let freqs = engine.set_scaling_limit(800_000);
        assert_eq!(freqs, vec![200_000, 400_000, 800_000]);
    }

    #[test]
    fn test_status_reports_transitions() {
        let (_soc, engine) = fixtures::engine(2);
        engine.set_rate(1, 400_000, SetRateReason::Normal).unwrap();

        let status = engine.status();
        assert_eq!(status.cores[1].khz, 400_000);
        assert_eq!(status.cores[1].vote_khz, 400_000);
        assert_eq!(status.cores[1].transitions, 1);
        assert!(status.cores[1].last_change.is_some());
        assert_eq!(status.shared.khz, 800_000);
        assert_eq!(status.shared.bw_mbps, Some(3200));
    }

    #[test]
    fn test_concurrent_requests_keep_invariants() {
        let (_soc, engine) = fixtures::engine(4);
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..4)
            .map(|cpu| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(cpu as u64);
                    let mut last = 0;
                    for _ in 0..200 {
                        if rng.gen_bool(0.2) && last != 0 {
                            engine.set_rate(cpu, STANDBY_KHZ, SetRateReason::WaitForInterrupt).unwrap();
                            engine.set_rate(cpu, last, SetRateReason::WaitForInterrupt).unwrap();
                        } else {
                            last = FREQS[rng.gen_range(0..FREQS.len())];
                            engine.set_rate(cpu, last, SetRateReason::Normal).unwrap();
                        }
                    }
                    last
                })
            })
            .collect();

        let finals: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for (cpu, khz) in finals.into_iter().enumerate() {
            assert_eq!(engine.get_rate(cpu).unwrap(), khz);
        }
        assert_invariants(&engine);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_sequences_keep_rate_and_vote_invariants(
            requests in proptest::collection::vec((0usize..3, 0usize..FREQS.len()), 1..24)
        ) {
            let (_soc, engine) = fixtures::engine(3);
            for (cpu, idx) in requests {
                engine.set_rate(cpu, FREQS[idx], SetRateReason::Normal).unwrap();
                prop_assert_eq!(engine.get_rate(cpu).unwrap(), FREQS[idx]);
                assert_invariants(&engine);
            }
        }
    }
}
