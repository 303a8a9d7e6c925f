//! Frequency plan tables
//!
//! A plan holds two ordered tables: the shared cache-domain levels and the
//! per-core rows that reference them. Rows are addressed by typed indices
//! so that "the current speed" of a domain is always a row of the active
//! plan and never a copy.

use crate::error::{Result, ScalingError};
use serde::{Deserialize, Serialize};

/// Frequency of the standby parking row (kHz)
pub const STANDBY_KHZ: u32 = 1;

/// Clock source feeding a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Always-on low-speed reference
    Standby,
    /// Always-on mid-speed reference
    Aux,
    /// Programmable synthesizer (PLL)
    Synthesizer,
}

impl ClockSource {
    pub fn is_synthesizer(self) -> bool {
        self == Self::Synthesizer
    }
}

/// One clock configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speed {
    pub khz: u32,
    pub source: ClockSource,
    /// Primary mux select
    #[serde(default)]
    pub pri_sel: u32,
    /// Secondary mux select
    #[serde(default)]
    pub sec_sel: u32,
    /// Synthesizer multiplier
    #[serde(default)]
    pub pll_l: u32,
}

/// Shared cache-domain level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLevel {
    pub speed: Speed,
    pub vdd_dig_uv: u32,
    pub vdd_mem_uv: u32,
    pub bw_level: usize,
}

/// Per-core table row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreLevel {
    /// Exposed to the policy layer
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub speed: Speed,
    /// Index into the domain level table
    pub domain_level: usize,
    pub vdd_core_uv: u32,
}

fn default_true() -> bool {
    true
}

/// Index of a core row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreLevelId(pub usize);

/// Index of a shared-domain level; ordering is table rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainLevelId(pub usize);

/// A validated frequency plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPlan", into = "RawPlan")]
pub struct FrequencyPlan {
    name: String,
    domain_levels: Vec<DomainLevel>,
    core_levels: Vec<CoreLevel>,
}

/// Unvalidated plan as it appears in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPlan {
    name: String,
    domain_levels: Vec<DomainLevel>,
    core_levels: Vec<CoreLevel>,
}

impl TryFrom<RawPlan> for FrequencyPlan {
    type Error = ScalingError;

    fn try_from(raw: RawPlan) -> Result<Self> {
        FrequencyPlan::new(raw.name, raw.domain_levels, raw.core_levels)
    }
}

impl From<FrequencyPlan> for RawPlan {
    fn from(plan: FrequencyPlan) -> Self {
        Self {
            name: plan.name,
            domain_levels: plan.domain_levels,
            core_levels: plan.core_levels,
        }
    }
}

impl FrequencyPlan {
    /// Build and validate a plan. A zero-frequency core row terminates the
    /// table; anything after it is dropped.
    pub fn new(
        name: impl Into<String>,
        domain_levels: Vec<DomainLevel>,
        mut core_levels: Vec<CoreLevel>,
    ) -> Result<Self> {
        if let Some(end) = core_levels.iter().position(|l| l.speed.khz == 0) {
            core_levels.truncate(end);
        }

        if domain_levels.is_empty() {
            return Err(ScalingError::InvalidPlan("no domain levels".into()));
        }
        if core_levels.is_empty() {
            return Err(ScalingError::InvalidPlan("no core levels".into()));
        }

        for pair in domain_levels.windows(2) {
            if pair[1].speed.khz <= pair[0].speed.khz {
                return Err(ScalingError::InvalidPlan(format!(
                    "domain levels not ascending at {} kHz",
                    pair[1].speed.khz
                )));
            }
        }
        for pair in core_levels.windows(2) {
            if pair[1].speed.khz <= pair[0].speed.khz {
                return Err(ScalingError::InvalidPlan(format!(
                    "core levels not ascending at {} kHz",
                    pair[1].speed.khz
                )));
            }
        }
        if domain_levels[0].speed.khz == 0 {
            return Err(ScalingError::InvalidPlan("zero-frequency domain level".into()));
        }
        for level in &core_levels {
            if level.domain_level >= domain_levels.len() {
                return Err(ScalingError::InvalidPlan(format!(
                    "{} kHz votes for missing domain level {}",
                    level.speed.khz, level.domain_level
                )));
            }
        }

        Ok(Self {
            name: name.into(),
            domain_levels,
            core_levels,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain_levels(&self) -> &[DomainLevel] {
        &self.domain_levels
    }

    pub fn core_levels(&self) -> &[CoreLevel] {
        &self.core_levels
    }

    pub fn core_level(&self, id: CoreLevelId) -> &CoreLevel {
        &self.core_levels[id.0]
    }

    pub fn domain_level(&self, id: DomainLevelId) -> &DomainLevel {
        &self.domain_levels[id.0]
    }

    /// Domain level a core row votes for
    pub fn vote_of(&self, id: CoreLevelId) -> DomainLevelId {
        DomainLevelId(self.core_levels[id.0].domain_level)
    }

    /// Exact-match lookup; no interpolation
    pub fn find_core_level(&self, khz: u32) -> Option<CoreLevelId> {
        self.core_levels
            .iter()
            .position(|l| l.speed.khz == khz)
            .map(CoreLevelId)
    }

    /// Highest row enabled for scaling
    pub fn max_scaling_level(&self) -> Option<CoreLevelId> {
        self.core_levels
            .iter()
            .rposition(|l| l.enabled)
            .map(CoreLevelId)
    }
}
