//! Configuration for Cadence scaling daemon

use crate::engine::{PlatformConfig, ScalingEngine, VoltageEntry};
use crate::provider::{self, ChipId, ChipIdentity, FuseBits};
use crate::table::FrequencyPlan;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Chip identification and plan selection
    #[serde(default)]
    pub chip: ChipConfig,

    /// Runtime adjustments applied at start
    #[serde(default)]
    pub tuning: TuningConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Chip identification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipConfig {
    #[serde(default = "default_chip")]
    pub chip: ChipId,

    /// Speed-bin fuse row 0 (upper word)
    #[serde(default)]
    pub fuse_row0: u32,

    /// Speed-bin fuse row 1 (lower word)
    #[serde(default)]
    pub fuse_row1: u32,

    /// Main ID register value
    #[serde(default)]
    pub cpuid: u32,

    /// YAML plan replacing the built-in selection
    #[serde(default)]
    pub plan_file: Option<String>,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            chip: default_chip(),
            fuse_row0: 0,
            fuse_row1: 0,
            cpuid: 0,
            plan_file: None,
        }
    }
}

impl ChipConfig {
    pub fn identity(&self) -> ChipIdentity {
        ChipIdentity {
            chip: self.chip,
            fuses: FuseBits {
                row0: self.fuse_row0,
                row1: self.fuse_row1,
            },
            cpuid: self.cpuid,
        }
    }
}

/// Tuning applied once the engine is up
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Core-rail floor override (uV)
    #[serde(default)]
    pub floor_uv: Option<u32>,

    /// Add a fixed margin to every core voltage
    #[serde(default)]
    pub boost: bool,

    /// Enable rows above the boot maximum up to this frequency (kHz)
    #[serde(default)]
    pub scaling_limit_khz: Option<u32>,

    /// Per-frequency core voltage overrides
    #[serde(default)]
    pub voltages: Vec<VoltageEntry>,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_chip() -> ChipId {
    ChipId::Msm8960
}

fn default_socket_path() -> String {
    "/run/cadence/cadence.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CadenceConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Reading config {}", path.display()))?;
            let config: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Parsing config {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Platform description from the custom plan file or the chip's fuses
    pub fn platform(&self) -> Result<PlatformConfig> {
        match &self.chip.plan_file {
            Some(path) => {
                let plan = load_plan(Path::new(path))?;
                info!("Using custom plan {} from {}", plan.name(), path);
                Ok(provider::msm8960_platform(plan, self.chip.cpuid))
            }
            None => Ok(provider::platform_for(&self.chip.identity())?),
        }
    }

    /// Apply the tuning section to a running engine
    pub fn apply_tuning(&self, engine: &ScalingEngine) -> Result<()> {
        let tuning = &self.tuning;

        if let Some(uv) = tuning.floor_uv {
            engine.set_voltage_floor(uv)?;
        }
        if tuning.boost {
            engine.set_boost(true);
        }
        if let Some(khz) = tuning.scaling_limit_khz {
            engine.set_scaling_limit(khz);
        }
        if !tuning.voltages.is_empty() {
            engine
                .apply_voltage_table(&tuning.voltages)
                .context("Applying configured voltage table")?;
        }
        Ok(())
    }
}

/// Load and validate a YAML frequency plan
pub fn load_plan(path: &Path) -> Result<FrequencyPlan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Reading plan {}", path.display()))?;
    let plan = serde_yaml::from_str(&content)
        .with_context(|| format!("Parsing plan {}", path.display()))?;
    Ok(plan)
}
