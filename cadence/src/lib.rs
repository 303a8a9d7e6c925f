//! Cadence - Multi-domain CPU Frequency and Voltage Scaling
//!
//! Moves each core to a requested frequency while keeping the shared cache
//! domain at the maximum of all cores' votes, with:
//! - Ordered voltage sequencing (never under-volted, even mid-transition)
//! - Clock mux and synthesizer programming per domain
//! - Hot-plug aware transitions issued on behalf of offline cores
//! - Speed-bin based plan selection

pub mod bandwidth;
pub mod config;
pub mod engine;
pub mod error;
pub mod hotplug;
pub mod ipc;
pub mod mux;
pub mod provider;
pub mod rail;
pub mod sim;
pub mod table;
pub mod voltage;
pub mod vote;

#[cfg(test)]
pub(crate) mod fixtures;

pub use engine::{ScalingEngine, SetRateReason};
pub use error::{Result, ScalingError};
