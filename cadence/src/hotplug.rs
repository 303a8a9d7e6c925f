//! Core hot-plug coordination
//!
//! A core going down parks its own mux, then a survivor moves its table
//! state to the parking row. Coming up runs the same steps in reverse. The
//! survivor can reach neither the downed core's mux nor its core rail, so
//! those calls go through the engine with [`SetRateReason::Hotplug`].

use crate::engine::{ScalingEngine, SetRateReason};
use crate::error::{Result, ScalingError};
use crate::mux::MuxSelects;
use crate::table::STANDBY_KHZ;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Lifecycle notification for one core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotplugEvent {
    /// Delivered on the dying core itself
    Dying,
    /// Delivered on a survivor once the core has stopped
    Dead,
    /// Bring-up was aborted; delivered on a survivor
    UpCanceled,
    /// Delivered on a survivor before the core starts executing
    UpPrepare,
    /// Delivered on the new core once it executes
    Starting,
}

/// Per-core lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreLifecycle {
    Online,
    GoingOffline,
    Offline,
    ComingOnline,
}

impl CoreLifecycle {
    /// State after `event`, or `None` when the event is out of order
    fn next(self, event: HotplugEvent) -> Option<Self> {
        use CoreLifecycle::*;
        use HotplugEvent::*;

        match (self, event) {
            (Online, Dying) => Some(GoingOffline),
            (GoingOffline, Dead) => Some(Offline),
            (Offline, UpPrepare) => Some(ComingOnline),
            // Cancellation can follow a failed or a completed prepare.
            (Offline | ComingOnline, UpCanceled) => Some(Offline),
            (ComingOnline, Starting) => Some(Online),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct CoreRecord {
    state: CoreLifecycle,
    saved_selects: Option<MuxSelects>,
    restore_khz: Option<u32>,
}

/// Drives each core's lifecycle against the scaling engine
pub struct HotplugCoordinator {
    engine: Arc<ScalingEngine>,
    cores: Vec<Mutex<CoreRecord>>,
}

impl HotplugCoordinator {
    /// Every core starts online
    pub fn new(engine: Arc<ScalingEngine>) -> Self {
        let cores = (0..engine.num_cores())
            .map(|_| {
                Mutex::new(CoreRecord {
                    state: CoreLifecycle::Online,
                    saved_selects: None,
                    restore_khz: None,
                })
            })
            .collect();
        Self { engine, cores }
    }

    pub fn engine(&self) -> &Arc<ScalingEngine> {
        &self.engine
    }

    pub fn state(&self, core: usize) -> Result<CoreLifecycle> {
        Ok(self.record(core)?.state)
    }

    pub fn states(&self) -> Vec<CoreLifecycle> {
        (0..self.cores.len())
            .filter_map(|core| self.state(core).ok())
            .collect()
    }

    /// Handle one lifecycle event for `core`. Out-of-order events are
    /// rejected without side effects; on a failed transition the state is
    /// left where it was.
    pub fn handle(&self, core: usize, event: HotplugEvent) -> Result<CoreLifecycle> {
        let mut record = self.record(core)?;

        let next = record
            .state
            .next(event)
            .ok_or(ScalingError::InvalidHotplugEvent {
                core,
                event,
                state: record.state,
            })?;

        match event {
            HotplugEvent::Dying => {
                // The shared cache domain may only power down with every
                // core on the standby reference.
                record.saved_selects = Some(self.engine.park_core_mux(core)?);
            }
            HotplugEvent::Dead => {
                let khz = self.engine.get_rate(core)?;
                self.engine.set_rate(core, STANDBY_KHZ, SetRateReason::Hotplug)?;
                record.restore_khz = Some(khz);
            }
            HotplugEvent::UpCanceled => {
                self.engine.set_rate(core, STANDBY_KHZ, SetRateReason::Hotplug)?;
            }
            HotplugEvent::UpPrepare => {
                let khz = record.restore_khz.ok_or(ScalingError::InvalidHotplugEvent {
                    core,
                    event,
                    state: record.state,
                })?;
                self.engine.set_rate(core, khz, SetRateReason::Hotplug)?;
            }
            HotplugEvent::Starting => match record.saved_selects.take() {
                Some(selects) => self.engine.restore_core_mux(core, selects)?,
                None => warn!("cpu{} starting without saved mux state", core),
            },
        }

        info!("cpu{}: {:?} -> {:?}", core, record.state, next);
        record.state = next;
        Ok(next)
    }

    /// Ordinary rate request. Only online cores accept one; the record
    /// stays locked so no lifecycle event can interleave.
    pub fn request_rate(&self, core: usize, khz: u32) -> Result<()> {
        let record = self.record(core)?;
        if record.state != CoreLifecycle::Online {
            return Err(ScalingError::CoreOffline {
                core,
                state: record.state,
            });
        }
        self.engine.set_rate(core, khz, SetRateReason::Normal)
    }

    fn record(&self, core: usize) -> Result<MutexGuard<'_, CoreRecord>> {
        let record = self.cores.get(core).ok_or(ScalingError::InvalidCore(core))?;
        Ok(record.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
