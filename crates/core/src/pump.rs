//! Pump Coupling (component B, §4.B). Wraps a [`HardwareDriver`] and
//! transparently energises/de-energises a designated pump zone in step
//! with the zones it serves.

use crate::error::CoreResult;
use crate::hardware::HardwareDriver;
use crate::zone::ZoneId;
use std::collections::HashSet;
use tracing::info;

/// Decorates a [`HardwareDriver`] with the pump rules of §4.B. The set of
/// currently-energised non-pump zones is tracked independently of the
/// underlying driver so the "any others still on?" inspection in
/// [`PumpCoupledDriver::set`] does not depend on driver readback timing —
/// mirrors `original_source/core/gpio.py`'s `_active_zones` bookkeeping.
pub struct PumpCoupledDriver {
    inner: Box<dyn HardwareDriver>,
    pump: Option<ZoneId>,
    active_non_pump: HashSet<ZoneId>,
}

impl PumpCoupledDriver {
    pub fn new(inner: Box<dyn HardwareDriver>, pump: Option<ZoneId>) -> Self {
        Self {
            inner,
            pump,
            active_non_pump: HashSet::new(),
        }
    }

    pub fn pump_zone(&self) -> Option<ZoneId> {
        self.pump
    }
}

impl HardwareDriver for PumpCoupledDriver {
    fn initialise(&mut self) -> CoreResult<()> {
        self.inner.initialise()
    }

    fn set(&mut self, zone: ZoneId, on: bool) -> CoreResult<()> {
        let is_pump_zone = self.pump == Some(zone);

        if is_pump_zone {
            // Direct pump control is permitted but bypasses coupling
            // bookkeeping entirely.
            return self.inner.set(zone, on);
        }

        self.inner.set(zone, on)?;

        if on {
            self.active_non_pump.insert(zone);
        } else {
            // Remove from the active set *before* inspecting whether any
            // other non-pump zone remains active — order matters here.
            self.active_non_pump.remove(&zone);
        }

        if let Some(pump) = self.pump {
            if on {
                self.inner.set(pump, true)?;
                info!(%zone, %pump, "pump energised (non-pump zone on)");
            } else if self.active_non_pump.is_empty() {
                self.inner.set(pump, false)?;
                info!(%zone, %pump, "pump de-energised (no other zones active)");
            } else {
                info!(%zone, %pump, others = self.active_non_pump.len(), "pump kept on, other zones still active");
            }
        }

        Ok(())
    }

    fn read(&self, zone: ZoneId) -> CoreResult<bool> {
        self.inner.read(zone)
    }

    fn release_all(&mut self) -> CoreResult<()> {
        self.active_non_pump.clear();
        self.inner.release_all()
    }
}
