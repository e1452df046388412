//! Hardware Driver (component A, §4.A). The `gpio` feature gates the real
//! rppal-backed driver; without it, an in-memory simulator implements the
//! identical contract so the rest of the core is portable to a development
//! machine.

use crate::error::{CoreError, CoreResult};
use crate::zone::{Polarity, ZoneId};
use std::collections::HashMap;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Contract every hardware backend implements. `set` owns polarity: "on"
/// always means "energised", regardless of whether that maps to an
/// electrically low or high output.
pub trait HardwareDriver: Send {
    fn initialise(&mut self) -> CoreResult<()>;
    fn set(&mut self, zone: ZoneId, on: bool) -> CoreResult<()>;
    fn read(&self, zone: ZoneId) -> CoreResult<bool>;
    fn release_all(&mut self) -> CoreResult<()>;
}

// ---------------------------------------------------------------------------
// Real GPIO driver (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioDriver {
    pins: HashMap<ZoneId, OutputPin>,
    polarity: HashMap<ZoneId, Polarity>,
}

#[cfg(feature = "gpio")]
impl GpioDriver {
    pub fn new(outputs: &[(ZoneId, String, Polarity)]) -> CoreResult<Self> {
        let gpio = Gpio::new().map_err(|e| CoreError::hardware(
            outputs.first().map(|o| o.0).unwrap_or(ZoneId::new(0)),
            e.into(),
        ))?;
        let mut pins = HashMap::new();
        let mut polarity = HashMap::new();

        for (zone, output_id, pol) in outputs {
            let pin_num: u8 = output_id.parse().map_err(|_| {
                CoreError::validation(format!(
                    "output identifier '{output_id}' is not a valid GPIO pin number"
                ))
            })?;
            let mut pin = gpio
                .get(pin_num)
                .map_err(|e| CoreError::hardware(*zone, e.into()))?
                .into_output();
            // Fail-safe: ensure "OFF" at startup.
            if pol.on_is_low() {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.insert(*zone, pin);
            polarity.insert(*zone, *pol);
        }

        Ok(Self { pins, polarity })
    }
}

#[cfg(feature = "gpio")]
impl HardwareDriver for GpioDriver {
    fn initialise(&mut self) -> CoreResult<()> {
        self.release_all()
    }

    fn set(&mut self, zone: ZoneId, on: bool) -> CoreResult<()> {
        let Some(pin) = self.pins.get_mut(&zone) else {
            warn!(%zone, "set requested for unconfigured zone, ignoring");
            return Ok(());
        };
        let on_is_low = self.polarity.get(&zone).copied().unwrap_or(Polarity::ActiveLow).on_is_low();
        match (on_is_low, on) {
            (true, true) => pin.set_low(),
            (true, false) => pin.set_high(),
            (false, true) => pin.set_high(),
            (false, false) => pin.set_low(),
        }
        info!(%zone, on, "hardware zone set");
        Ok(())
    }

    fn read(&self, zone: ZoneId) -> CoreResult<bool> {
        let Some(pin) = self.pins.get(&zone) else {
            return Ok(false);
        };
        let on_is_low = self.polarity.get(&zone).copied().unwrap_or(Polarity::ActiveLow).on_is_low();
        let level_high = pin.is_set_high();
        Ok(if on_is_low { !level_high } else { level_high })
    }

    fn release_all(&mut self) -> CoreResult<()> {
        let zones: Vec<ZoneId> = self.pins.keys().copied().collect();
        for z in zones {
            self.set(z, false)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory simulator (development — no hardware, logs to tracing)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct SimulatedDriver {
    zones: HashMap<ZoneId, bool>,
}

#[cfg(not(feature = "gpio"))]
impl SimulatedDriver {
    pub fn new(outputs: &[(ZoneId, u8, Polarity)]) -> CoreResult<Self> {
        let mut zones = HashMap::new();
        for (zone, pin_num, _pol) in outputs {
            info!(%zone, pin = pin_num, "simulated zone registered (no hardware attached)");
            zones.insert(*zone, false);
        }
        Ok(Self { zones })
    }
}

#[cfg(not(feature = "gpio"))]
impl HardwareDriver for SimulatedDriver {
    fn initialise(&mut self) -> CoreResult<()> {
        self.release_all()
    }

    fn set(&mut self, zone: ZoneId, on: bool) -> CoreResult<()> {
        let Some(state) = self.zones.get_mut(&zone) else {
            warn!(%zone, "set requested for unconfigured zone, ignoring");
            return Ok(());
        };
        *state = on;
        info!(%zone, on, "simulated zone set");
        Ok(())
    }

    fn read(&self, zone: ZoneId) -> CoreResult<bool> {
        Ok(self.zones.get(&zone).copied().unwrap_or(false))
    }

    fn release_all(&mut self) -> CoreResult<()> {
        let keys: Vec<ZoneId> = self.zones.keys().copied().collect();
        for k in keys {
            self.set(k, false)?;
        }
        Ok(())
    }
}

#[cfg(not(feature = "gpio"))]
pub type DefaultDriver = SimulatedDriver;

#[cfg(feature = "gpio")]
pub type DefaultDriver = GpioDriver;
