//! INA226-backed drain measurement.
//!
//! The register-level INA226 access sits behind a small trait so the
//! averaging and load-validity logic here is testable without real I2C
//! hardware. Samples accumulate during a PWM pulse's settled window and
//! are averaged into one measurement when the pulse completes.

use std::sync::Mutex;

use crate::config::{ADC_FILTER_SIZE, DRAIN_LOAD_VALID_MIN_MA, DRAIN_LOAD_VALID_MIN_MV};
use crate::error::{Error, Result};

const MANUFACTURER_ID: u16 = 0x5449;
const DIE_ID_MASK: u16 = 0xFFF0;
const DIE_ID_EXPECTED: u16 = 0x2260;
const CONFIG_VALUE: u16 = 0x0207;
const CALIBRATION_VALUE: u16 = 0x0200;

/// Register-level INA226 access, backed by the I2C HAL shared with the
/// EEPROM.
pub trait Ina226Registers: Send + Sync {
    fn read_register(&self, reg: u8) -> Result<u16>;
    fn write_register(&self, reg: u8, value: u16) -> Result<()>;
}

const REG_CONFIG: u8 = 0x00;
const REG_VBUS: u8 = 0x02;
const REG_CURRENT: u8 = 0x04;
const REG_CALIBRATION: u8 = 0x05;
const REG_MANUFACTURER_ID: u8 = 0xFE;
const REG_DIE_ID: u8 = 0xFF;

/// Initializes the INA226 and verifies its identity registers.
pub fn init(dev: &dyn Ina226Registers) -> Result<()> {
    let manufacturer = dev.read_register(REG_MANUFACTURER_ID)?;
    if manufacturer != MANUFACTURER_ID {
        return Err(Error::SensorIo(format!("unexpected INA226 manufacturer id {manufacturer:#06x}")));
    }
    let die = dev.read_register(REG_DIE_ID)?;
    if die & DIE_ID_MASK != DIE_ID_EXPECTED {
        return Err(Error::SensorIo(format!("unexpected INA226 die id {die:#06x}")));
    }
    dev.write_register(REG_CONFIG, CONFIG_VALUE)?;
    dev.write_register(REG_CALIBRATION, CALIBRATION_VALUE)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    vbus_raw: i32,
    current_raw: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainMeasurement {
    pub peak_mv: i32,
    pub peak_ma: i32,
    pub load_valid: bool,
}

struct State {
    ring: [Sample; ADC_FILTER_SIZE],
    count: usize,
}

pub struct DrainTracker {
    state: Mutex<State>,
    latest: Mutex<DrainMeasurement>,
    bus_errors: std::sync::atomic::AtomicU32,
}

impl DrainTracker {
    pub fn new() -> Self {
        DrainTracker {
            state: Mutex::new(State { ring: [Sample::default(); ADC_FILTER_SIZE], count: 0 }),
            latest: Mutex::new(DrainMeasurement::default()),
            bus_errors: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Reads one sample from the device into the averaging ring. Called
    /// once per tick during a PWM pulse's ADC window. A transient bus
    /// failure only bumps the error counter; the next tick retries.
    pub fn collect_data(&self, dev: &dyn Ina226Registers) -> Result<()> {
        let (vbus_raw, current_raw) = match self.read_sample(dev) {
            Ok(sample) => sample,
            Err(e) => {
                self.bus_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(e);
            }
        };
        let mut state = self.state.lock().unwrap();
        let idx = state.count % ADC_FILTER_SIZE;
        state.ring[idx] = Sample { vbus_raw, current_raw };
        state.count += 1;
        Ok(())
    }

    fn read_sample(&self, dev: &dyn Ina226Registers) -> Result<(i32, i32)> {
        // Vbus is an unsigned register; only the current register carries
        // a sign (reverse flow reads negative).
        let vbus_raw = dev.read_register(REG_VBUS)? as i32;
        let current_raw = dev.read_register(REG_CURRENT)? as i16 as i32;
        Ok((vbus_raw, current_raw))
    }

    /// Cumulative count of failed sample reads since boot.
    pub fn bus_error_count(&self) -> u32 {
        self.bus_errors.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Averages the ring into a `DrainMeasurement` and resets it for the
    /// next pulse.
    pub fn process_collected_data(&self) -> DrainMeasurement {
        let mut state = self.state.lock().unwrap();
        let n = state.count.min(ADC_FILTER_SIZE).max(1) as i64;
        let (sum_v, sum_i): (i64, i64) = state.ring[..state.count.min(ADC_FILTER_SIZE)]
            .iter()
            .fold((0i64, 0i64), |(sv, si), s| (sv + s.vbus_raw as i64, si + s.current_raw as i64));
        let v_avg = sum_v / n;
        let i_avg = sum_i / n;

        // Vbus LSB is 1.25mV; round-half-up when scaling by 5/4.
        let peak_mv = ((v_avg * 5) + 2) / 4;
        let peak_ma = i_avg.max(0);

        let measurement = DrainMeasurement {
            peak_mv: peak_mv as i32,
            peak_ma: peak_ma as i32,
            load_valid: peak_ma as i32 >= DRAIN_LOAD_VALID_MIN_MA && peak_mv as i32 >= DRAIN_LOAD_VALID_MIN_MV,
        };

        state.count = 0;
        drop(state);
        *self.latest.lock().unwrap() = measurement;
        measurement
    }

    pub fn latest(&self) -> DrainMeasurement {
        *self.latest.lock().unwrap()
    }

    /// Computes the live load resistance in milliohms from the latest
    /// valid measurement, or `None` if the last measurement wasn't valid.
    pub fn load_mohms(&self) -> Option<u32> {
        let m = self.latest();
        if !m.load_valid || m.peak_ma == 0 {
            return None;
        }
        Some(((m.peak_mv as i64 * 1000) / m.peak_ma as i64) as u32)
    }
}

impl Default for DrainTracker {
    fn default() -> Self {
        Self::new()
    }
}
