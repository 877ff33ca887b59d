//! Named tunables shared across components.
//!
//! Collects the constants the firmware would otherwise scatter through
//! headers so every component references one source of truth instead of
//! repeating magic numbers, and so tests can reason about exact values
//! from one place.

/// PWM period, in 1ms ticks.
pub const PWM_PERIOD_TICKS: u32 = 200;
/// Minimum pulse width, in ticks. Must leave room for ADC stabilization.
pub const PWM_MIN_PULSE_TICKS: u32 = 7;
/// Ticks into a Pulse before the ADC reading is considered settled.
pub const POWER_STABILIZATION_TICKS: u32 = 5;
/// Gap stretch following the minimum-width pulse at duty == 0, letting
/// the drain tracker baseline between brief sample windows.
pub const PWM_IDLE_TICKS: u32 = 500;
/// duty_error clamp bounds (milli-duty-units).
pub const PWM_DUTY_ERROR_MIN: i32 = -500;
pub const PWM_DUTY_ERROR_MAX: i32 = 499;

/// INA226 averaging ring size.
pub const ADC_FILTER_SIZE: usize = 8;
/// Minimum milliamps to consider a PWM pulse's measurement valid.
pub const DRAIN_LOAD_VALID_MIN_MA: i32 = 300;
/// Minimum millivolts to consider a PWM pulse's measurement valid.
pub const DRAIN_LOAD_VALID_MIN_MV: i32 = 4000;

/// HeadFsm tick period, ms.
pub const HEAD_FSM_TICK_MS: u32 = 20;
/// Sensor divider voltage above which the head is considered floating/absent.
pub const HEAD_FLOATING_MV: i32 = 800;
/// Sensor divider voltage below which the head reads as shorted (MCH type).
pub const HEAD_SHORTED_MV: i32 = 150;
/// Debounce time before Initializing -> Attached, ms.
pub const HEAD_ATTACH_DEBOUNCE_MS: u32 = 100;
/// Time a clean sensor reading must hold before Error -> Detached, ms.
pub const HEAD_ERROR_RECOVERY_MS: u32 = 1000;

/// HeaterCore tick period, ms.
pub const HEATER_CORE_TICK_MS: u32 = 50;
/// PowerFsm SysTick period, ms.
pub const POWER_FSM_SYS_TICK_MS: u32 = 50;
/// AsyncPreference writer period, ms.
pub const PREFERENCE_WRITER_PERIOD_MS: u32 = 200;
/// Bonding window duration, ms.
pub const BONDING_WINDOW_MS: u32 = 15_000;

/// Command FIFO capacity.
pub const COMMAND_FIFO_CAPACITY: usize = 16;

/// SparseHistory delta parameters shared by every task kind.
pub const HISTORY_X_THRESHOLD: u32 = 2;
pub const HISTORY_Y_MULTIPLIER: i32 = 100;
pub const HISTORY_X_SCALE_AFTER: u32 = 400;
/// Points returned per history chunk read.
pub const HISTORY_CHUNK_SIZE: usize = 100;

/// History task ids for the built-in activities; reflow tasks use the
/// profile id instead. Values are part of the wire contract.
pub const HISTORY_ID_SENSOR_BAKE_MODE: i32 = 4000;
pub const HISTORY_ID_ADRC_TEST_MODE: i32 = 4001;
pub const HISTORY_ID_STEP_RESPONSE: i32 = 4002;

/// Reflow starting temperature, degrees C.
pub const START_TEMPERATURE_C: i32 = 25;
/// Maximum slope magnitude a Timeline segment may report, degC/s.
pub const TIMELINE_MAX_SLOPE_C_PER_S: f32 = 100.0;

/// Temperature jump between consecutive SensorBake samples treated as
/// abnormal jitter (logged, never aborts), degC.
pub const SENSOR_BAKE_JITTER_C: f32 = 5.0;

/// StepResponse gives up waiting for the plant to settle after this long.
pub const STEP_RESPONSE_MAX_LOG_S: usize = 1000;
/// The plant counts as settled once the temperature has stayed within
/// this band over `STEP_RESPONSE_STABLE_WINDOW_S` consecutive samples.
pub const STEP_RESPONSE_STABLE_BAND_C: f32 = 1.0;
pub const STEP_RESPONSE_STABLE_WINDOW_S: usize = 10;

/// PDO selection thresholds: upgrade when the target exceeds 95% of the
/// current PDO's capability, require 10% headroom on the candidate, and
/// allow 3% slack on the APDO minimum-voltage guard.
pub const PROFILE_UPGRADE_TRIGGER_RATIO: f32 = 0.95;
pub const PROFILE_HEADROOM_RATIO: f32 = 0.90;
pub const PROFILE_APDO_GUARD_RATIO: f32 = 1.03;

/// PD 3.2 forbids advertising below 5V; values below are clamped up.
pub const PDO_MIN_MV: u32 = 5000;

/// Minimum millivolt difference before a new APDO voltage request
/// re-enters PwrTransition (one PPS voltage step).
pub const APDO_VOLTAGE_DEADBAND_MV: u32 = 20;

/// EEPROM page size in bytes; writes are chunked to this boundary.
pub const EEPROM_PAGE_SIZE: usize = 8;
/// Delay observed between successive EEPROM page writes, ms.
pub const EEPROM_PAGE_WRITE_DELAY_MS: u32 = 10;
/// Expected header magic, little-endian on the wire.
pub const EEPROM_MAGIC: u16 = 0x42DA;
/// Maximum payload size a 256-byte EEPROM can hold after the 8-byte header.
pub const EEPROM_MAX_PAYLOAD: usize = 248;

/// BLE chunk payload size, bytes, excluding the 4-byte chunk header.
pub const BLE_CHUNK_PAYLOAD_SIZE: usize = 244;

/// Maximum number of stored reflow profiles.
pub const PROFILES_MAX_COUNT: usize = 10;
/// Maximum segments per profile.
pub const PROFILE_MAX_SEGMENTS: usize = 10;
/// Maximum profile name length, bytes.
pub const PROFILE_NAME_MAX_LEN: usize = 50;
