//! Converts a sensor ADC reading into a calibrated temperature.
//!
//! Two sensing strategies are supported: an RTD (PT100) divider read
//! through a Q16 affine calibration, and a TCR (temperature coefficient of
//! resistance) heater-wire sensor. Calibration degrades gracefully: a
//! degenerate two-point fit (identical points) falls back to a one-point
//! fit, which falls back to the identity default.

use crate::pt100;

/// Divider reference voltage, scaled into the same units as `mv` (2.5V).
const DIVIDER_REF_MV: i64 = 2500;
/// Divider series resistor, ohms.
const DIVIDER_SERIES_OHM: i64 = 560;

/// Default TCR base resistance, milliohms.
const TCR_R_DEFAULT_MOHM: i64 = 4_000;
/// Default copper TCR per degC; divided by 10 because temperatures are
/// carried as degC x10.
const COPPER_TCR_PER_C: f64 = 0.00393;
/// Q16 inverse gain for the default base resistance and copper TCR:
/// 1 / (R_base * tcr/10) in x10-degC per milliohm.
const COPPER_TCR_INV_GAIN_Q16: i64 =
    (1.0 / (TCR_R_DEFAULT_MOHM as f64 * (COPPER_TCR_PER_C / 10.0)) * 65536.0) as i64;

fn raw_resistance_mohm(mv: i32) -> i64 {
    let mv = mv as i64;
    let denom = DIVIDER_REF_MV - mv;
    if denom <= 0 {
        return i64::MAX / 2; // open circuit: treat as very high resistance
    }
    // R_raw(ohm) = 560 * mV / (2500 - mV); scale to milliohm.
    (DIVIDER_SERIES_OHM * mv * 1000) / denom
}

#[derive(Debug, Clone, Copy)]
pub struct RtdCalibration {
    pub gain_q16: i64,
    pub offset_mohm: i64,
}

impl Default for RtdCalibration {
    fn default() -> Self {
        RtdCalibration { gain_q16: 1 << 16, offset_mohm: 0 }
    }
}

impl RtdCalibration {
    pub fn zero_point() -> Self {
        Self::default()
    }

    pub fn one_point(measured_mv: i32, expected_t10: i32) -> Self {
        let raw = raw_resistance_mohm(measured_mv);
        let expected_r = pt100::t2r_x10(expected_t10) as i64;
        RtdCalibration { gain_q16: 1 << 16, offset_mohm: expected_r - raw }
    }

    pub fn two_point(pts: [(i32, i32); 2]) -> Self {
        let raw0 = raw_resistance_mohm(pts[0].0);
        let raw1 = raw_resistance_mohm(pts[1].0);
        let exp0 = pt100::t2r_x10(pts[0].1) as i64;
        let exp1 = pt100::t2r_x10(pts[1].1) as i64;
        if raw1 == raw0 {
            // degenerate: fall back to the weaker one-point fit.
            return Self::one_point(pts[0].0, pts[0].1);
        }
        let gain_q16 = ((exp1 - exp0) << 16) / (raw1 - raw0);
        let offset_mohm = exp0 - ((gain_q16 * raw0) >> 16);
        RtdCalibration { gain_q16, offset_mohm }
    }

    fn apply(&self, raw_mohm: i64) -> i64 {
        ((self.gain_q16 * raw_mohm) >> 16) + self.offset_mohm
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TcrCalibration {
    pub r_base_mohm: i64,
    pub t_ref_x10: i32,
    pub inv_gain_q16: i64,
}

impl Default for TcrCalibration {
    fn default() -> Self {
        TcrCalibration {
            r_base_mohm: TCR_R_DEFAULT_MOHM,
            t_ref_x10: 250,
            inv_gain_q16: COPPER_TCR_INV_GAIN_Q16,
        }
    }
}

impl TcrCalibration {
    /// Anchors the copper TCR curve at a measured (R, T) point: the gain
    /// scales with the base resistance, so it is rederived here rather
    /// than reusing the default-resistance constant.
    pub fn one_point(r_base_mohm: i64, t_ref_x10: i32) -> Self {
        let inv_gain_q16 = if r_base_mohm > 0 {
            (1.0 / (r_base_mohm as f64 * (COPPER_TCR_PER_C / 10.0)) * 65536.0) as i64
        } else {
            COPPER_TCR_INV_GAIN_Q16
        };
        TcrCalibration { r_base_mohm, t_ref_x10, inv_gain_q16 }
    }

    pub fn two_point(pts: [(i64, i32); 2]) -> Self {
        let (r0, t0) = pts[0];
        let (r1, t1) = pts[1];
        if r1 == r0 {
            return Self::one_point(r0, t0);
        }
        // T = T_ref + (R - R_base) * inv_gain >> 16  =>  inv_gain = (t1-t0)<<16 / (r1-r0)
        let inv_gain_q16 = (((t1 - t0) as i64) << 16) / (r1 - r0);
        TcrCalibration { r_base_mohm: r0, t_ref_x10: t0, inv_gain_q16 }
    }

    fn apply(&self, r_mohm: i64) -> i32 {
        self.t_ref_x10 + (((r_mohm - self.r_base_mohm) * self.inv_gain_q16) >> 16) as i32
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SensorCalibration {
    Rtd(RtdCalibration),
    Tcr(TcrCalibration),
}

pub struct TemperatureProcessor {
    calibration: SensorCalibration,
}

impl TemperatureProcessor {
    pub fn new(calibration: SensorCalibration) -> Self {
        TemperatureProcessor { calibration }
    }

    /// Builds a processor from the head's stored sensor parameters.
    /// Unset TCR fields (all zero) fall back to the copper default.
    pub fn from_sensor_params(p: &crate::head_fsm::SensorParams) -> Self {
        let calibration = if p.kind == crate::head_fsm::SENSOR_KIND_TCR {
            let mut cal = TcrCalibration::default();
            if p.inv_gain_q16 != 0 {
                cal = TcrCalibration {
                    r_base_mohm: p.r_base as i64,
                    t_ref_x10: p.t_ref_x10,
                    inv_gain_q16: p.inv_gain_q16 as i64,
                };
            } else if p.r_base != 0 {
                cal = TcrCalibration::one_point(p.r_base as i64, p.t_ref_x10);
            }
            SensorCalibration::Tcr(cal)
        } else {
            SensorCalibration::Rtd(RtdCalibration {
                gain_q16: p.gain_q16 as i64,
                offset_mohm: p.offset as i64,
            })
        };
        TemperatureProcessor { calibration }
    }

    pub fn set_calibration(&mut self, calibration: SensorCalibration) {
        self.calibration = calibration;
    }

    /// Converts a millivolt ADC reading to temperature x10 (degC).
    pub fn temperature_x10(&self, mv: i32) -> i32 {
        match &self.calibration {
            SensorCalibration::Rtd(cal) => {
                let raw = raw_resistance_mohm(mv);
                let r = cal.apply(raw);
                pt100::r2t_x10(r.clamp(0, u32::MAX as i64) as u32)
            }
            SensorCalibration::Tcr(cal) => {
                let r = raw_resistance_mohm(mv);
                cal.apply(r)
            }
        }
    }
}
