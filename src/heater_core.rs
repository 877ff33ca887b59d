//! The 50ms control loop tying the ADRC, history recording, and the
//! user-task lifecycle together.
//!
//! `HeaterCore` owns the controller, the history recorder, and the live
//! setpoints. It is driven externally once per tick by the activity state
//! machine, which feeds in fresh measurements beforehand and forwards the
//! computed power setpoint afterwards. All mutation happens under the
//! activity dispatch mutex, so fields here are plain values.

use crate::adrc::{Adrc, AdrcParams};
use crate::config::{HISTORY_X_SCALE_AFTER, HISTORY_X_THRESHOLD, HISTORY_Y_MULTIPLIER};
use crate::head_fsm::HeadStatus;
use crate::power_fsm::PowerStatus;
use crate::sparse_history::{HistoryParams, SparseHistory};

/// Device health derived from the power and head statuses. A running task
/// is stopped the moment this degrades from `DevOk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    DevOk,
    DevNotReady,
    DevFailure,
}

/// A power transition (PDO renegotiation in flight) still counts as
/// healthy; control merely pauses until the handshake settles.
pub fn derive_health(power: PowerStatus, head: HeadStatus) -> Health {
    if matches!(power, PowerStatus::PwrOK | PowerStatus::PwrTransition) && head == HeadStatus::Attached {
        return Health::DevOk;
    }
    if power == PowerStatus::PwrFailure || head == HeadStatus::Error {
        return Health::DevFailure;
    }
    Health::DevNotReady
}

/// Measurements the tick driver feeds in before each `tick`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Measurements {
    pub temperature_c: f32,
    /// What the selected PDO can deliver into the present load.
    pub max_power_w: f32,
    /// Actually delivered power (volts x amperes x duty).
    pub measured_power_w: f32,
}

pub struct HeaterCore {
    adrc: Adrc,
    params: AdrcParams,
    history: SparseHistory,
    control_enabled: bool,
    task_active: bool,
    task_time_ms: i32,
    history_last_recorded_s: u32,
    measurements: Measurements,
    temperature_setpoint_c: f32,
    /// Setpoint slope, degC/s; recorded alongside the target for states
    /// that track a moving profile.
    setpoint_rate_c_per_s: f32,
    power_setpoint_w: f32,
}

impl HeaterCore {
    pub fn new(initial_params: AdrcParams) -> Self {
        HeaterCore {
            adrc: Adrc::new(initial_params),
            params: initial_params,
            history: SparseHistory::new(),
            control_enabled: false,
            task_active: false,
            task_time_ms: 0,
            history_last_recorded_s: 0,
            measurements: Measurements::default(),
            temperature_setpoint_c: 0.0,
            setpoint_rate_c_per_s: 0.0,
            power_setpoint_w: 0.0,
        }
    }

    pub fn is_task_active(&self) -> bool {
        self.task_active
    }

    pub fn is_control_enabled(&self) -> bool {
        self.control_enabled
    }

    pub fn history(&self) -> &SparseHistory {
        &self.history
    }

    pub fn temperature(&self) -> f32 {
        self.measurements.temperature_c
    }

    pub fn measured_power_w(&self) -> f32 {
        self.measurements.measured_power_w
    }

    pub fn power_setpoint_w(&self) -> f32 {
        self.power_setpoint_w
    }

    pub fn task_time_ms(&self) -> i32 {
        self.task_time_ms
    }

    pub fn update_measurements(&mut self, m: Measurements) {
        self.measurements = m;
    }

    pub fn set_power(&mut self, power_w: f32) {
        self.power_setpoint_w = power_w.max(0.0);
    }

    pub fn set_temperature(&mut self, target_c: f32, rate_c_per_s: f32) {
        self.temperature_setpoint_c = target_c;
        self.setpoint_rate_c_per_s = rate_c_per_s;
    }

    pub fn setpoint_rate_c_per_s(&self) -> f32 {
        self.setpoint_rate_c_per_s
    }

    /// Turns the temperature controller on against the current setpoint.
    /// A running task has already loaded parameters; otherwise the caller
    /// supplies a fresh set (`None` when the head has none to offer).
    pub fn temperature_control_on(&mut self, params: Option<AdrcParams>) -> bool {
        if !self.task_active {
            match params {
                Some(p) if p.is_valid() => self.params = p,
                _ => return false,
            }
        }
        self.adrc.reload(self.params);
        self.adrc.reset_to(self.measurements.temperature_c);
        self.control_enabled = true;
        true
    }

    pub fn temperature_control_off(&mut self) {
        self.control_enabled = false;
        self.power_setpoint_w = 0.0;
    }

    /// Starts a new task. Rejects when a task is already running or when
    /// no usable controller parameters are available (head detached or a
    /// corrupt parameter blob).
    pub fn task_start(&mut self, task_id: i32, params: Option<AdrcParams>) -> bool {
        if self.task_active {
            return false;
        }
        let Some(params) = params.filter(|p| p.is_valid()) else {
            return false;
        };
        self.params = params;
        self.adrc.reload(params);

        self.history.reset(
            HistoryParams {
                x_threshold: HISTORY_X_THRESHOLD,
                y_threshold: HISTORY_Y_MULTIPLIER,
                x_scale_after: HISTORY_X_SCALE_AFTER,
            },
            task_id,
        );
        self.task_time_ms = 0;
        self.history_last_recorded_s = 0;
        self.history.push(0, self.scaled_temperature());

        self.task_active = true;
        true
    }

    pub fn task_stop(&mut self) {
        self.task_active = false;
        self.temperature_control_off();
    }

    /// Advances the core by `dt_ms`: runs the controller if enabled, then
    /// the task clock and the once-per-second history recording. Returns
    /// the task clock value for the caller's own task iterator, or `None`
    /// when no task is running.
    pub fn tick(&mut self, dt_ms: i32) -> Option<i32> {
        if self.control_enabled {
            let dt = dt_ms as f32 / 1000.0;
            let u = self.adrc.iterate(
                self.measurements.temperature_c,
                self.temperature_setpoint_c,
                self.measurements.max_power_w,
                dt,
            );
            self.set_power(u);
        }

        if !self.task_active {
            return None;
        }
        self.task_time_ms += dt_ms;

        let seconds = (self.task_time_ms / 1000) as u32;
        if seconds > self.history_last_recorded_s {
            self.history.push(seconds, self.scaled_temperature());
            self.history_last_recorded_s = seconds;
        }
        Some(self.task_time_ms)
    }

    fn scaled_temperature(&self) -> i32 {
        (self.measurements.temperature_c * HISTORY_Y_MULTIPLIER as f32).round() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AdrcParams {
        AdrcParams { b0: 2.0, response_s: 4.0, n: 4.0, m: 3.0 }
    }

    fn core_at(temp: f32) -> HeaterCore {
        let mut core = HeaterCore::new(params());
        core.update_measurements(Measurements {
            temperature_c: temp,
            max_power_w: 100.0,
            measured_power_w: 0.0,
        });
        core
    }

    #[test]
    fn health_ok_during_power_transition() {
        assert_eq!(derive_health(PowerStatus::PwrOK, HeadStatus::Attached), Health::DevOk);
        assert_eq!(derive_health(PowerStatus::PwrTransition, HeadStatus::Attached), Health::DevOk);
    }

    #[test]
    fn health_failure_on_head_error_or_power_failure() {
        assert_eq!(derive_health(PowerStatus::PwrOK, HeadStatus::Error), Health::DevFailure);
        assert_eq!(derive_health(PowerStatus::PwrFailure, HeadStatus::Attached), Health::DevFailure);
    }

    #[test]
    fn health_not_ready_otherwise() {
        assert_eq!(derive_health(PowerStatus::PwrOff, HeadStatus::Attached), Health::DevNotReady);
        assert_eq!(derive_health(PowerStatus::PwrOK, HeadStatus::Detached), Health::DevNotReady);
        assert_eq!(derive_health(PowerStatus::PwrRejected, HeadStatus::Attached), Health::DevNotReady);
        assert_eq!(derive_health(PowerStatus::PwrOK, HeadStatus::Initializing), Health::DevNotReady);
    }

    #[test]
    fn task_start_rejects_double_start_and_missing_params() {
        let mut core = core_at(25.0);
        assert!(!core.task_start(1, None));
        assert!(core.task_start(1, Some(params())));
        assert!(!core.task_start(2, Some(params())));
    }

    #[test]
    fn task_start_rejects_invalid_params() {
        let mut core = core_at(25.0);
        let bad = AdrcParams { b0: 0.0, response_s: 4.0, n: 4.0, m: 3.0 };
        assert!(!core.task_start(1, Some(bad)));
    }

    #[test]
    fn task_start_seeds_history_with_scaled_temperature() {
        let mut core = core_at(25.5);
        assert!(core.task_start(1, Some(params())));
        let chunk = core.history().read_chunk(core.history().version(), 0);
        assert_eq!(chunk.points, vec![crate::sparse_history::HistoryPoint { x: 0, y: 2550 }]);
        assert_eq!(chunk.task_id, 1);
    }

    #[test]
    fn one_history_point_per_whole_second() {
        let mut core = core_at(30.0);
        assert!(core.task_start(1, Some(params())));
        for i in 0..100 {
            // warming fast enough that every second's point lands.
            core.update_measurements(Measurements {
                temperature_c: 30.0 + i as f32 * 0.1,
                max_power_w: 100.0,
                measured_power_w: 0.0,
            });
            core.tick(50); // 5000ms total
        }
        // the seed point plus one per completed second 1..=5.
        assert_eq!(core.history().len(), 6);
        let chunk = core.history().read_chunk(core.history().version(), 0);
        assert_eq!(chunk.points.last().unwrap().x, 5);
    }

    #[test]
    fn flat_temperature_collapses_history_points() {
        let mut core = core_at(30.0);
        assert!(core.task_start(1, Some(params())));
        for _ in 0..400 {
            core.tick(50); // 20s total at constant temperature
        }
        let chunk = core.history().read_chunk(core.history().version(), 0);
        // far fewer retained points than elapsed seconds, but the tail
        // still tracks the latest second.
        assert!(chunk.points.len() < 20);
        assert_eq!(chunk.points.last().unwrap().x, 20);
    }

    #[test]
    fn controller_output_lands_in_power_setpoint() {
        let mut core = core_at(20.0);
        assert!(core.task_start(1, Some(params())));
        core.set_temperature(80.0, 0.0);
        assert!(core.temperature_control_on(None));
        core.tick(50);
        assert!(core.power_setpoint_w() > 0.0);
    }

    #[test]
    fn control_on_without_task_needs_params() {
        let mut core = core_at(20.0);
        assert!(!core.temperature_control_on(None));
        assert!(core.temperature_control_on(Some(params())));
    }

    #[test]
    fn task_stop_disables_control_and_zeroes_power() {
        let mut core = core_at(20.0);
        assert!(core.task_start(1, Some(params())));
        assert!(core.temperature_control_on(None));
        core.set_temperature(90.0, 0.0);
        core.tick(50);
        core.task_stop();
        assert!(!core.is_task_active());
        assert!(!core.is_control_enabled());
        assert_eq!(core.power_setpoint_w(), 0.0);
        assert_eq!(core.tick(50), None);
    }
}
