//! Software PWM with dithered duty, synchronised with ADC sampling.
//!
//! A 1ms tick drives a Disabled/Pulse/Gap cycle with a fixed 200-tick
//! period. The requested duty rarely lands on a whole number of ticks, so
//! the fractional remainder is carried in `duty_error` and folded into the
//! next pulse; over many periods the delivered duty converges on the
//! request to within 1/1000.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::config::{
    POWER_STABILIZATION_TICKS, PWM_DUTY_ERROR_MAX, PWM_DUTY_ERROR_MIN, PWM_IDLE_TICKS,
    PWM_MIN_PULSE_TICKS, PWM_PERIOD_TICKS,
};

/// Drives (or stops driving) current through the heater load; the MOSFET
/// driver behind it is external hardware glue.
pub trait HeaterLoad: Send + Sync {
    fn set_on(&self, on: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disabled,
    /// `gap_ticks` is fixed at pulse entry: the normal remainder of the
    /// period, or the long idle stretch when the duty request was zero.
    Pulse { tick: u32, pulse_ticks: u32, gap_ticks: u32 },
    Gap { tick: u32, gap_ticks: u32 },
}

struct Inner {
    state: State,
    duty_error: i32,
}

pub struct PwmFsm {
    duty_x1000: AtomicU32,
    enabled: AtomicBool,
    inner: Mutex<Inner>,
}

impl PwmFsm {
    pub fn new() -> Self {
        PwmFsm {
            duty_x1000: AtomicU32::new(0),
            enabled: AtomicBool::new(false),
            inner: Mutex::new(Inner { state: State::Disabled, duty_error: 0 }),
        }
    }

    /// Updates the target duty, clamped to [0, 1000]. Takes effect at the
    /// next Pulse-state entry, never mid-pulse.
    pub fn set_duty_x1000(&self, duty: u32) {
        self.duty_x1000.store(duty.min(1000), Ordering::SeqCst);
    }

    pub fn duty_x1000(&self) -> u32 {
        self.duty_x1000.load(Ordering::SeqCst)
    }

    /// Rising edge is latched on the next Disabled tick; disabling is
    /// immediate.
    pub fn set_enabled(&self, enabled: bool) {
        if !enabled {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::Disabled;
            inner.duty_error = 0;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Advances the FSM by one 1ms tick. `load` is actuated as needed;
    /// `sample` is invoked once per tick while inside the settled ADC
    /// window of a Pulse and receives whether this is the pulse's final
    /// sampling tick, where callers trigger the drain tracker's averaging.
    /// Disabling mid-pulse never reaches that final tick, so partial data
    /// is not surfaced.
    pub fn tick(&self, load: &dyn HeaterLoad, mut sample: impl FnMut(bool)) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Disabled => {
                load.set_on(false);
                if self.enabled.load(Ordering::SeqCst) {
                    self.enter_pulse(&mut inner, load);
                }
            }
            State::Pulse { tick, pulse_ticks, gap_ticks } => {
                if !self.enabled.load(Ordering::SeqCst) {
                    inner.state = State::Disabled;
                    inner.duty_error = 0;
                    load.set_on(false);
                    return;
                }
                let next_tick = tick + 1;
                let is_final = next_tick >= pulse_ticks;
                if tick >= POWER_STABILIZATION_TICKS {
                    sample(is_final);
                }
                if is_final {
                    if gap_ticks == 0 {
                        // 100% duty: chain straight into the next pulse.
                        self.enter_pulse(&mut inner, load);
                    } else {
                        load.set_on(false);
                        inner.state = State::Gap { tick: 0, gap_ticks };
                    }
                } else {
                    inner.state = State::Pulse { tick: next_tick, pulse_ticks, gap_ticks };
                }
            }
            State::Gap { tick, gap_ticks } => {
                if !self.enabled.load(Ordering::SeqCst) {
                    inner.state = State::Disabled;
                    inner.duty_error = 0;
                    load.set_on(false);
                    return;
                }
                let next_tick = tick + 1;
                if next_tick >= gap_ticks {
                    self.enter_pulse(&mut inner, load);
                } else {
                    inner.state = State::Gap { tick: next_tick, gap_ticks };
                }
            }
        }
    }

    /// Pulse-entry: latch the current duty request, fold in the carried
    /// dither error, and turn the load on. A zero duty still emits the
    /// minimum pulse (so the drain tracker gets a sample window) followed
    /// by a long full-off stretch instead of the normal gap.
    fn enter_pulse(&self, inner: &mut Inner, load: &dyn HeaterLoad) {
        let duty = self.duty_x1000.load(Ordering::SeqCst);
        let (pulse_ticks, gap_ticks) = if duty == 0 {
            inner.duty_error = 0; // reset carry when idle pulsing
            (PWM_MIN_PULSE_TICKS, PWM_IDLE_TICKS)
        } else {
            let desired = (duty * PWM_PERIOD_TICKS) as i64;
            let raw = desired + inner.duty_error as i64 + 500;
            let pulse_ticks = ((raw / 1000) as u32).clamp(PWM_MIN_PULSE_TICKS, PWM_PERIOD_TICKS);
            inner.duty_error = (desired + inner.duty_error as i64 - pulse_ticks as i64 * 1000)
                .clamp(PWM_DUTY_ERROR_MIN as i64, PWM_DUTY_ERROR_MAX as i64)
                as i32;
            (pulse_ticks, PWM_PERIOD_TICKS - pulse_ticks)
        };
        inner.state = State::Pulse { tick: 0, pulse_ticks, gap_ticks };
        load.set_on(true);
    }
}

impl Default for PwmFsm {
    fn default() -> Self {
        Self::new()
    }
}
