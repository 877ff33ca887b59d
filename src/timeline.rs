//! Piecewise-linear reflow profile setpoint.
//!
//! Offsets and durations are carried in milliseconds; the `_x1000` naming
//! reflects that these are seconds-times-1000 on the wire.

use crate::config::{START_TEMPERATURE_C, TIMELINE_MAX_SLOPE_C_PER_S};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub target_c: i32,
    pub duration_s: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub id: i32,
    pub name: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy)]
struct Point {
    t_ms_x1000: i64,
    temp_c_x100: i32,
    slope_c_per_s: f32,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    points: Vec<Point>,
}

impl Timeline {
    pub fn new() -> Self {
        Timeline { points: Vec::new() }
    }

    pub fn load(&mut self, profile: &Profile) {
        self.points.clear();
        self.points.push(Point {
            t_ms_x1000: 0,
            temp_c_x100: START_TEMPERATURE_C * 100,
            slope_c_per_s: 0.0,
        });
        let mut t_ms_x1000: i64 = 0;
        let mut temp_c_x100 = START_TEMPERATURE_C * 100;
        for seg in &profile.segments {
            let prev_temp_c_x100 = temp_c_x100;
            t_ms_x1000 += seg.duration_s as i64 * 1000;
            temp_c_x100 = seg.target_c * 100;

            let slope = if seg.duration_s == 0 {
                if temp_c_x100 > prev_temp_c_x100 {
                    TIMELINE_MAX_SLOPE_C_PER_S
                } else if temp_c_x100 < prev_temp_c_x100 {
                    -TIMELINE_MAX_SLOPE_C_PER_S
                } else {
                    0.0
                }
            } else {
                let raw = (temp_c_x100 - prev_temp_c_x100) as f32 / 100.0 / seg.duration_s as f32;
                raw.clamp(-TIMELINE_MAX_SLOPE_C_PER_S, TIMELINE_MAX_SLOPE_C_PER_S)
            };

            // Retroactively stamp the slope onto the segment's starting point
            // (the point already pushed for the previous segment boundary).
            if let Some(last) = self.points.last_mut() {
                last.slope_c_per_s = slope;
            }
            self.points.push(Point { t_ms_x1000, temp_c_x100, slope_c_per_s: slope });
        }
    }

    /// Target temperature, x100 degC, at `offset_ms` milliseconds from task
    /// start. Out-of-range offsets (before start, or at/past the end)
    /// return 0.
    pub fn get_target(&self, offset_ms: i64) -> i32 {
        if self.points.len() < 2 || offset_ms < 0 || offset_ms >= self.max_time_ms() {
            return 0;
        }
        for w in self.points.windows(2) {
            let (a, b) = (w[0], w[1]);
            if offset_ms >= a.t_ms_x1000 && offset_ms <= b.t_ms_x1000 {
                if b.t_ms_x1000 == a.t_ms_x1000 {
                    return b.temp_c_x100;
                }
                let span = (b.t_ms_x1000 - a.t_ms_x1000) as f64;
                let frac = (offset_ms - a.t_ms_x1000) as f64 / span;
                let value = a.temp_c_x100 as f64 + frac * (b.temp_c_x100 - a.temp_c_x100) as f64;
                return value.round() as i32;
            }
        }
        0
    }

    /// Piecewise-constant slope (degC/s) of the segment containing `offset_ms`.
    pub fn get_rate(&self, offset_ms: i64) -> f32 {
        if self.points.len() < 2 || offset_ms < 0 || offset_ms > self.max_time_ms() {
            return 0.0;
        }
        for w in self.points.windows(2) {
            let (a, b) = (w[0], w[1]);
            if offset_ms >= a.t_ms_x1000 && offset_ms <= b.t_ms_x1000 {
                return a.slope_c_per_s;
            }
        }
        0.0
    }

    pub fn get_max_time_x1000(&self) -> i64 {
        self.max_time_ms()
    }

    fn max_time_ms(&self) -> i64 {
        self.points.last().map(|p| p.t_ms_x1000).unwrap_or(0)
    }
}
