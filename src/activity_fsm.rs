//! Top-level activity state machine.
//!
//! Consumes `Command`s from the FIFO and drives the `HeaterCore` task
//! lifecycle. States are an explicit tagged enum carrying their own data;
//! entry and exit behaviour lives in the `enter_*` helpers and
//! `exit_current`, with the surrounding application reached through the
//! `ActivityHooks` trait rather than globals.

use crate::adrc::AdrcParams;
use crate::command::{ButtonPress, Command, CommandSender};
use crate::config::{
    BONDING_WINDOW_MS, HISTORY_ID_ADRC_TEST_MODE, HISTORY_ID_SENSOR_BAKE_MODE,
    HISTORY_ID_STEP_RESPONSE, SENSOR_BAKE_JITTER_C, STEP_RESPONSE_MAX_LOG_S,
    STEP_RESPONSE_STABLE_BAND_C, STEP_RESPONSE_STABLE_WINDOW_S,
};
use crate::heater_core::{Health, HeaterCore};
use crate::time::{expired, Tick};
use crate::timeline::{Profile, Timeline};

/// Stable activity ids exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Init = 0,
    Idle = 1,
    Reflow = 2,
    SensorBake = 3,
    AdrcTest = 4,
    StepResponse = 5,
    Bonding = 6,
}

/// The application surface the states call back into: parameter and
/// profile storage, BLE pairing, and UI feedback. Beeps default to no-ops
/// so tests and headless builds don't have to care.
pub trait ActivityHooks {
    /// Controller parameters of the attached head, `None` when no head is
    /// connected or its parameter blob is unusable.
    fn adrc_params(&self) -> Option<AdrcParams>;
    fn selected_profile(&self) -> Option<Profile>;
    fn pairing_enable(&self, on: bool);
    fn save_step_response_fit(&self, b0: f32, response_s: f32);
    fn beep_task_started(&self) {}
    fn beep_task_succeeded(&self) {}
    fn beep_task_terminated(&self) {}
}

enum State {
    Init,
    Idle,
    Reflow { timeline: Timeline },
    SensorBake { last_temperature: f32 },
    AdrcTest,
    StepResponse { samples: Vec<(f32, f32)> },
    Bonding { since: Tick, off_posted: bool },
}

pub struct ActivityFsm {
    state: State,
    pub core: HeaterCore,
}

impl ActivityFsm {
    pub fn new(initial_params: AdrcParams) -> Self {
        ActivityFsm { state: State::Init, core: HeaterCore::new(initial_params) }
    }

    pub fn status(&self) -> ActivityStatus {
        match self.state {
            State::Init => ActivityStatus::Init,
            State::Idle => ActivityStatus::Idle,
            State::Reflow { .. } => ActivityStatus::Reflow,
            State::SensorBake { .. } => ActivityStatus::SensorBake,
            State::AdrcTest => ActivityStatus::AdrcTest,
            State::StepResponse { .. } => ActivityStatus::StepResponse,
            State::Bonding { .. } => ActivityStatus::Bonding,
        }
    }

    /// Applies a single command taken off the FIFO. The consumer thread
    /// serialises calls here under the dispatch mutex, so transitions are
    /// never re-entered.
    pub fn handle_command(
        &mut self,
        cmd: Command,
        now: Tick,
        hooks: &dyn ActivityHooks,
    ) {
        self.promote_init();
        match cmd {
            Command::Stop { success } => self.on_stop(success, hooks),
            Command::Reflow => {
                if matches!(self.state, State::Idle) {
                    self.enter_reflow(hooks);
                }
            }
            Command::SensorBake { watts } => match self.state {
                State::Idle => self.enter_sensor_bake(watts, hooks),
                State::SensorBake { .. } => self.core.set_power(watts),
                _ => {}
            },
            Command::AdrcTest { temperature } => match self.state {
                State::Idle => self.enter_adrc_test(temperature, hooks),
                State::AdrcTest => self.core.set_temperature(temperature, 0.0),
                _ => {}
            },
            Command::StepResponse { watts } => {
                if matches!(self.state, State::Idle) {
                    self.enter_step_response(watts, hooks);
                }
            }
            Command::BondOff => {
                if matches!(self.state, State::Bonding { .. }) {
                    self.goto_idle(hooks);
                }
            }
            Command::Button(press) => self.on_button(press, now, hooks),
        }
    }

    fn on_stop(&mut self, success: bool, hooks: &dyn ActivityHooks) {
        match self.state {
            State::Reflow { .. } => {
                if success {
                    hooks.beep_task_succeeded();
                } else {
                    hooks.beep_task_terminated();
                }
                self.goto_idle(hooks);
            }
            State::SensorBake { .. } | State::AdrcTest | State::StepResponse { .. } => {
                self.goto_idle(hooks);
            }
            State::Init | State::Idle | State::Bonding { .. } => {}
        }
    }

    fn on_button(&mut self, press: ButtonPress, now: Tick, hooks: &dyn ActivityHooks) {
        match self.state {
            State::Idle => match press {
                ButtonPress::Pressed5x => self.enter_bonding(now, hooks),
                ButtonPress::LongPress => {
                    log::info!("long press: starting reflow");
                    self.enter_reflow(hooks);
                }
                ButtonPress::LongPressStart => log::debug!("long press started"),
                ButtonPress::LongPressFail => log::debug!("long press released early"),
                _ => {}
            },
            State::Reflow { .. }
            | State::SensorBake { .. }
            | State::AdrcTest
            | State::StepResponse { .. } => {
                if press == ButtonPress::Pressed1x {
                    hooks.beep_task_terminated();
                    self.goto_idle(hooks);
                }
            }
            State::Bonding { .. } => {
                if press == ButtonPress::Pressed1x {
                    self.goto_idle(hooks);
                }
            }
            State::Init => {}
        }
    }

    /// Advances the running activity by one core tick. `power_ok` pauses
    /// control during a PDO renegotiation without tearing the task down;
    /// a health drop below `DevOk` instead requests a stop through the
    /// FIFO so observers see the transition.
    pub fn tick(
        &mut self,
        dt_ms: i32,
        now: Tick,
        health: Health,
        power_ok: bool,
        sender: &CommandSender,
        hooks: &dyn ActivityHooks,
    ) {
        self.promote_init();

        if let State::Bonding { since, off_posted } = &mut self.state {
            if !*off_posted && expired(*since, BONDING_WINDOW_MS, now) {
                sender.post(Command::BondOff);
                *off_posted = true;
            }
            return;
        }

        if health != Health::DevOk {
            if self.core.is_task_active() {
                log::error!("device health degraded mid-task, requesting stop");
                sender.post(Command::Stop { success: false });
            }
            return;
        }
        if !power_ok {
            return;
        }

        let Some(time_ms) = self.core.tick(dt_ms) else {
            return;
        };

        match &mut self.state {
            State::Reflow { timeline } => {
                if time_ms as i64 >= timeline.get_max_time_x1000() {
                    self.core.task_stop();
                    sender.post(Command::Stop { success: true });
                } else {
                    let target_c = timeline.get_target(time_ms as i64) as f32 / 100.0;
                    let rate = timeline.get_rate(time_ms as i64);
                    self.core.set_temperature(target_c, rate);
                }
            }
            State::SensorBake { last_temperature } => {
                let t = self.core.temperature();
                if (t - *last_temperature).abs() > SENSOR_BAKE_JITTER_C {
                    log::error!(
                        "abnormal temperature jitter: {:.1} -> {:.1}",
                        *last_temperature,
                        t
                    );
                }
                *last_temperature = t;
            }
            State::AdrcTest => {}
            State::StepResponse { samples } => {
                step_response_iterate(samples, time_ms, &mut self.core, sender, hooks);
            }
            State::Init | State::Idle | State::Bonding { .. } => {}
        }
    }

    fn promote_init(&mut self) {
        if matches!(self.state, State::Init) {
            log::info!("activity: Init -> Idle");
            self.state = State::Idle;
        }
    }

    fn goto_idle(&mut self, hooks: &dyn ActivityHooks) {
        self.exit_current(hooks);
        self.state = State::Idle;
    }

    fn exit_current(&mut self, hooks: &dyn ActivityHooks) {
        match self.state {
            State::Reflow { .. }
            | State::SensorBake { .. }
            | State::AdrcTest
            | State::StepResponse { .. } => self.core.task_stop(),
            State::Bonding { .. } => hooks.pairing_enable(false),
            State::Init | State::Idle => {}
        }
    }

    fn enter_reflow(&mut self, hooks: &dyn ActivityHooks) {
        let Some(profile) = hooks.selected_profile() else {
            log::warn!("reflow rejected: no profile selected");
            hooks.beep_task_terminated();
            return;
        };
        let mut timeline = Timeline::new();
        timeline.load(&profile);
        if !self.core.task_start(profile.id, hooks.adrc_params()) {
            log::warn!("reflow rejected: task start failed");
            hooks.beep_task_terminated();
            return;
        }
        self.core.temperature_control_on(None);
        hooks.beep_task_started();
        log::info!("activity: Idle -> Reflow (profile {})", profile.id);
        self.state = State::Reflow { timeline };
    }

    fn enter_sensor_bake(&mut self, watts: f32, hooks: &dyn ActivityHooks) {
        if !self.core.task_start(HISTORY_ID_SENSOR_BAKE_MODE, hooks.adrc_params()) {
            return;
        }
        self.core.set_power(watts);
        log::info!("activity: Idle -> SensorBake ({watts:.1}W)");
        self.state = State::SensorBake { last_temperature: self.core.temperature() };
    }

    fn enter_adrc_test(&mut self, temperature: f32, hooks: &dyn ActivityHooks) {
        self.core.set_temperature(temperature, 0.0);
        if !self.core.task_start(HISTORY_ID_ADRC_TEST_MODE, hooks.adrc_params()) {
            return;
        }
        self.core.temperature_control_on(None);
        log::info!("activity: Idle -> AdrcTest ({temperature:.1}C)");
        self.state = State::AdrcTest;
    }

    fn enter_step_response(&mut self, watts: f32, hooks: &dyn ActivityHooks) {
        if !self.core.task_start(HISTORY_ID_STEP_RESPONSE, hooks.adrc_params()) {
            return;
        }
        self.core.set_power(watts);
        log::info!("activity: Idle -> StepResponse ({watts:.1}W)");
        self.state = State::StepResponse { samples: vec![(self.core.temperature(), 0.0)] };
    }

    fn enter_bonding(&mut self, now: Tick, hooks: &dyn ActivityHooks) {
        hooks.pairing_enable(true);
        log::info!("activity: Idle -> Bonding");
        self.state = State::Bonding { since: now, off_posted: false };
    }
}

/// One per-second sample of the open-loop step test, and the 63%-rise fit
/// once the plant settles: apply constant power, wait until the
/// temperature has been stable for ten consecutive seconds, then derive
/// the time constant from the first crossing of
/// `T_initial + 0.63 * (T_final - T_initial)` and the process gain from
/// the rise divided by that time and the applied power.
fn step_response_iterate(
    samples: &mut Vec<(f32, f32)>,
    time_ms: i32,
    core: &mut HeaterCore,
    sender: &CommandSender,
    hooks: &dyn ActivityHooks,
) {
    // sample index = time in seconds
    if (time_ms as i64) < samples.len() as i64 * 1000 {
        return;
    }
    samples.push((core.temperature(), core.measured_power_w()));

    if samples.len() > STEP_RESPONSE_MAX_LOG_S {
        log::warn!("step response never settled, giving up");
        core.task_stop();
        sender.post(Command::Stop { success: false });
        return;
    }

    if samples.len() <= STEP_RESPONSE_STABLE_WINDOW_S {
        return;
    }
    let n = samples.len();
    let recent = &samples[n - STEP_RESPONSE_STABLE_WINDOW_S..];
    if (samples[n - 1].0 - recent[0].0).abs() > STEP_RESPONSE_STABLE_BAND_C {
        return;
    }

    let p_max = samples.iter().map(|e| e.1).fold(0.0f32, f32::max);
    let t_initial = samples[0].0;
    let t_final = samples[n - 1].0;
    let t_63 = t_initial + 0.63 * (t_final - t_initial);
    let time_63 = samples.iter().position(|e| e.0 >= t_63).unwrap_or(0) as f32;

    if time_63 <= 0.0 || p_max <= 0.0 || t_final <= t_initial {
        log::warn!("step response produced no usable fit");
        core.task_stop();
        sender.post(Command::Stop { success: false });
        return;
    }

    let b0 = (t_63 - t_initial) / time_63 / p_max;
    log::info!("step response fit: response={time_63:.0}s b0={b0:.5}");
    hooks.save_step_response_fit(b0, time_63);
    core.task_stop();
    sender.post(Command::Stop { success: true });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandFifo;
    use std::cell::RefCell;

    struct TestHooks {
        params: Option<AdrcParams>,
        profile: Option<Profile>,
        pairing: RefCell<Vec<bool>>,
        fits: RefCell<Vec<(f32, f32)>>,
    }

    impl TestHooks {
        fn attached() -> Self {
            TestHooks {
                params: Some(AdrcParams { b0: 2.0, response_s: 4.0, n: 4.0, m: 3.0 }),
                profile: Some(Profile {
                    id: 1,
                    name: "test".into(),
                    segments: vec![
                        crate::timeline::Segment { target_c: 150, duration_s: 60 },
                        crate::timeline::Segment { target_c: 220, duration_s: 60 },
                        crate::timeline::Segment { target_c: 220, duration_s: 60 },
                    ],
                }),
                pairing: RefCell::new(Vec::new()),
                fits: RefCell::new(Vec::new()),
            }
        }

        fn detached() -> Self {
            TestHooks {
                params: None,
                profile: None,
                pairing: RefCell::new(Vec::new()),
                fits: RefCell::new(Vec::new()),
            }
        }
    }

    impl ActivityHooks for TestHooks {
        fn adrc_params(&self) -> Option<AdrcParams> {
            self.params
        }
        fn selected_profile(&self) -> Option<Profile> {
            self.profile.clone()
        }
        fn pairing_enable(&self, on: bool) {
            self.pairing.borrow_mut().push(on);
        }
        fn save_step_response_fit(&self, b0: f32, response_s: f32) {
            self.fits.borrow_mut().push((b0, response_s));
        }
    }

    fn fsm_with_temp(temp: f32) -> ActivityFsm {
        let mut fsm = ActivityFsm::new(AdrcParams { b0: 2.0, response_s: 4.0, n: 4.0, m: 3.0 });
        fsm.core.update_measurements(crate::heater_core::Measurements {
            temperature_c: temp,
            max_power_w: 100.0,
            measured_power_w: 0.0,
        });
        fsm
    }

    #[test]
    fn init_promotes_to_idle() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        assert_eq!(fsm.status(), ActivityStatus::Init);
        fsm.handle_command(Command::Stop { success: false }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);
    }

    #[test]
    fn sensor_bake_starts_and_follows_power_updates() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        fsm.handle_command(Command::SensorBake { watts: 10.0 }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::SensorBake);
        assert_eq!(fsm.core.power_setpoint_w(), 10.0);

        fsm.handle_command(Command::SensorBake { watts: 20.0 }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::SensorBake);
        assert_eq!(fsm.core.power_setpoint_w(), 20.0);
    }

    #[test]
    fn tasks_reject_when_head_detached() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::detached();
        fsm.handle_command(Command::SensorBake { watts: 10.0 }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);
        fsm.handle_command(Command::Reflow, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);
        fsm.handle_command(Command::StepResponse { watts: 10.0 }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);
    }

    #[test]
    fn long_press_starts_reflow_and_5x_starts_bonding() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        fsm.handle_command(Command::Button(ButtonPress::LongPress), Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Reflow);
        fsm.handle_command(Command::Button(ButtonPress::Pressed1x), Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);

        fsm.handle_command(Command::Button(ButtonPress::Pressed5x), Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Bonding);
        assert_eq!(*hooks.pairing.borrow(), vec![true]);
    }

    #[test]
    fn bonding_window_posts_bond_off_and_disables_pairing() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        let fifo = CommandFifo::new();
        let sender = fifo.sender();
        fsm.handle_command(Command::Button(ButtonPress::Pressed5x), Tick(0), &hooks);

        fsm.tick(50, Tick(1000), Health::DevOk, true, &sender, &hooks);
        assert!(fifo.receiver().try_recv().is_err());

        fsm.tick(50, Tick(BONDING_WINDOW_MS), Health::DevOk, true, &sender, &hooks);
        let posted = fifo.receiver().try_recv().unwrap();
        assert_eq!(posted, Command::BondOff);

        fsm.handle_command(posted, Tick(BONDING_WINDOW_MS), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);
        assert_eq!(*hooks.pairing.borrow(), vec![true, false]);
    }

    #[test]
    fn reflow_runs_to_completion_and_posts_success() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        let fifo = CommandFifo::new();
        let sender = fifo.sender();

        fsm.handle_command(Command::Reflow, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Reflow);
        assert!(fsm.core.is_control_enabled());

        // 180s profile at 50ms ticks, with the plate warming roughly
        // along the profile so history actually accumulates points.
        let mut stop_seen = None;
        for i in 0..=(180_000 / 50) {
            let y = 25.0 + (i as f32) * 0.05;
            fsm.core.update_measurements(crate::heater_core::Measurements {
                temperature_c: y,
                max_power_w: 100.0,
                measured_power_w: 40.0,
            });
            fsm.tick(50, Tick(0), Health::DevOk, true, &sender, &hooks);
            if let Ok(cmd) = fifo.receiver().try_recv() {
                stop_seen = Some(cmd);
                break;
            }
        }
        assert_eq!(stop_seen, Some(Command::Stop { success: true }));
        assert!(!fsm.core.is_task_active());

        // history covers the whole run, monotonically.
        let chunk_start = fsm.core.history().read_chunk(fsm.core.history().version(), 0);
        assert_eq!(chunk_start.points.first().unwrap().x, 0);
        let chunk_end = fsm.core.history().read_chunk(fsm.core.history().version(), 100);
        assert!(chunk_end.points.last().unwrap().x >= 179);

        fsm.handle_command(Command::Stop { success: true }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);
    }

    #[test]
    fn reflow_tracks_timeline_target() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        let fifo = CommandFifo::new();
        let sender = fifo.sender();
        fsm.handle_command(Command::Reflow, Tick(0), &hooks);

        // advance 30s: mid first segment, target between 25 and 150.
        for _ in 0..600 {
            fsm.tick(50, Tick(0), Health::DevOk, true, &sender, &hooks);
        }
        assert!(fsm.core.setpoint_rate_c_per_s() > 0.0);
    }

    #[test]
    fn health_failure_mid_task_requests_stop() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        let fifo = CommandFifo::new();
        let sender = fifo.sender();
        fsm.handle_command(Command::AdrcTest { temperature: 80.0 }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::AdrcTest);

        fsm.tick(50, Tick(50), Health::DevFailure, true, &sender, &hooks);
        let posted = fifo.receiver().try_recv().unwrap();
        assert_eq!(posted, Command::Stop { success: false });

        fsm.handle_command(posted, Tick(100), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Idle);
        assert!(!fsm.core.is_task_active());
    }

    #[test]
    fn power_transition_pauses_without_stopping_task() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        let fifo = CommandFifo::new();
        let sender = fifo.sender();
        fsm.handle_command(Command::SensorBake { watts: 15.0 }, Tick(0), &hooks);

        fsm.tick(50, Tick(50), Health::DevOk, false, &sender, &hooks);
        assert!(fifo.receiver().try_recv().is_err());
        assert!(fsm.core.is_task_active());
        assert_eq!(fsm.core.task_time_ms(), 0);
    }

    #[test]
    fn step_response_fits_and_saves_params() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        let fifo = CommandFifo::new();
        let sender = fifo.sender();
        fsm.handle_command(Command::StepResponse { watts: 20.0 }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::StepResponse);

        // First-order plant rising from 25C to ~80C with tau = 30s,
        // sampled at the 50ms core tick.
        let mut t_ms: i32 = 0;
        for _ in 0..(400 * 20) {
            t_ms += 50;
            let y = 25.0 + 55.0 * (1.0 - (-(t_ms as f32) / 30_000.0).exp());
            fsm.core.update_measurements(crate::heater_core::Measurements {
                temperature_c: y,
                max_power_w: 100.0,
                measured_power_w: 20.0,
            });
            fsm.tick(50, Tick(t_ms as u32), Health::DevOk, true, &sender, &hooks);
            if !fsm.core.is_task_active() {
                break;
            }
        }

        let posted = fifo.receiver().try_recv().unwrap();
        assert_eq!(posted, Command::Stop { success: true });
        let fits = hooks.fits.borrow();
        assert_eq!(fits.len(), 1);
        let (b0, response_s) = fits[0];
        assert!(b0 > 0.0);
        // 63% rise of a tau=30s plant lands near 30s.
        assert!((20.0..45.0).contains(&response_s), "response_s={response_s}");
    }

    #[test]
    fn stop_is_ignored_while_bonding() {
        let mut fsm = fsm_with_temp(25.0);
        let hooks = TestHooks::attached();
        fsm.handle_command(Command::Button(ButtonPress::Pressed5x), Tick(0), &hooks);
        fsm.handle_command(Command::Stop { success: false }, Tick(0), &hooks);
        assert_eq!(fsm.status(), ActivityStatus::Bonding);
    }
}
