//! Composition root wiring every subsystem into one owned struct that is
//! passed by reference into the tick threads; no module globals.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use prost::Message;

use crate::activity_fsm::{ActivityFsm, ActivityHooks};
use crate::adrc::AdrcParams;
use crate::command::CommandFifo;
use crate::config::{
    EEPROM_MAX_PAYLOAD, PROFILES_MAX_COUNT, PROFILE_MAX_SEGMENTS, PROFILE_NAME_MAX_LEN,
};
use crate::data_guard::DataGuard;
use crate::drain_tracker::DrainTracker;
use crate::eeprom::EepromDevice;
use crate::error::{Error, Result};
use crate::head_fsm::{HeadFsm, HeadParams, HeadStatus};
use crate::heater_core::{derive_health, Measurements};
use crate::power_fsm::{PowerFsm, PowerStatus};
use crate::preferences::{AsyncPreference, KeyValueStore, PreferenceCodec, TrivialCodec};
use crate::temperature_processor::TemperatureProcessor;
use crate::time::Tick;
use crate::timeline::{Profile, Segment};
use crate::wire;

/// Fixed-capacity byte buffer: `Copy` so it can live inside a `DataGuard`,
/// unlike an unbounded `Vec<u8>`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Blob {
    len: u16,
    data: [u8; EEPROM_MAX_PAYLOAD],
}

impl Default for Blob {
    fn default() -> Self {
        Blob { len: 0, data: [0u8; EEPROM_MAX_PAYLOAD] }
    }
}

impl Blob {
    fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

pub struct BlobCodec;

impl PreferenceCodec<Blob> for BlobCodec {
    fn encode(&self, value: &Blob) -> Vec<u8> {
        value.as_slice().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Option<Blob> {
        if bytes.len() > EEPROM_MAX_PAYLOAD {
            return None;
        }
        let mut blob = Blob::default();
        blob.len = bytes.len() as u16;
        blob.data[..bytes.len()].copy_from_slice(bytes);
        Some(blob)
    }
}

/// The factory profile restored by `reset_profiles` and used when the
/// store has never been written.
pub fn default_profiles() -> Vec<Profile> {
    vec![Profile {
        id: 1,
        name: "Lead-free basic".into(),
        segments: vec![
            Segment { target_c: 150, duration_s: 90 },
            Segment { target_c: 180, duration_s: 60 },
            Segment { target_c: 245, duration_s: 45 },
            Segment { target_c: 40, duration_s: 60 },
        ],
    }]
}

pub struct App {
    pub power: PowerFsm,
    pub head: Mutex<HeadFsm>,
    pub activity: Mutex<ActivityFsm>,
    pub command_fifo: CommandFifo,
    pub drain: DrainTracker,
    pub head_params: DataGuard<HeadParams>,
    eeprom: Box<dyn EepromDevice + Send + Sync>,
    kv: Box<dyn KeyValueStore>,
    profiles: AsyncPreference<Blob>,
    selected_profile_id: AsyncPreference<i32>,
    pairing_active: AtomicBool,
    last_temperature_x10: AtomicI32,
}

impl App {
    pub fn new(
        eeprom: Box<dyn EepromDevice + Send + Sync>,
        kv: Box<dyn KeyValueStore>,
        initial_params: AdrcParams,
    ) -> Self {
        App {
            power: PowerFsm::new(),
            head: Mutex::new(HeadFsm::new()),
            activity: Mutex::new(ActivityFsm::new(initial_params)),
            command_fifo: CommandFifo::new(),
            drain: DrainTracker::new(),
            head_params: DataGuard::new(HeadParams::default()),
            eeprom,
            kv,
            profiles: AsyncPreference::new("profiles", "items", Blob::default()),
            selected_profile_id: AsyncPreference::new("profiles", "selected", -1),
            pairing_active: AtomicBool::new(false),
            last_temperature_x10: AtomicI32::new(0),
        }
    }

    pub fn eeprom(&self) -> &dyn EepromDevice {
        self.eeprom.as_ref()
    }

    pub fn kv(&self) -> &dyn KeyValueStore {
        self.kv.as_ref()
    }

    pub fn profiles_pref(&self) -> &AsyncPreference<Blob> {
        &self.profiles
    }

    pub fn selected_profile_pref(&self) -> &AsyncPreference<i32> {
        &self.selected_profile_id
    }

    pub fn is_pairing_active(&self) -> bool {
        self.pairing_active.load(Ordering::Relaxed)
    }

    pub fn head_status(&self) -> HeadStatus {
        self.head.lock().unwrap().status()
    }

    /// One pass of the 50ms control loop: derive health, refresh the
    /// core's measurements from the head sensor and the drain tracker,
    /// advance the running activity, and forward the resulting power
    /// setpoint to the power side.
    pub fn heater_tick(&self, dt_ms: i32, now: Tick, heater_sensor_mv: i32) {
        let head_status = self.head_status();
        let power_status = self.power.status();
        let health = derive_health(power_status, head_status);
        let power_ok = power_status == PowerStatus::PwrOK;

        let processor = TemperatureProcessor::from_sensor_params(&self.head_params.read().sensor);
        let temperature_x10 = processor.temperature_x10(heater_sensor_mv);
        self.last_temperature_x10.store(temperature_x10, Ordering::Relaxed);

        let drain = self.drain.latest();
        let duty = self.power.pwm.duty_x1000();
        let measured_power_w =
            (drain.peak_mv.max(0) as f32 * drain.peak_ma.max(0) as f32) / 1e6 * duty as f32 / 1000.0;

        let sender = self.command_fifo.sender();
        let mut activity = self.activity.lock().unwrap();
        activity.core.update_measurements(Measurements {
            temperature_c: temperature_x10 as f32 / 10.0,
            max_power_w: self.power.max_power_mw() as f32 / 1000.0,
            measured_power_w,
        });
        activity.tick(dt_ms, now, health, power_ok, &sender, self);
        let setpoint_w = activity.core.power_setpoint_w();
        drop(activity);

        if power_ok && !self.power.pwm.is_enabled() {
            self.power.pwm.set_enabled(true);
        }
        self.power.set_power_mw((setpoint_w * 1000.0).round() as u32);
    }

    pub fn status(&self) -> wire::DeviceStatus {
        let activity = self.activity.lock().unwrap().status();
        let health = derive_health(self.power.status(), self.head_status());
        let drain = self.drain.latest();
        let duty = self.power.pwm.duty_x1000();
        let power_mw =
            (drain.peak_mv.max(0) as u64 * drain.peak_ma.max(0) as u64 * duty as u64 / 1_000_000)
                as u32;
        wire::DeviceStatus {
            activity: activity as u32,
            health: health as u32,
            temperature_x10: self.last_temperature_x10.load(Ordering::Relaxed),
            power_mw,
            duty_x1000: duty,
            pdo_index: self.power.current_index() as u32,
            volts_mv: drain.peak_mv.max(0) as u32,
            amperes_ma: drain.peak_ma.max(0) as u32,
            max_power_mw: self.power.max_power_mw(),
            resistance_mohm: self.power.load_mohms(),
        }
    }

    pub fn get_head_params(&self) -> Result<HeadParams> {
        if self.head_status() != HeadStatus::Attached {
            return Err(Error::HeadNotConnected);
        }
        Ok(self.head_params.read())
    }

    pub fn set_head_params(&self, params: HeadParams) -> Result<()> {
        if self.head_status() != HeadStatus::Attached {
            return Err(Error::HeadNotConnected);
        }
        if !params.adrc.is_valid() {
            return Err(Error::BlobDecode("adrc params out of range".into()));
        }
        self.head_params.set(params);
        Ok(())
    }

    /// The stored profile list, or the factory default when nothing has
    /// ever been saved. Malformed entries are skipped rather than
    /// poisoning the whole list.
    pub fn load_profiles(&self) -> Vec<Profile> {
        let blob = self.profiles.get(self.kv.as_ref(), &BlobCodec);
        if blob.as_slice().is_empty() {
            return default_profiles();
        }
        let data = match wire::ProfilesData::decode(blob.as_slice()) {
            Ok(d) => d,
            Err(_) => return default_profiles(),
        };
        data.items.into_iter().filter_map(|p| Profile::try_from(p).ok()).collect()
    }

    /// The selected profile id, clamped to the stored list: -1 when the
    /// list is empty, the first profile's id when the stored selection no
    /// longer exists.
    pub fn selected_id(&self) -> i32 {
        let profiles = self.load_profiles();
        let stored = self.selected_profile_id.get(self.kv.as_ref(), &TrivialCodec);
        if profiles.is_empty() {
            return -1;
        }
        if profiles.iter().any(|p| p.id == stored) {
            return stored;
        }
        profiles[0].id
    }

    pub fn selected_profile(&self) -> Option<Profile> {
        let id = self.selected_id();
        self.load_profiles().into_iter().find(|p| p.id == id)
    }

    pub fn save_profiles(&self, selected_id: i32, profiles: &[Profile]) -> Result<()> {
        if profiles.len() > PROFILES_MAX_COUNT {
            return Err(Error::ProfileInvalid(format!("too many profiles: {}", profiles.len())));
        }
        for p in profiles {
            if p.segments.is_empty() || p.segments.len() > PROFILE_MAX_SEGMENTS {
                return Err(Error::ProfileInvalid(format!(
                    "profile {} has {} segments",
                    p.id,
                    p.segments.len()
                )));
            }
            if p.name.len() > PROFILE_NAME_MAX_LEN {
                return Err(Error::ProfileInvalid(format!("profile {} name too long", p.id)));
            }
        }
        // The blob is stored with no selection; the selection lives in its
        // own slot so flipping profiles doesn't rewrite the whole list.
        let data = wire::ProfilesData {
            selected_id: -1,
            items: profiles.iter().map(wire::Profile::from).collect(),
        };
        let mut bytes = Vec::new();
        data.encode(&mut bytes).map_err(|e| Error::BlobDecode(e.to_string()))?;
        let blob = BlobCodec
            .decode(&bytes)
            .ok_or_else(|| Error::ProfileInvalid("encoded profiles too large".into()))?;
        self.profiles.set(blob);
        self.selected_profile_id.set(selected_id);
        Ok(())
    }

    pub fn reset_profiles(&self) {
        let defaults = default_profiles();
        let selected = defaults.first().map(|p| p.id).unwrap_or(-1);
        let _ = self.save_profiles(selected, &defaults);
    }
}

impl ActivityHooks for App {
    fn adrc_params(&self) -> Option<AdrcParams> {
        if self.head_status() != HeadStatus::Attached {
            return None;
        }
        Some(self.head_params.read().adrc)
    }

    fn selected_profile(&self) -> Option<Profile> {
        App::selected_profile(self)
    }

    fn pairing_enable(&self, on: bool) {
        log::info!("ble pairing {}", if on { "enabled" } else { "disabled" });
        self.pairing_active.store(on, Ordering::Relaxed);
    }

    fn save_step_response_fit(&self, b0: f32, response_s: f32) {
        self.head_params.write(|p| {
            p.adrc.b0 = b0;
            p.adrc.response_s = response_s;
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct FakeEeprom {
        bytes: Mutex<Vec<u8>>,
    }
    impl FakeEeprom {
        pub(crate) fn blank() -> Self {
            FakeEeprom { bytes: Mutex::new(vec![0xFFu8; 256]) }
        }
    }
    impl EepromDevice for FakeEeprom {
        fn total_size(&self) -> usize {
            256
        }
        fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
            out.copy_from_slice(&self.bytes.lock().unwrap()[offset..offset + out.len()]);
            Ok(())
        }
        fn write_page(&self, offset: usize, data: &[u8]) -> Result<()> {
            self.bytes.lock().unwrap()[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    pub(crate) struct MemStore {
        data: Mutex<HashMap<(String, String), Vec<u8>>>,
    }
    impl MemStore {
        pub(crate) fn new() -> Self {
            MemStore { data: Mutex::new(HashMap::new()) }
        }
    }
    impl KeyValueStore for MemStore {
        fn read(&self, ns: &str, key: &str, out: &mut [u8]) -> Option<usize> {
            let data = self.data.lock().unwrap();
            let bytes = data.get(&(ns.to_string(), key.to_string()))?;
            let n = bytes.len().min(out.len());
            out[..n].copy_from_slice(&bytes[..n]);
            Some(n)
        }
        fn write(&self, ns: &str, key: &str, data: &[u8]) -> bool {
            self.data.lock().unwrap().insert((ns.to_string(), key.to_string()), data.to_vec());
            true
        }
    }

    pub(crate) fn test_app() -> App {
        App::new(
            Box::new(FakeEeprom::blank()),
            Box::new(MemStore::new()),
            AdrcParams { b0: 1.0, response_s: 8.0, n: 4.0, m: 3.0 },
        )
    }

    fn attach_head(app: &App) {
        let mut head = app.head.lock().unwrap();
        for i in 0..8u32 {
            head.tick(400, Tick(i * 20), app.eeprom.as_ref(), &app.head_params);
        }
        assert_eq!(head.status(), HeadStatus::Attached);
    }

    #[test]
    fn profiles_round_trip_through_save_and_load() {
        let app = test_app();
        let profiles = vec![Profile {
            id: 7,
            name: "p1".into(),
            segments: vec![Segment { target_c: 150, duration_s: 60 }],
        }];
        app.save_profiles(7, &profiles).unwrap();
        let loaded = app.load_profiles();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "p1");
        assert_eq!(app.selected_id(), 7);
    }

    #[test]
    fn unsaved_store_serves_factory_defaults() {
        let app = test_app();
        let loaded = app.load_profiles();
        assert!(!loaded.is_empty());
        assert_eq!(app.selected_id(), loaded[0].id);
        assert!(app.selected_profile().is_some());
    }

    #[test]
    fn stale_selection_falls_back_to_first_profile() {
        let app = test_app();
        let profiles = vec![
            Profile { id: 3, name: "a".into(), segments: vec![Segment { target_c: 100, duration_s: 10 }] },
            Profile { id: 4, name: "b".into(), segments: vec![Segment { target_c: 100, duration_s: 10 }] },
        ];
        app.save_profiles(99, &profiles).unwrap();
        assert_eq!(app.selected_id(), 3);
    }

    #[test]
    fn too_many_profiles_rejected() {
        let app = test_app();
        let profiles: Vec<Profile> = (0..(PROFILES_MAX_COUNT + 1) as i32)
            .map(|id| Profile {
                id,
                name: "p".into(),
                segments: vec![Segment { target_c: 100, duration_s: 10 }],
            })
            .collect();
        assert!(app.save_profiles(0, &profiles).is_err());
    }

    #[test]
    fn head_params_require_attached_head() {
        let app = test_app();
        assert!(matches!(app.get_head_params(), Err(Error::HeadNotConnected)));
        attach_head(&app);
        assert!(app.get_head_params().is_ok());
        let mut params = app.get_head_params().unwrap();
        params.adrc.b0 = 2.5;
        app.set_head_params(params).unwrap();
        assert_eq!(app.head_params.read().adrc.b0, 2.5);
    }

    #[test]
    fn step_response_fit_lands_in_head_params() {
        let app = test_app();
        ActivityHooks::save_step_response_fit(&app, 0.04, 31.0);
        let p = app.head_params.read();
        assert_eq!(p.adrc.b0, 0.04);
        assert_eq!(p.adrc.response_s, 31.0);
    }

    #[test]
    fn adrc_params_hook_mirrors_head_presence() {
        let app = test_app();
        assert!(ActivityHooks::adrc_params(&app).is_none());
        attach_head(&app);
        assert!(ActivityHooks::adrc_params(&app).is_some());
    }

    #[test]
    fn reflow_end_to_end_via_rpc() {
        struct NullPhy;
        impl crate::power_fsm::PdPhy for NullPhy {
            fn request_pdo(&self, _index: usize, _trigger_mv: Option<u32>) {}
        }
        let app = test_app();
        attach_head(&app);

        let phy = NullPhy;
        app.power.handle_event(
            crate::power_fsm::DpmEvent::SrcCapsReceived(vec![crate::units::Pdo::fixed(9000, 3000)]),
            &phy,
        );
        app.power.handle_event(crate::power_fsm::DpmEvent::SelectCapDone, &phy);
        app.power.update_load_mohms(6000, &phy);

        let profiles = vec![Profile {
            id: 1,
            name: "basic".into(),
            segments: vec![
                Segment { target_c: 150, duration_s: 60 },
                Segment { target_c: 220, duration_s: 60 },
                Segment { target_c: 220, duration_s: 60 },
            ],
        }];
        app.save_profiles(1, &profiles).unwrap();

        let resp = crate::rpc::dispatch(&app, crate::rpc::Request::RunReflow);
        assert!(matches!(resp, crate::rpc::Response::Ok));

        // Stand in for the consumer and tick threads: drain the FIFO,
        // then advance the 50ms loop, until the task reports completion.
        let rx = app.command_fifo.receiver();
        let mut completed = false;
        for _ in 0..=3601 {
            while let Ok(cmd) = rx.try_recv() {
                if cmd == (crate::command::Command::Stop { success: true }) {
                    completed = true;
                }
                app.activity.lock().unwrap().handle_command(cmd, Tick(0), &app);
            }
            if completed {
                break;
            }
            app.heater_tick(50, Tick(0), 1200);
        }
        assert!(completed);
        let activity = app.activity.lock().unwrap();
        assert_eq!(activity.status(), crate::activity_fsm::ActivityStatus::Idle);
        assert!(!activity.core.is_task_active());
        assert_eq!(activity.core.power_setpoint_w(), 0.0);
    }

    #[test]
    fn status_reflects_not_ready_before_attach() {
        let app = test_app();
        let status = app.status();
        assert_eq!(status.health, crate::heater_core::Health::DevNotReady as u32);
        assert_eq!(status.activity, crate::activity_fsm::ActivityStatus::Init as u32);
    }
}
