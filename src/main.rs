//! Binary entry point: builds the `App` and starts its tick threads.
//!
//! The I2C, PD-engine and BLE backends are external hardware drivers; the
//! in-memory stand-ins below exist so this binary links and runs
//! end-to-end on a host, with every control-loop code path live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reflow_heater_core::adrc::AdrcParams;
use reflow_heater_core::app::App;
use reflow_heater_core::config::{
    HEAD_FSM_TICK_MS, HEATER_CORE_TICK_MS, POWER_FSM_SYS_TICK_MS, PREFERENCE_WRITER_PERIOD_MS,
};
use reflow_heater_core::drain_tracker::Ina226Registers;
use reflow_heater_core::eeprom::EepromDevice;
use reflow_heater_core::error::Result;
use reflow_heater_core::power_fsm::{DpmEvent, PdPhy};
use reflow_heater_core::preferences::{KeyValueStore, PreferenceWriter, RegisteredPreference};
use reflow_heater_core::pwm::HeaterLoad;
use reflow_heater_core::stack_monitor::StackMonitor;
use reflow_heater_core::time::Clock;
use reflow_heater_core::units::{Pdo, PdoVariant};

struct InMemoryEeprom {
    bytes: Mutex<Vec<u8>>,
}

impl EepromDevice for InMemoryEeprom {
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

struct InMemoryKv {
    data: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl KeyValueStore for InMemoryKv {
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

struct NoopHeaterLoad {
    on: AtomicBool,
}

impl HeaterLoad for NoopHeaterLoad {
    fn set_on(&self, on: bool) {
        self.on.store(on, Ordering::Relaxed);
    }
}

/// Acknowledges every request shortly after it is made, as if the charger
/// accepted. The acknowledgement is delivered from its own thread because
/// a real PD engine reports `SelectCapDone` asynchronously too.
struct LoopbackPdPhy {
    app: Mutex<Option<Arc<App>>>,
}

impl PdPhy for LoopbackPdPhy {
    fn request_pdo(&self, index: usize, trigger_mv: Option<u32>) {
        log::info!("pd phy stub: requesting pdo {index} ({trigger_mv:?}mV)");
        let Some(app) = self.app.lock().unwrap().clone() else { return };
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            app.power.handle_event(DpmEvent::SelectCapDone, &NullPhy);
        });
    }
}

struct NullPhy;
impl PdPhy for NullPhy {
    fn request_pdo(&self, _index: usize, _trigger_mv: Option<u32>) {}
}

/// Fixed-register stand-in for an INA226 that always reports a safe,
/// valid reading; a real board replaces this with an I2C-backed driver.
struct StubIna226 {
    registers: Mutex<HashMap<u8, u16>>,
}

impl StubIna226 {
    fn new() -> Self {
        let mut registers = HashMap::new();
        registers.insert(0xFE, 0x5449); // manufacturer id
        registers.insert(0xFF, 0x2260); // die id
        registers.insert(0x02, 7200); // vbus raw (9V at 1.25mV LSB)
        registers.insert(0x04, 1500); // current raw
        StubIna226 { registers: Mutex::new(registers) }
    }
}

impl Ina226Registers for StubIna226 {
    fn read_register(&self, reg: u8) -> Result<u16> {
        Ok(*self.registers.lock().unwrap().get(&reg).unwrap_or(&0))
    }
    fn write_register(&self, reg: u8, value: u16) -> Result<()> {
        self.registers.lock().unwrap().insert(reg, value);
        Ok(())
    }
}

fn main() {
    env_logger::init();

    let app = Arc::new(App::new(
        Box::new(InMemoryEeprom { bytes: Mutex::new(vec![0xFFu8; 256]) }),
        Box::new(InMemoryKv { data: Mutex::new(HashMap::new()) }),
        AdrcParams { b0: 1.0, response_s: 8.0, n: 4.0, m: 3.0 },
    ));
    let clock = Arc::new(Clock::new());
    let monitor = Arc::new(StackMonitor::new());

    let ina226 = Arc::new(StubIna226::new());
    if let Err(e) = reflow_heater_core::drain_tracker::init(ina226.as_ref()) {
        log::error!("ina226 init failed: {e}");
    }

    let pd_phy = Arc::new(LoopbackPdPhy { app: Mutex::new(None) });
    *pd_phy.app.lock().unwrap() = Some(app.clone());
    app.power.handle_event(
        DpmEvent::SrcCapsReceived(vec![
            Pdo::fixed(5000, 3000),
            Pdo::fixed(9000, 3000),
            Pdo::new(PdoVariant::PpsApdo, 5000, 11000, 5000),
        ]),
        pd_phy.as_ref(),
    );

    std::thread::Builder::new()
        .name("pwm".into())
        .spawn({
            let app = app.clone();
            let ina226 = ina226.clone();
            let pd_phy = pd_phy.clone();
            let heater_load = NoopHeaterLoad { on: AtomicBool::new(false) };
            let clock = clock.clone();
            let monitor = monitor.clone();
            move || loop {
                monitor.heartbeat("pwm", clock.now());
                app.power.pwm.tick(&heater_load, |is_final| {
                    if let Err(e) = app.drain.collect_data(ina226.as_ref()) {
                        log::debug!("drain sample failed: {e}");
                    }
                    if is_final {
                        let measurement = app.drain.process_collected_data();
                        if measurement.load_valid {
                            if let Some(load) = app.drain.load_mohms() {
                                app.power.update_load_mohms(load, pd_phy.as_ref());
                            }
                        }
                    }
                });
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("spawn pwm thread");

    std::thread::Builder::new()
        .name("head".into())
        .spawn({
            let app = app.clone();
            let clock = clock.clone();
            let monitor = monitor.clone();
            move || loop {
                monitor.heartbeat("head", clock.now());
                let sensor_mv = 400; // real board samples the head-detect ADC channel here.
                app.head.lock().unwrap().tick(sensor_mv, clock.now(), app.eeprom(), &app.head_params);
                std::thread::sleep(Duration::from_millis(HEAD_FSM_TICK_MS as u64));
            }
        })
        .expect("spawn head thread");

    std::thread::Builder::new()
        .name("power".into())
        .spawn({
            let app = app.clone();
            let pd_phy = pd_phy.clone();
            let clock = clock.clone();
            let monitor = monitor.clone();
            move || loop {
                monitor.heartbeat("power", clock.now());
                app.power.handle_event(DpmEvent::SysTick, pd_phy.as_ref());
                std::thread::sleep(Duration::from_millis(POWER_FSM_SYS_TICK_MS as u64));
            }
        })
        .expect("spawn power thread");

    std::thread::Builder::new()
        .name("activity".into())
        .spawn({
            let app = app.clone();
            let clock = clock.clone();
            move || {
                let rx = app.command_fifo.receiver();
                loop {
                    let Ok(cmd) = rx.recv() else { break };
                    let mut activity = app.activity.lock().unwrap();
                    activity.handle_command(cmd, clock.now(), app.as_ref());
                }
            }
        })
        .expect("spawn activity thread");

    std::thread::Builder::new()
        .name("heater-core".into())
        .spawn({
            let app = app.clone();
            let clock = clock.clone();
            let monitor = monitor.clone();
            move || loop {
                monitor.heartbeat("heater-core", clock.now());
                let sensor_mv = 1200; // real board samples the heater RTD/TCR ADC channel here.
                app.heater_tick(HEATER_CORE_TICK_MS as i32, clock.now(), sensor_mv);
                std::thread::sleep(Duration::from_millis(HEATER_CORE_TICK_MS as u64));
            }
        })
        .expect("spawn heater-core thread");

    std::thread::Builder::new()
        .name("preferences".into())
        .spawn({
            let app = app.clone();
            let clock = clock.clone();
            let monitor = monitor.clone();
            move || loop {
                monitor.heartbeat("preferences", clock.now());
                let profiles_slot = RegisteredPreference {
                    preference: app.profiles_pref(),
                    codec: &reflow_heater_core::app::BlobCodec,
                };
                let selected_slot = RegisteredPreference {
                    preference: app.selected_profile_pref(),
                    codec: &reflow_heater_core::preferences::TrivialCodec,
                };
                let mut writer = PreferenceWriter::new(app.kv());
                writer.register(&profiles_slot);
                writer.register(&selected_slot);
                writer.tick();
                std::thread::sleep(Duration::from_millis(PREFERENCE_WRITER_PERIOD_MS as u64));
            }
        })
        .expect("spawn preferences thread");

    log::info!("reflow-heater core started");
    loop {
        std::thread::sleep(Duration::from_secs(60));
        monitor.report(clock.now());
    }
}
