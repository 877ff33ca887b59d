//! DPM-side power coupling, sitting above the USB-PD protocol engine.
//!
//! `PowerFsm` owns the PWM and the PDO selection inputs. It consumes the
//! handful of lifecycle notifications the PD engine surfaces (`DpmEvent`)
//! and talks back to it only through `PdPhy`; the PE/PRL/TC state machines
//! and the wire-level driver beneath them are external collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::config::APDO_VOLTAGE_DEADBAND_MV;
use crate::profile_selector;
use crate::pwm::PwmFsm;
use crate::units::{Pdo, PdoVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStatus {
    PwrOff,
    PwrOK,
    PwrTransition,
    PwrRejected,
    PwrFailure,
}

/// Lifecycle events surfaced by the PD protocol engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DpmEvent {
    Startup,
    SrcCapsReceived(Vec<Pdo>),
    SelectCapDone,
    Alert,
    SnkReady,
    HandshakeDone,
    NewPowerLevelRejected,
    CableDetached,
    TransitToDefault,
    SysTick,
}

/// Boundary to the PD protocol engine: DPM requests a PDO by index,
/// optionally pinning an APDO's requested voltage.
pub trait PdPhy: Send + Sync {
    fn request_pdo(&self, index: usize, trigger_mv: Option<u32>);
}

struct State {
    pdos: Vec<Pdo>,
    current_index: usize,
    status: PowerStatus,
    target_power_mw: u32,
    /// Voltage of the last APDO request actually sent; small adjustments
    /// within the deadband update this without re-entering PwrTransition.
    last_requested_apdo_mv: Option<u32>,
}

pub struct PowerFsm {
    state: Mutex<State>,
    last_load_mohms: AtomicU32,
    pub pwm: PwmFsm,
}

impl PowerFsm {
    pub fn new() -> Self {
        PowerFsm {
            state: Mutex::new(State {
                pdos: Vec::new(),
                current_index: 0,
                status: PowerStatus::PwrOff,
                target_power_mw: 0,
                last_requested_apdo_mv: None,
            }),
            last_load_mohms: AtomicU32::new(0),
            pwm: PwmFsm::new(),
        }
    }

    pub fn status(&self) -> PowerStatus {
        self.state.lock().unwrap().status
    }

    pub fn current_index(&self) -> usize {
        self.state.lock().unwrap().current_index
    }

    pub fn load_mohms(&self) -> u32 {
        self.last_load_mohms.load(Ordering::Relaxed)
    }

    /// What the currently selected PDO can deliver into the last measured
    /// load, in mW. Zero until a valid load measurement exists.
    pub fn max_power_mw(&self) -> u32 {
        let s = self.state.lock().unwrap();
        let load = self.last_load_mohms.load(Ordering::Relaxed);
        s.pdos.get(s.current_index).map(|p| p.pmax_mw(load)).unwrap_or(0)
    }

    /// Sets the desired heater power and recomputes the PWM duty against
    /// the selected PDO's capability at the last known load resistance.
    pub fn set_power_mw(&self, target_mw: u32) {
        let mut s = self.state.lock().unwrap();
        s.target_power_mw = target_mw;
        let load = self.last_load_mohms.load(Ordering::Relaxed);
        let pmax = s.pdos.get(s.current_index).map(|p| p.pmax_mw(load)).unwrap_or(0);
        let duty = if pmax == 0 {
            0
        } else {
            (((1000u64 * target_mw as u64 + pmax as u64 / 2) / pmax as u64) as u32).min(1000)
        };
        self.pwm.set_duty_x1000(duty);
    }

    pub fn target_power_mw(&self) -> u32 {
        self.state.lock().unwrap().target_power_mw
    }

    /// Feeds a freshly measured load resistance (from a valid PWM-cycle
    /// drain measurement) into the selector and switches PDO if warranted.
    pub fn update_load_mohms(&self, load_mohms: u32, phy: &dyn PdPhy) {
        self.last_load_mohms.store(load_mohms, Ordering::Relaxed);
        let mut s = self.state.lock().unwrap();
        if s.status != PowerStatus::PwrOK || s.pdos.is_empty() {
            return;
        }
        self.consult_selector(&mut s, load_mohms, phy);
    }

    fn consult_selector(&self, s: &mut State, load_mohms: u32, phy: &dyn PdPhy) {
        let better =
            profile_selector::select(&s.pdos, s.current_index, load_mohms, s.target_power_mw);
        if better != s.current_index {
            log::info!(
                "pdo switch: {} -> {} (load {}mOhm, target {}mW)",
                s.current_index,
                better,
                load_mohms,
                s.target_power_mw
            );
            self.request_pdo_switch(s, better, phy);
        }
    }

    fn request_pdo_switch(&self, s: &mut State, index: usize, phy: &dyn PdPhy) {
        let pdo = &s.pdos[index];
        let trigger_mv = match pdo.variant {
            PdoVariant::Fixed => Some(pdo.mv_min.0),
            v if v.is_apdo() => Some(apdo_request_mv(pdo, s.target_power_mw)),
            _ => None,
        };

        if let (Some(mv), Some(last)) = (trigger_mv, s.last_requested_apdo_mv) {
            if pdo.variant.is_apdo()
                && index == s.current_index
                && mv.abs_diff(last) <= APDO_VOLTAGE_DEADBAND_MV
            {
                // Within the deadband: refresh the request but stay PwrOK.
                s.last_requested_apdo_mv = Some(mv);
                phy.request_pdo(index, trigger_mv);
                return;
            }
        }

        s.current_index = index;
        s.status = PowerStatus::PwrTransition;
        s.last_requested_apdo_mv = if pdo.variant.is_apdo() { trigger_mv } else { None };
        phy.request_pdo(index, trigger_mv);
    }

    pub fn handle_event(&self, event: DpmEvent, phy: &dyn PdPhy) {
        let mut s = self.state.lock().unwrap();
        match event {
            DpmEvent::Startup => s.status = PowerStatus::PwrOff,
            DpmEvent::SrcCapsReceived(pdos) => {
                log::info!("source caps received: {} slots", pdos.len());
                s.pdos = pdos;
                s.last_requested_apdo_mv = None;
                // Contract always restarts from the mandatory 5V slot; the
                // selector upgrades later once a load measurement exists.
                s.current_index = 0;
                if let Some(first_mv_min) = s.pdos.first().map(|p| p.mv_min.0) {
                    s.status = PowerStatus::PwrTransition;
                    phy.request_pdo(0, Some(first_mv_min));
                }
            }
            DpmEvent::SelectCapDone | DpmEvent::SnkReady | DpmEvent::HandshakeDone => {
                s.status = PowerStatus::PwrOK;
            }
            DpmEvent::Alert => {
                log::warn!("pd alert received");
            }
            DpmEvent::NewPowerLevelRejected => {
                log::warn!("pd request rejected, falling back to 5V slot");
                s.status = PowerStatus::PwrRejected;
                s.current_index = 0;
                s.last_requested_apdo_mv = None;
                if let Some(first) = s.pdos.first() {
                    phy.request_pdo(0, Some(first.mv_min.0));
                }
            }
            DpmEvent::CableDetached => {
                log::warn!("cable detached");
                s.status = PowerStatus::PwrOff;
                drop(s);
                self.pwm.set_enabled(false);
            }
            DpmEvent::TransitToDefault => {
                s.status = PowerStatus::PwrOff;
            }
            DpmEvent::SysTick => {
                if s.status == PowerStatus::PwrOK && !s.pdos.is_empty() {
                    let load = self.last_load_mohms.load(Ordering::Relaxed);
                    if load > 0 {
                        self.consult_selector(&mut s, load, phy);
                    }
                }
            }
        }
    }
}

/// The lowest in-range APDO voltage that still clears the target power at
/// the PDO's own current ceiling.
fn apdo_request_mv(pdo: &Pdo, target_power_mw: u32) -> u32 {
    if target_power_mw == 0 {
        return pdo.mv_min.0;
    }
    let needed_mv = ((target_power_mw as u64 * 1000) / pdo.ma_max.0.max(1) as u64) as u32;
    needed_mv.clamp(pdo.mv_min.0, pdo.mv_max.0)
}

impl Default for PowerFsm {
    fn default() -> Self {
        Self::new()
    }
}
