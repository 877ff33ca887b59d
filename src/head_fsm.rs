//! Head attachment detection and EEPROM-backed parameter loading.
//!
//! The removable heater head carries its own calibration EEPROM. Presence
//! is inferred from the sensor divider voltage: a floating divider means
//! no head, a debounced in-range reading means one is seated. Parameters
//! live in a shared `DataGuard` so RPC writes never block this state
//! machine; each tick flushes a freshly committed snapshot back to the
//! head's EEPROM.

use crate::adrc::AdrcParams;
use crate::config::{
    HEAD_ATTACH_DEBOUNCE_MS, HEAD_ERROR_RECOVERY_MS, HEAD_FLOATING_MV, HEAD_FSM_TICK_MS,
    HEAD_SHORTED_MV,
};
use crate::data_guard::{DataGuard, SnapshotReader};
use crate::eeprom::{self, EepromDevice};
use crate::time::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterType {
    Mch,
    Pcb,
}

/// Which sensing strategy the head uses.
pub const SENSOR_KIND_RTD: u32 = 0;
pub const SENSOR_KIND_TCR: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorParams {
    pub kind: u32,
    pub gain_q16: i32,
    pub offset: i32,
    pub r_base: i32,
    pub t_ref_x10: i32,
    pub inv_gain_q16: i32,
}

impl Default for SensorParams {
    fn default() -> Self {
        SensorParams {
            kind: SENSOR_KIND_RTD,
            gain_q16: 1 << 16,
            offset: 0,
            r_base: 0,
            t_ref_x10: 0,
            inv_gain_q16: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadParams {
    pub adrc: AdrcParams,
    pub sensor: SensorParams,
}

impl Default for HeadParams {
    fn default() -> Self {
        HeadParams {
            adrc: AdrcParams { b0: 1.0, response_s: 8.0, n: 4.0, m: 3.0 },
            sensor: SensorParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStatus {
    Detached,
    Initializing,
    Attached,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Detached,
    Initializing { debounce_ticks: u32 },
    Attached { heater_type: HeaterType },
    Error { clean_since: Option<Tick> },
}

pub struct HeadFsm {
    state: State,
    flush_reader: SnapshotReader,
}

impl HeadFsm {
    pub fn new() -> Self {
        HeadFsm { state: State::Detached, flush_reader: SnapshotReader::new() }
    }

    pub fn status(&self) -> HeadStatus {
        match self.state {
            State::Detached => HeadStatus::Detached,
            State::Initializing { .. } => HeadStatus::Initializing,
            State::Attached { .. } => HeadStatus::Attached,
            State::Error { .. } => HeadStatus::Error,
        }
    }

    pub fn heater_type(&self) -> Option<HeaterType> {
        match self.state {
            State::Attached { heater_type } => Some(heater_type),
            _ => None,
        }
    }

    /// Advances the FSM given the current sensor divider reading, in mV.
    /// `device` is consulted for the EEPROM load at attach and for flushes
    /// of freshly committed parameter snapshots while attached.
    pub fn tick(
        &mut self,
        sensor_mv: i32,
        now: Tick,
        device: &dyn EepromDevice,
        params: &DataGuard<HeadParams>,
    ) {
        self.state = match self.state {
            State::Detached => {
                if sensor_mv < HEAD_FLOATING_MV {
                    State::Initializing { debounce_ticks: 0 }
                } else {
                    State::Detached
                }
            }
            State::Initializing { debounce_ticks } => {
                if sensor_mv > HEAD_FLOATING_MV {
                    log::debug!("head: lost contact during initialization");
                    State::Detached
                } else if (debounce_ticks + 1) * HEAD_FSM_TICK_MS >= HEAD_ATTACH_DEBOUNCE_MS {
                    let heater_type =
                        if sensor_mv < HEAD_SHORTED_MV { HeaterType::Mch } else { HeaterType::Pcb };
                    match load_params(device) {
                        Ok(loaded) => {
                            params.set(loaded);
                            // the version just produced is our own; absorb
                            // it so the flusher doesn't echo the read back.
                            let _ = self.flush_reader.snapshot_changed(params);
                            log::info!("head attached: {heater_type:?}");
                            State::Attached { heater_type }
                        }
                        Err(e) => {
                            log::error!("head eeprom load failed: {e}");
                            State::Error { clean_since: None }
                        }
                    }
                } else {
                    State::Initializing { debounce_ticks: debounce_ticks + 1 }
                }
            }
            State::Attached { heater_type } => {
                if sensor_mv > HEAD_FLOATING_MV {
                    log::info!("head detached");
                    State::Detached
                } else {
                    State::Attached { heater_type }
                }
            }
            State::Error { clean_since } => {
                if sensor_mv < HEAD_FLOATING_MV {
                    match clean_since {
                        Some(t) if crate::time::expired(t, HEAD_ERROR_RECOVERY_MS, now) => {
                            log::info!("head error recovered");
                            State::Detached
                        }
                        Some(t) => State::Error { clean_since: Some(t) },
                        None => State::Error { clean_since: Some(now) },
                    }
                } else {
                    State::Error { clean_since: None }
                }
            }
        };

        if matches!(self.state, State::Attached { .. }) {
            if let Some(snapshot) = self.flush_reader.snapshot_changed(params) {
                let bytes = encode_params(&snapshot);
                match eeprom::write_payload(device, &bytes) {
                    Ok(pages) => log::debug!("head params flushed ({pages} pages)"),
                    Err(e) => {
                        log::error!("head params flush failed: {e}");
                        // retry the same snapshot next tick.
                        self.flush_reader.invalidate();
                    }
                }
            }
        }
    }
}

impl Default for HeadFsm {
    fn default() -> Self {
        Self::new()
    }
}

fn load_params(device: &dyn EepromDevice) -> crate::error::Result<HeadParams> {
    match eeprom::read_payload(device)? {
        None => Ok(HeadParams::default()),
        Some(bytes) => Ok(decode_params(&bytes).unwrap_or_default()),
    }
}

const PARAMS_LEN: usize = 40;

// Fixed little-endian layout: the EEPROM blob is this crate's own format,
// independent of the protobuf wire types used by the RPC surface.
fn encode_params(params: &HeadParams) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PARAMS_LEN);
    buf.extend_from_slice(&params.adrc.b0.to_le_bytes());
    buf.extend_from_slice(&params.adrc.response_s.to_le_bytes());
    buf.extend_from_slice(&params.adrc.n.to_le_bytes());
    buf.extend_from_slice(&params.adrc.m.to_le_bytes());
    buf.extend_from_slice(&params.sensor.kind.to_le_bytes());
    buf.extend_from_slice(&params.sensor.gain_q16.to_le_bytes());
    buf.extend_from_slice(&params.sensor.offset.to_le_bytes());
    buf.extend_from_slice(&params.sensor.r_base.to_le_bytes());
    buf.extend_from_slice(&params.sensor.t_ref_x10.to_le_bytes());
    buf.extend_from_slice(&params.sensor.inv_gain_q16.to_le_bytes());
    buf
}

fn decode_params(bytes: &[u8]) -> Option<HeadParams> {
    if bytes.len() < PARAMS_LEN {
        return None;
    }
    let f = |i: usize| f32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
    let i = |i: usize| i32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
    Some(HeadParams {
        adrc: AdrcParams { b0: f(0), response_s: f(4), n: f(8), m: f(12) },
        sensor: SensorParams {
            kind: i(16) as u32,
            gain_q16: i(20),
            offset: i(24),
            r_base: i(28),
            t_ref_x10: i(32),
            inv_gain_q16: i(36),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeEeprom {
        bytes: RefCell<Vec<u8>>,
        writes: RefCell<usize>,
    }
    impl FakeEeprom {
        fn blank() -> Self {
            FakeEeprom { bytes: RefCell::new(vec![0xFF; 256]), writes: RefCell::new(0) }
        }
    }
    impl EepromDevice for FakeEeprom {
        fn total_size(&self) -> usize {
            256
        }
        fn read(&self, offset: usize, out: &mut [u8]) -> crate::error::Result<()> {
            out.copy_from_slice(&self.bytes.borrow()[offset..offset + out.len()]);
            Ok(())
        }
        fn write_page(&self, offset: usize, data: &[u8]) -> crate::error::Result<()> {
            *self.writes.borrow_mut() += 1;
            self.bytes.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    fn attach(fsm: &mut HeadFsm, dev: &FakeEeprom, params: &DataGuard<HeadParams>) {
        for i in 0..8u32 {
            fsm.tick(400, Tick(i * 20), dev, params);
        }
        assert_eq!(fsm.status(), HeadStatus::Attached);
    }

    #[test]
    fn hotplug_debounce_trace() {
        let mut fsm = HeadFsm::new();
        let dev = FakeEeprom::blank();
        let params = DataGuard::new(HeadParams::default());
        let readings = [900, 900, 400, 400, 400, 400, 400, 400];
        let mut statuses = Vec::new();
        for (i, mv) in readings.iter().enumerate() {
            fsm.tick(*mv, Tick((i as u32) * 20), &dev, &params);
            statuses.push(fsm.status());
        }
        assert_eq!(&statuses[..2], &[HeadStatus::Detached, HeadStatus::Detached]);
        assert_eq!(statuses[2], HeadStatus::Initializing);
        assert_eq!(statuses[6], HeadStatus::Initializing);
        assert_eq!(statuses[7], HeadStatus::Attached);
    }

    #[test]
    fn shorted_sensor_detects_mch_heater() {
        let mut fsm = HeadFsm::new();
        let dev = FakeEeprom::blank();
        let params = DataGuard::new(HeadParams::default());
        for i in 0..8u32 {
            fsm.tick(100, Tick(i * 20), &dev, &params);
        }
        assert_eq!(fsm.heater_type(), Some(HeaterType::Mch));
    }

    #[test]
    fn blank_eeprom_attaches_with_defaults() {
        let mut fsm = HeadFsm::new();
        let dev = FakeEeprom::blank();
        let params = DataGuard::new(HeadParams {
            adrc: AdrcParams { b0: 9.0, response_s: 9.0, n: 9.0, m: 9.0 },
            sensor: SensorParams::default(),
        });
        attach(&mut fsm, &dev, &params);
        assert_eq!(params.read(), HeadParams::default());
    }

    #[test]
    fn attach_load_is_not_echoed_back_to_eeprom() {
        let mut fsm = HeadFsm::new();
        let dev = FakeEeprom::blank();
        let params = DataGuard::new(HeadParams::default());
        attach(&mut fsm, &dev, &params);
        let writes_after_attach = *dev.writes.borrow();
        for i in 8..20u32 {
            fsm.tick(400, Tick(i * 20), &dev, &params);
        }
        assert_eq!(*dev.writes.borrow(), writes_after_attach);
    }

    #[test]
    fn rpc_write_round_trips_through_eeprom() {
        let mut fsm = HeadFsm::new();
        let dev = FakeEeprom::blank();
        let params = DataGuard::new(HeadParams::default());
        attach(&mut fsm, &dev, &params);

        let mut updated = HeadParams::default();
        updated.adrc.b0 = 3.5;
        params.set(updated);
        fsm.tick(400, Tick(200), &dev, &params);

        let stored = eeprom::read_payload(&dev).unwrap().unwrap();
        assert_eq!(decode_params(&stored).unwrap(), updated);
    }

    #[test]
    fn eeprom_failure_moves_to_error() {
        struct FailingEeprom;
        impl EepromDevice for FailingEeprom {
            fn total_size(&self) -> usize {
                256
            }
            fn read(&self, _offset: usize, _out: &mut [u8]) -> crate::error::Result<()> {
                Err(crate::error::Error::EepromIo("bus fault".into()))
            }
            fn write_page(&self, _offset: usize, _data: &[u8]) -> crate::error::Result<()> {
                Ok(())
            }
        }
        let mut fsm = HeadFsm::new();
        let params = DataGuard::new(HeadParams::default());
        for i in 0..10u32 {
            fsm.tick(400, Tick(i * 20), &FailingEeprom, &params);
        }
        assert_eq!(fsm.status(), HeadStatus::Error);
    }

    #[test]
    fn error_recovers_after_clean_window() {
        let mut fsm = HeadFsm::new();
        let dev = FakeEeprom::blank();
        let params = DataGuard::new(HeadParams::default());
        fsm.state = State::Error { clean_since: None };
        let ticks = HEAD_ERROR_RECOVERY_MS / 20;
        for i in 0..=ticks {
            fsm.tick(400, Tick(i * 20), &dev, &params);
        }
        assert_eq!(fsm.status(), HeadStatus::Detached);
    }
}
