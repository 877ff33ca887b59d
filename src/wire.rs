//! Generated protobuf bridge.
//!
//! `prost-build` generates the message types at build time from
//! `proto/heater.proto`; this module owns the `From`/`TryFrom` bridge so
//! the rest of the crate works with its own domain types and never
//! imports `prost` directly.

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/heater.rs"));

use crate::adrc::AdrcParams as NativeAdrcParams;
use crate::error::{Error, Result};
use crate::head_fsm::{HeadParams as NativeHeadParams, SensorParams as NativeSensorParams};
use crate::sparse_history::HistoryPoint;
use crate::timeline::{Profile as NativeProfile, Segment as NativeSegment};

impl From<NativeSegment> for Segment {
    fn from(s: NativeSegment) -> Self {
        Segment { target_c: s.target_c, duration_s: s.duration_s }
    }
}

impl From<Segment> for NativeSegment {
    fn from(s: Segment) -> Self {
        NativeSegment { target_c: s.target_c, duration_s: s.duration_s }
    }
}

impl From<&NativeProfile> for Profile {
    fn from(p: &NativeProfile) -> Self {
        Profile {
            id: p.id,
            name: p.name.clone(),
            segments: p.segments.iter().map(|s| Segment::from(*s)).collect(),
        }
    }
}

impl TryFrom<Profile> for NativeProfile {
    type Error = Error;

    fn try_from(p: Profile) -> Result<Self> {
        if p.segments.is_empty() {
            return Err(Error::ProfileInvalid("profile has no segments".into()));
        }
        Ok(NativeProfile {
            id: p.id,
            name: p.name,
            segments: p.segments.into_iter().map(NativeSegment::from).collect(),
        })
    }
}

impl From<NativeAdrcParams> for AdrcParams {
    fn from(p: NativeAdrcParams) -> Self {
        AdrcParams { b0: p.b0, response_s: p.response_s, n: p.n, m: p.m }
    }
}

impl TryFrom<AdrcParams> for NativeAdrcParams {
    type Error = Error;

    fn try_from(p: AdrcParams) -> Result<Self> {
        let params = NativeAdrcParams { b0: p.b0, response_s: p.response_s, n: p.n, m: p.m };
        if !params.is_valid() {
            return Err(Error::ProfileInvalid("adrc params out of range".into()));
        }
        Ok(params)
    }
}

impl From<NativeSensorParams> for SensorParams {
    fn from(p: NativeSensorParams) -> Self {
        SensorParams {
            kind: p.kind,
            gain_q16: p.gain_q16,
            offset: p.offset,
            r_base: p.r_base,
            t_ref_x10: p.t_ref_x10,
            inv_gain_q16: p.inv_gain_q16,
        }
    }
}

impl From<SensorParams> for NativeSensorParams {
    fn from(p: SensorParams) -> Self {
        NativeSensorParams {
            kind: p.kind,
            gain_q16: p.gain_q16,
            offset: p.offset,
            r_base: p.r_base,
            t_ref_x10: p.t_ref_x10,
            inv_gain_q16: p.inv_gain_q16,
        }
    }
}

impl From<NativeHeadParams> for HeadParams {
    fn from(p: NativeHeadParams) -> Self {
        HeadParams { adrc: Some(p.adrc.into()), sensor: Some(p.sensor.into()) }
    }
}

impl TryFrom<HeadParams> for NativeHeadParams {
    type Error = Error;

    fn try_from(p: HeadParams) -> Result<Self> {
        let adrc = p.adrc.ok_or_else(|| Error::BlobDecode("head params missing adrc".into()))?;
        Ok(NativeHeadParams {
            adrc: NativeAdrcParams::try_from(adrc)?,
            sensor: p.sensor.unwrap_or_default().into(),
        })
    }
}

/// Packs history points as interleaved `(x, y)` pairs, matching
/// `HistoryChunk.data`'s flattened `int64` layout.
pub fn history_chunk_from_points(history_type: i32, version: u32, points: &[HistoryPoint]) -> HistoryChunk {
    let mut data = Vec::with_capacity(points.len() * 2);
    for p in points {
        data.push(p.x as i64);
        data.push(p.y as i64);
    }
    HistoryChunk { history_type, version, data }
}

pub fn points_from_history_chunk(chunk: &HistoryChunk) -> Vec<HistoryPoint> {
    chunk
        .data
        .chunks_exact(2)
        .map(|pair| HistoryPoint { x: pair[0] as u32, y: pair[1] as i32 })
        .collect()
}
