//! Delta-encoded, bounded history recorder.
//!
//! Points are appended only when the trajectory has meaningfully moved;
//! otherwise the last point is overwritten in place so slow-moving
//! stretches don't blow out the point budget. Readers identify their view
//! by version: a mismatch means the history was restarted for a new task
//! and the client must refetch from the beginning.

use std::sync::Mutex;

use crate::config::HISTORY_CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPoint {
    pub x: u32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryParams {
    pub x_threshold: u32,
    pub y_threshold: i32,
    pub x_scale_after: u32,
}

impl Default for HistoryParams {
    fn default() -> Self {
        HistoryParams { x_threshold: 1, y_threshold: 1, x_scale_after: 1 }
    }
}

/// One `read_chunk` result: the task the data belongs to, the history
/// version it was read at, and up to `HISTORY_CHUNK_SIZE` points.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryChunk {
    pub task_id: i32,
    pub version: u32,
    pub points: Vec<HistoryPoint>,
}

struct State {
    points: Vec<HistoryPoint>,
    params: HistoryParams,
    task_id: i32,
    version: u32,
}

pub struct SparseHistory {
    state: Mutex<State>,
}

impl SparseHistory {
    pub fn new() -> Self {
        SparseHistory {
            state: Mutex::new(State {
                points: Vec::new(),
                params: HistoryParams::default(),
                task_id: 0,
                version: 0,
            }),
        }
    }

    /// Clears all points, sets fresh delta parameters and the owning task
    /// id, and bumps the client-visible version so readers know to restart
    /// from zero.
    pub fn reset(&self, params: HistoryParams, task_id: i32) {
        let mut s = self.state.lock().unwrap();
        s.points.clear();
        s.params = params;
        s.task_id = task_id;
        s.version = s.version.wrapping_add(1);
    }

    pub fn version(&self) -> u32 {
        self.state.lock().unwrap().version
    }

    /// Appends a point, collapsing it into the previous point in place
    /// when the trajectory hasn't "landed" yet.
    pub fn push(&self, x: u32, y: i32) {
        let mut s = self.state.lock().unwrap();
        let point = HistoryPoint { x, y };
        let params = s.params;
        let n = s.points.len();
        if n == 0 {
            s.points.push(point);
            return;
        }
        if s.points[n - 1] == point {
            return; // duplicate
        }
        if n < 2 {
            s.points.push(point);
            return;
        }
        let prev = s.points[n - 2];
        let last = s.points[n - 1];
        let landed = (last.y - prev.y).unsigned_abs() as i64 >= params.y_threshold as i64
            || (last.x - prev.x) >= params.x_threshold.max(last.x / params.x_scale_after.max(1));
        if landed {
            s.points.push(point);
        } else {
            s.points[n - 1] = point;
        }
    }

    /// Returns up to `HISTORY_CHUNK_SIZE` points at or after `from_x`. A
    /// reader whose `client_version` no longer matches is served from the
    /// beginning regardless of `from_x`; an empty history (or a `from_x`
    /// past the end) yields an empty chunk.
    pub fn read_chunk(&self, client_version: u32, from_x: u32) -> HistoryChunk {
        let s = self.state.lock().unwrap();
        let points = if s.version != client_version {
            let end = HISTORY_CHUNK_SIZE.min(s.points.len());
            s.points[..end].to_vec()
        } else if s.points.last().map(|p| p.x < from_x).unwrap_or(true) {
            Vec::new()
        } else {
            let start = s.points.partition_point(|p| p.x < from_x);
            let end = (start + HISTORY_CHUNK_SIZE).min(s.points.len());
            s.points[start..end].to_vec()
        };
        HistoryChunk { task_id: s.task_id, version: s.version, points }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SparseHistory {
    fn default() -> Self {
        Self::new()
    }
}
