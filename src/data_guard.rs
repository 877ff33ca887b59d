//! Lock-free optimistic snapshot of a `Copy` value.
//!
//! Single-writer/many-reader sharing over an even/odd version counter: a
//! write bumps the counter to odd before mutating and back to even after.
//! A reader that observes an odd counter, or a counter that changed between
//! its before/after reads, discards the copy and reports no update.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub struct DataGuard<T: Copy> {
    version: AtomicU32,
    value: Mutex<T>,
}

impl<T: Copy> DataGuard<T> {
    pub fn new(initial: T) -> Self {
        DataGuard { version: AtomicU32::new(0), value: Mutex::new(initial) }
    }

    /// Runs `f` against the current value and commits the result.
    pub fn write(&self, f: impl FnOnce(&mut T)) {
        self.version.fetch_add(1, Ordering::SeqCst); // -> odd
        {
            let mut guard = self.value.lock().unwrap();
            f(&mut guard);
        }
        self.version.fetch_add(1, Ordering::SeqCst); // -> even
    }

    pub fn set(&self, value: T) {
        self.write(|v| *v = value);
    }

    /// Attempts a torn-free read. Returns `None` if a concurrent write was
    /// observed in progress; the caller should simply retry later.
    pub fn snapshot(&self) -> Option<T> {
        self.snapshot_versioned().map(|(value, _)| value)
    }

    /// Reads the current value, spinning through any in-flight write. The
    /// writer's critical section is a plain memcpy, so the wait is bounded.
    pub fn read(&self) -> T {
        loop {
            if let Some(value) = self.snapshot() {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    fn snapshot_versioned(&self) -> Option<(T, u32)> {
        let before = self.version.load(Ordering::SeqCst);
        if before % 2 != 0 {
            return None;
        }
        let value = *self.value.lock().unwrap();
        let after = self.version.load(Ordering::SeqCst);
        if before != after {
            return None;
        }
        Some((value, before))
    }

    /// Current version counter, even iff no write is in flight.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }
}

/// Change-tracking reader over a `DataGuard`: remembers the version of its
/// last successful snapshot and reports `None` both for torn reads and for
/// values it has already seen. Periodic flush tasks poll this so a value
/// that hasn't changed costs nothing.
pub struct SnapshotReader {
    last_version: Option<u32>,
}

impl SnapshotReader {
    pub fn new() -> Self {
        SnapshotReader { last_version: None }
    }

    /// Returns the current value only if it committed since the last
    /// successful snapshot. A failed attempt leaves the reader unchanged,
    /// so the next poll retries the same version.
    pub fn snapshot_changed<T: Copy>(&mut self, guard: &DataGuard<T>) -> Option<T> {
        let (value, version) = guard.snapshot_versioned()?;
        if self.last_version == Some(version) {
            return None;
        }
        self.last_version = Some(version);
        Some(value)
    }

    /// Forgets the last seen version so the next poll re-reports the
    /// current value even if it hasn't changed.
    pub fn invalidate(&mut self) {
        self.last_version = None;
    }
}

impl Default for SnapshotReader {
    fn default() -> Self {
        Self::new()
    }
}
