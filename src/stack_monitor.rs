//! Periodic liveness/stack report for the long-running tick threads.
//!
//! On the embedded target this reads each task's stack high-water mark;
//! a hosted build has no portable equivalent, so the monitor instead
//! reports which registered threads are still checking in. It is the only
//! component that ever observes the "fatal" failure class — everything
//! else in the core recovers locally.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::time::Tick;

/// How long a thread may go without a heartbeat before it is reported.
pub const STALL_REPORT_MS: u32 = 60_000;

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    last_seen: Tick,
}

pub struct StackMonitor {
    threads: Mutex<HashMap<&'static str, Heartbeat>>,
}

impl StackMonitor {
    pub fn new() -> Self {
        StackMonitor { threads: Mutex::new(HashMap::new()) }
    }

    /// Called by each tick thread once per iteration.
    pub fn heartbeat(&self, name: &'static str, now: Tick) {
        self.threads.lock().unwrap().insert(name, Heartbeat { last_seen: now });
    }

    /// Returns the names of registered threads that have not reported
    /// within `STALL_REPORT_MS`. Intended to be polled (and logged) by a
    /// low-priority monitor loop.
    pub fn stalled(&self, now: Tick) -> Vec<&'static str> {
        let threads = self.threads.lock().unwrap();
        let mut stalled: Vec<&'static str> = threads
            .iter()
            .filter(|(_, hb)| crate::time::expired(hb.last_seen, STALL_REPORT_MS, now))
            .map(|(name, _)| *name)
            .collect();
        stalled.sort_unstable();
        stalled
    }

    /// One monitor pass: log a report and return whether anything looked
    /// wrong.
    pub fn report(&self, now: Tick) -> bool {
        let stalled = self.stalled(now);
        if stalled.is_empty() {
            log::debug!("stack monitor: all threads alive");
            false
        } else {
            for name in &stalled {
                log::error!("stack monitor: thread '{name}' has stalled");
            }
            true
        }
    }
}

impl Default for StackMonitor {
    fn default() -> Self {
        Self::new()
    }
}
