//! Connection flood guard
//!
//! Counts accept attempts per remote address inside a sliding window. Every
//! attempt restarts the address's window, so a peer that keeps hammering
//! stays rejected until it goes quiet for a full window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last: Instant,
}

#[derive(Debug)]
pub struct FloodGuard {
    /// Attempts allowed per window; zero disables the guard
    threshold: u32,
    window: Duration,
    attempts: HashMap<String, Attempts>,
}

impl FloodGuard {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            attempts: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one accept attempt from `addr`.
    pub fn admit(&mut self, addr: &str, now: Instant) -> Admission {
        if !self.is_enabled() {
            return Admission::Admitted;
        }

        let entry = self.attempts.entry(addr.to_string()).or_insert(Attempts {
            count: 0,
            last: now,
        });
        entry.count = entry.count.saturating_add(1);
        entry.last = now;

        if entry.count > self.threshold {
            if entry.count == self.threshold + 1 {
                info!(addr, threshold = self.threshold, "connection flood detected");
            }
            Admission::Rejected
        } else {
            Admission::Admitted
        }
    }

    /// Window timer fired for `addr`.
    ///
    /// Forgets the address once it has been quiet for a whole window and
    /// returns `None`; otherwise returns how long is left.
    pub fn expire(&mut self, addr: &str, now: Instant) -> Option<Duration> {
        let entry = self.attempts.get(addr)?;
        let quiet = now.saturating_duration_since(entry.last);
        if quiet >= self.window {
            debug!(addr, attempts = entry.count, "flood window closed");
            self.attempts.remove(addr);
            None
        } else {
            Some(self.window - quiet)
        }
    }

    pub fn attempts(&self, addr: &str) -> u32 {
        self.attempts.get(addr).map_or(0, |a| a.count)
    }

    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}
