//! # Keep-Alive
//!
//! Each side may ask the other to send at least one message per period.
//! The receiving side then presumes the peer dead once nothing arrived for
//! `period * expire_factor`, and closes the link if keep-alive messages
//! arrive far more often than asked for.
//!
//! The monitor here holds no timers; the link feeds it instants and sleeps
//! for as long as `check` says.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::KeepAliveConfig;

/// Keep-alive intervals the spam check looks at.
const SPAM_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive { recheck_in: Duration },
    Expired { silent: Duration },
}

/// The median recent keep-alive interval is below the spam floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spam {
    pub median: Duration,
    pub floor: Duration,
}

#[derive(Debug)]
pub struct KeepAliveMonitor {
    expire: Duration,
    spam_floor: Duration,
    last_message: Instant,
    last_keep_alive: Option<Instant>,
    intervals: VecDeque<Duration>,
}

impl KeepAliveMonitor {
    pub fn new(period: Duration, config: &KeepAliveConfig, now: Instant) -> Self {
        Self {
            expire: period.mul_f64(config.expire_factor),
            spam_floor: period.mul_f64(config.spam_factor),
            last_message: now,
            last_keep_alive: None,
            intervals: VecDeque::with_capacity(SPAM_WINDOW),
        }
    }

    /// Any received message counts as a sign of life.
    pub fn note_message(&mut self, now: Instant) {
        self.last_message = self.last_message.max(now);
    }

    pub fn note_keep_alive(&mut self, now: Instant) -> Result<(), Spam> {
        self.note_message(now);
        if let Some(last) = self.last_keep_alive.replace(now) {
            if self.intervals.len() == SPAM_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals.push_back(now.saturating_duration_since(last));
        }
        if self.intervals.len() < SPAM_WINDOW {
            return Ok(());
        }
        let mut sorted: Vec<Duration> = self.intervals.iter().copied().collect();
        sorted.sort();
        let median = sorted[SPAM_WINDOW / 2];
        if median < self.spam_floor {
            return Err(Spam { median, floor: self.spam_floor });
        }
        Ok(())
    }

    pub fn check(&self, now: Instant) -> Liveness {
        let silent = now.saturating_duration_since(self.last_message);
        if silent >= self.expire {
            Liveness::Expired { silent }
        } else {
            Liveness::Alive { recheck_in: self.expire - silent }
        }
    }

    pub fn expire_after(&self) -> Duration {
        self.expire
    }
}

/// Period granted to a peer that asked for `requested`.
pub fn grant(requested: Duration, config: &KeepAliveConfig) -> Duration {
    requested.max(config.min_send)
}
