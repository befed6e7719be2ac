//! Ping-pong liveness detection
//!
//! Each session runs one ticker task that periodically demands proof the
//! peer is still there. Any inbound frame of any type counts as proof, not
//! just PING frames. The tick state machine is kept free of clocks and I/O
//! so its threshold behavior is testable without wall time; the session's
//! ticker task applies the verdicts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;

use super::{MISSED_CLOSE, MISSED_GAMEOVER, PING_JITTER};

/// What the ticker should do after a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LivenessVerdict {
    /// The peer was heard from since the last tick
    Quiet,
    /// Silence: probe the peer
    SendPing,
    /// Repeated silence: the link is suspect (half-open TCP), force it closed
    CloseLink,
    /// Prolonged silence: give up on this session for good
    GameOver,
}

pub(crate) struct Liveness {
    /// Set by the dispatch loop on every inbound frame
    activity: AtomicBool,
    /// Consecutive ticks without any inbound frame
    missed: AtomicU32,
    /// A probe of ours is in flight and unanswered
    outstanding: AtomicBool,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            activity: AtomicBool::new(false),
            missed: AtomicU32::new(0),
            outstanding: AtomicBool::new(false),
        }
    }

    /// Record an inbound frame as proof of life
    pub(crate) fn observe(&self) {
        self.activity.store(true, Ordering::Relaxed);
    }

    /// Mark that we sent a probe and are awaiting its acknowledgement
    pub(crate) fn mark_outstanding(&self) {
        self.outstanding.store(true, Ordering::Relaxed);
    }

    /// Consume the outstanding-probe flag. An inbound PING while a probe of
    /// ours is pending is its acknowledgement and must not be answered, or
    /// two peers probing each other would ping forever.
    pub(crate) fn take_outstanding(&self) -> bool {
        self.outstanding.swap(false, Ordering::Relaxed)
    }

    /// One scheduled liveness check
    pub(crate) fn tick(&self) -> LivenessVerdict {
        if self.activity.swap(false, Ordering::Relaxed) {
            self.missed.store(0, Ordering::Relaxed);
            return LivenessVerdict::Quiet;
        }
        let missed = self.missed.fetch_add(1, Ordering::Relaxed) + 1;
        if missed >= MISSED_GAMEOVER {
            LivenessVerdict::GameOver
        } else if missed >= MISSED_CLOSE {
            LivenessVerdict::CloseLink
        } else {
            LivenessVerdict::SendPing
        }
    }

    pub(crate) fn missed(&self) -> u32 {
        self.missed.load(Ordering::Relaxed)
    }
}

/// Interval until the next check: `base ± jitter`, so many sessions created
/// together do not probe in lockstep.
pub(crate) fn ping_delay(base: Duration) -> Duration {
    let jitter = PING_JITTER.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    let millis = (base.as_millis() as i64 + offset).max(100);
    Duration::from_millis(millis as u64)
}
