//! Windowed flow control
//!
//! A [`Window`] is the sole backpressure mechanism for a virtual stream: a
//! byte budget that senders draw from before putting DATA on the wire and
//! that the peer replenishes with ACK frames as it consumes. It is a
//! counting semaphore with a fixed ceiling and a permanent "closed" poison
//! state.

use std::sync::Mutex;

use tokio::sync::Notify;

struct WindowState {
    current: u32,
    closed: bool,
}

/// A bounded byte budget with blocking acquisition.
///
/// Invariant: `0 <= current <= max` at every observation point.
pub struct Window {
    state: Mutex<WindowState>,
    notify: Notify,
    max: u32,
}

impl Window {
    /// Create a window that starts full
    pub fn new(max: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                current: max,
                closed: false,
            }),
            notify: Notify::new(),
            max,
        }
    }

    /// Take up to `want` bytes from the budget.
    ///
    /// Blocks while the window is empty and open. Returns the granted
    /// amount, or 0 once the window has been closed; callers must treat 0
    /// as "no further writes possible", not as a retry signal.
    pub async fn acquire(&self, want: u32) -> u32 {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeup before checking state so a release between
            // the check and the await cannot be lost.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return 0;
                }
                if state.current > 0 {
                    let granted = want.min(state.current);
                    state.current -= granted;
                    return granted;
                }
            }
            notified.await;
        }
    }

    /// Return `n` bytes to the budget, clamped at the ceiling, and wake all
    /// waiters (broadcast: every blocked acquirer re-checks).
    pub fn release(&self, n: u32) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.current = state.current.saturating_add(n).min(self.max);
        }
        self.notify.notify_waiters();
    }

    /// Poison the window. Idempotent; wakes every waiter with a 0 grant.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Bytes currently available
    pub fn available(&self) -> u32 {
        self.state.lock().unwrap().current
    }

    /// Whether the window has been poisoned
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}
