//! One-shot, re-armable wait/notify gate
//!
//! Lets a request thread block until an event fired on an engine callback
//! thread has happened. The "already signaled" check runs under the same lock
//! as the wait, so a signal that lands between arming and waiting is never
//! lost.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How [`NegotiationBarrier::await_signal`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by `signal()` while blocked
    Signaled,
    /// `signal()` happened before the wait began, no blocking took place
    AlreadySignaled,
    TimedOut,
    /// The barrier was cancelled, the owning negotiation is being torn down
    Cancelled,
}

impl WaitOutcome {
    pub fn is_signaled(&self) -> bool {
        matches!(self, WaitOutcome::Signaled | WaitOutcome::AlreadySignaled)
    }
}

#[derive(Debug, Default)]
struct GateState {
    signaled: bool,
    cancelled: bool,
}

#[derive(Debug, Default)]
pub struct NegotiationBarrier {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl NegotiationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the signaled flag. Must happen before the async operation whose
    /// completion will be signaled is started.
    pub fn arm(&self) {
        self.state.lock().signaled = false;
    }

    /// Set the flag and wake the waiter
    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        self.cond.notify_one();
    }

    /// Permanently release any waiter with [`WaitOutcome::Cancelled`]
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Block until signaled, cancelled or `timeout` elapses. `None` waits
    /// without bound.
    pub fn await_signal(&self, timeout: Option<Duration>) -> WaitOutcome {
        let mut state = self.state.lock();

        if state.cancelled {
            return WaitOutcome::Cancelled;
        }
        if state.signaled {
            return WaitOutcome::AlreadySignaled;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match deadline {
                Some(deadline) => {
                    let result = self.cond.wait_until(&mut state, deadline);
                    if result.timed_out() && !state.signaled && !state.cancelled {
                        return WaitOutcome::TimedOut;
                    }
                }
                None => self.cond.wait(&mut state),
            }

            // Cancellation wins so a torn-down negotiation never reports success
            if state.cancelled {
                return WaitOutcome::Cancelled;
            }
            if state.signaled {
                return WaitOutcome::Signaled;
            }
        }
    }
}
