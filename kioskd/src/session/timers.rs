//! Per-session timer registry.
//!
//! Every scheduled delay (session timeout, expiry warnings, deferred-end
//! ceiling, error auto-end, farewell display) is tracked here by purpose.
//! Scheduling a purpose replaces any previous timer of that purpose, and
//! `cancel_all` runs at every state-leaving transition, so a stale timer
//! from a prior member can never fire against a new member's session.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::runtime::SessionEvent;

/// Why a timer was scheduled. One outstanding timer per purpose, at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Adaptive inactivity timeout (also the fallback when voice never activates).
    SessionTimeout,
    /// First expiry warning (30 s remaining).
    WarningOne,
    /// Second expiry warning (10 s remaining).
    WarningTwo,
    /// Clears a displayed warning message after a few seconds.
    WarningClear,
    /// Hard ceiling on waiting for the agent to stop speaking.
    DeferredEndCeiling,
    /// Automatic end of the error state after its grace period.
    ErrorAutoEnd,
    /// End of the farewell display during graceful end.
    FarewellDone,
}

pub struct TimerRegistry {
    events: mpsc::Sender<SessionEvent>,
    timers: HashMap<TimerPurpose, AbortHandle>,
}

impl TimerRegistry {
    pub fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            events,
            timers: HashMap::new(),
        }
    }

    /// Schedule a timer that sends `TimerFired(purpose)` back into the
    /// session's event channel after `after`. Replaces any previous timer of
    /// the same purpose.
    pub fn schedule(&mut self, purpose: TimerPurpose, after: Duration) {
        self.cancel(purpose);

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The runtime may already be gone; a dropped send is fine.
            let _ = events.send(SessionEvent::TimerFired(purpose)).await;
        });
        self.timers.insert(purpose, handle.abort_handle());
    }

    /// Cancel the timer for a purpose, if one is outstanding.
    pub fn cancel(&mut self, purpose: TimerPurpose) {
        if let Some(handle) = self.timers.remove(&purpose) {
            handle.abort();
        }
    }

    /// Cancel every outstanding timer. Invoked at every transition that
    /// leaves the state which scheduled them.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    /// Number of timers that are scheduled and have not yet fired or been
    /// cancelled. Exposed through the session snapshot for diagnostics.
    pub fn active_count(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }

    /// Whether a timer of this purpose is scheduled and still pending.
    pub fn is_scheduled(&self, purpose: TimerPurpose) -> bool {
        self.timers.get(&purpose).map(|h| !h.is_finished()).unwrap_or(false)
    }
}
