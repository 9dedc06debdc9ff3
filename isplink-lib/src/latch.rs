//! Interrupt latches: set from interrupt context, consumed by a waiting call.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{trace, warn};

use crate::session::Session;

/// A single-bit "event occurred" latch with one waiter.
#[derive(Debug, Default)]
pub struct EventLatch {
    pending: AtomicBool,
    notify: Notify,
}

impl EventLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake the waiter. Never blocks.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Wait until the latch is set, then clear it and return `true`.
    ///
    /// Returns `false` once `timeout` has elapsed, leaving the latch untouched.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.take() {
                return true;
            }
            // A raise between `take` and here leaves a stored permit behind,
            // so this wakes immediately instead of missing it.
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return false;
            }
        }
    }
}

/// Handle given to interrupt handlers.
///
/// Holds only a weak reference to the device session; raising an event on
/// a detached device does nothing.
#[derive(Debug, Clone)]
pub struct IrqHandle {
    session: Weak<Session>,
}

impl IrqHandle {
    pub(crate) fn new(session: Weak<Session>) -> Self {
        Self { session }
    }

    /// Falling edge on `ap_event_in`: a response is ready for the host.
    pub fn on_ap_interrupt(&self) {
        match self.session.upgrade() {
            Some(session) => {
                trace!("ap interrupt");
                session.ap_event().raise();
            }
            None => warn!("ap interrupt on a detached device"),
        }
    }

    /// Rising edge on `peer_event_in`: the peer has an event of its own.
    pub fn on_peer_interrupt(&self) {
        match self.session.upgrade() {
            Some(session) => {
                trace!("peer interrupt");
                session.peer_event().raise();
            }
            None => warn!("peer interrupt on a detached device"),
        }
    }

    /// Unblock a pending peer-event wait without a hardware interrupt
    /// (power-off path).
    pub fn force_peer_wake(&self) {
        if let Some(session) = self.session.upgrade() {
            session.force_peer_wake();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.session.strong_count() > 0
    }
}
