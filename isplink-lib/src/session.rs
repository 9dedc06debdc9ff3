use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::latch::EventLatch;

/// Which side may hold the notify line without it counting as "busy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NotifyOwner {
    Host = 0,
    #[default]
    Peer = 1,
}

impl From<u8> for NotifyOwner {
    fn from(value: u8) -> Self {
        match value {
            0 => NotifyOwner::Host,
            _ => NotifyOwner::Peer,
        }
    }
}

/// Per-device mutable state shared by the engines and the interrupt handlers.
///
/// Lives from device attach to detach. Interrupt handlers reach it through a
/// weak [`crate::latch::IrqHandle`] and only ever touch the two latches.
#[derive(Debug)]
pub struct Session {
    ap_event: EventLatch,
    peer_event: EventLatch,
    notify_owner: AtomicU8,
    batch_mode: AtomicBool,
    boot_error: AtomicBool,
    forced_wake: AtomicBool,
    last_error: AtomicI32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            ap_event: EventLatch::new(),
            peer_event: EventLatch::new(),
            notify_owner: AtomicU8::new(NotifyOwner::Peer as u8),
            batch_mode: AtomicBool::new(false),
            boot_error: AtomicBool::new(false),
            forced_wake: AtomicBool::new(false),
            last_error: AtomicI32::new(0),
        }
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ap_event(&self) -> &EventLatch {
        &self.ap_event
    }

    pub fn peer_event(&self) -> &EventLatch {
        &self.peer_event
    }

    pub fn notify_owner(&self) -> NotifyOwner {
        NotifyOwner::from(self.notify_owner.load(Ordering::Acquire))
    }

    /// Set the notify owner, returning the previous one.
    pub fn set_notify_owner(&self, owner: NotifyOwner) -> NotifyOwner {
        NotifyOwner::from(self.notify_owner.swap(owner as u8, Ordering::AcqRel))
    }

    pub fn batch_mode(&self) -> bool {
        self.batch_mode.load(Ordering::Acquire)
    }

    pub(crate) fn set_batch_mode(&self, on: bool) {
        self.batch_mode.store(on, Ordering::Release);
    }

    pub fn boot_error(&self) -> bool {
        self.boot_error.load(Ordering::Acquire)
    }

    pub(crate) fn set_boot_error(&self, failed: bool) {
        self.boot_error.store(failed, Ordering::Release);
    }

    /// Raise the peer latch without a peer event behind it (power-off).
    pub fn force_peer_wake(&self) {
        self.forced_wake.store(true, Ordering::Release);
        self.peer_event.raise();
    }

    /// Whether the last peer wake was forced; clears the mark.
    pub(crate) fn take_forced_wake(&self) -> bool {
        self.forced_wake.swap(false, Ordering::AcqRel)
    }

    /// Negative code of the last failed exchange, 0 if none failed yet.
    pub fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Acquire)
    }

    pub(crate) fn record_error(&self, code: i32) {
        self.last_error.store(code, Ordering::Release);
    }
}
