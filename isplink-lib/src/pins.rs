//! Flow-control lines gating who may drive the bus.

use std::time::Duration;

use crate::config::RetryPolicy;
use crate::session::NotifyOwner;

/// The GPIO side of the link: two outputs driven by the host and three
/// sampled inputs.
pub trait FlowPins {
    /// Drive `cmd_ready_out`: the host is about to clock a frame out.
    fn set_cmd_ready(&mut self, asserted: bool);

    /// Drive `notify_ready_out`: the host is servicing a peer notification.
    fn set_notify_ready(&mut self, asserted: bool);

    /// Level of `ap_event_in`; asserted while the peer lets the host send.
    fn ap_interrupt_asserted(&mut self) -> bool;

    /// Level of `peer_event_in`; asserted while the peer raises its own event.
    fn peer_interrupt_asserted(&mut self) -> bool;

    /// Level of `notify_check_in`; asserted while the peer holds a notification.
    fn notify_line_asserted(&mut self) -> bool;
}

/// One snapshot of the three input lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSample {
    pub ap_ready: bool,
    pub peer_irq: bool,
    pub notify: bool,
}

impl LineSample {
    pub fn take<P: FlowPins + ?Sized>(pins: &mut P) -> Self {
        Self {
            ap_ready: pins.ap_interrupt_asserted(),
            peer_irq: pins.peer_interrupt_asserted(),
            notify: pins.notify_line_asserted(),
        }
    }

    /// The host may send. A host-owned notify line does not block it.
    pub fn is_ready(&self, owner: NotifyOwner) -> bool {
        let notify_blocks = self.notify && owner == NotifyOwner::Peer;
        self.ap_ready && !self.peer_irq && !notify_blocks
    }

    /// Neither peer event line is active.
    pub fn events_idle(&self) -> bool {
        !self.peer_irq && !self.notify
    }
}

/// Sleep schedule of the busy wait.
///
/// Yields the pause to take after each failed attempt: `short_interval` for
/// the first `short_attempts`, `long_interval` afterwards, and stops once
/// `max_attempts` samples have been spent.
#[derive(Debug, Clone)]
pub struct BusyBackoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl BusyBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Iterator for BusyBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        if self.attempts <= self.policy.short_attempts {
            Some(self.policy.short_interval)
        } else {
            Some(self.policy.long_interval)
        }
    }
}
