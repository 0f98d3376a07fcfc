//! Host-side liveness bookkeeping.
//!
//! A slot is tracked from the moment its stand-in is created until the host
//! releases it. Releasing is one-shot: only the first `untrack` for a slot
//! reports `true`, and only that caller may send the `destroy`.

use std::time::Duration;

use dashmap::DashSet;

use crate::bridge::protocol::SlotId;

#[derive(Debug, Default)]
pub struct LivenessTracker {
    live: DashSet<SlotId>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, slot: SlotId) {
        if !self.live.insert(slot) {
            tracing::warn!(%slot, "Slot tracked twice");
        }
    }

    /// Stop tracking `slot`. Returns `true` for the caller that owns the destroy.
    pub fn untrack(&self, slot: SlotId) -> bool {
        self.live.remove(&slot).is_some()
    }

    pub fn is_tracked(&self, slot: SlotId) -> bool {
        self.live.contains(&slot)
    }

    /// Tracked slots in ascending order.
    pub fn live(&self) -> Vec<SlotId> {
        let mut slots: Vec<SlotId> = self.live.iter().map(|slot| *slot).collect();
        slots.sort();
        slots
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Doubling poll interval, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}
