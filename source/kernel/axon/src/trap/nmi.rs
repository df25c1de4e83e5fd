// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Non-maskable interrupt attribution and storm coalescing
//! OWNERS: @kernel-trap-team
//! PUBLIC API: NmiCoalescer, NmiSource, NmiVerdict
//! DEPENDS_ON: none
//! INVARIANTS: the swallow credit never underflows; an NMI is fatal only
//!             when it has zero sources and zero remaining credit

/// A hardware unit that can raise NMIs and report how many of its events
/// were pending when polled.
pub trait NmiSource: Send + Sync {
    fn poll(&self) -> u32;
}

/// Outcome of one NMI delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmiVerdict {
    /// At least one source claimed the interrupt.
    Attributed,
    /// No source claimed it, but it belongs to a storm we already paid for.
    Swallowed,
    /// No source and no credit: likely a real hardware failure.
    Fatal,
}

/// Per-execution-context NMI bookkeeping.
///
/// NMIs are edge triggered, so several source events can collapse into one
/// delivery, and one event can surface a delivery after its source was
/// already polled by the previous NMI. Back-to-back deliveries are detected
/// by a repeating entry instruction pointer; as long as a storm never
/// exceeds the events handled across it, nothing is wrong.
#[derive(Debug, Default)]
pub struct NmiCoalescer {
    last_pc: Option<u64>,
    swallow: u32,
}

impl NmiCoalescer {
    pub const fn new() -> Self {
        Self { last_pc: None, swallow: 0 }
    }

    /// Accounts for one NMI delivered at `pc` for which `handled` source
    /// events were found.
    pub fn observe(&mut self, pc: u64, handled: u32) -> NmiVerdict {
        let repeat = self.last_pc == Some(pc);
        self.last_pc = Some(pc);
        if !repeat {
            self.swallow = 0;
        }
        if handled == 0 && self.swallow == 0 {
            return NmiVerdict::Fatal;
        }
        // This delivery accounts for one event; the rest become credit for
        // the back-to-back deliveries that may follow.
        self.swallow = (self.swallow + handled).saturating_sub(1);
        if handled == 0 {
            NmiVerdict::Swallowed
        } else {
            NmiVerdict::Attributed
        }
    }

    pub fn swallow_credit(&self) -> u32 {
        self.swallow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_unattributed_nmi_is_fatal() {
        let mut nmi = NmiCoalescer::new();
        assert_eq!(nmi.observe(0x100, 0), NmiVerdict::Fatal);
    }

    #[test]
    fn storm_covered_by_first_delivery_is_benign() {
        let mut nmi = NmiCoalescer::new();
        // First delivery finds three events; the two echoes find none.
        assert_eq!(nmi.observe(0x200, 3), NmiVerdict::Attributed);
        assert_eq!(nmi.observe(0x200, 0), NmiVerdict::Swallowed);
        assert_eq!(nmi.observe(0x200, 0), NmiVerdict::Swallowed);
        assert_eq!(nmi.swallow_credit(), 0);
        // A third echo exceeds what was handled.
        assert_eq!(nmi.observe(0x200, 0), NmiVerdict::Fatal);
    }

    #[test]
    fn new_entry_point_resets_the_credit() {
        let mut nmi = NmiCoalescer::new();
        assert_eq!(nmi.observe(0x300, 5), NmiVerdict::Attributed);
        assert!(nmi.swallow_credit() > 0);
        // A different pc means a fresh storm; stale credit must not excuse it.
        assert_eq!(nmi.observe(0x400, 0), NmiVerdict::Fatal);
    }

    #[test]
    fn credit_never_underflows() {
        let mut nmi = NmiCoalescer::new();
        nmi.observe(0x500, 1);
        assert_eq!(nmi.swallow_credit(), 0);
        nmi.observe(0x500, 1);
        assert_eq!(nmi.swallow_credit(), 0);
    }
}
