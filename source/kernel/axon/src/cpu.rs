// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-core execution-context state
//! OWNERS: @kernel-team
//! PUBLIC API: CpuState (push_cli/pop_cli, no_sched enter/exit)
//! DEPENDS_ON: hal (interrupt enable), trap::{nmi, secret}, scheduler hooks
//! INVARIANTS: interrupt masking is counted and nestable; only the
//!             outermost unmask re-enables, restoring the prior state;
//!             a deferred yield fires when the last no-sched level drops

use crate::hal::Platform;
use crate::trap::nmi::NmiCoalescer;
use crate::trap::secret::SecretGuard;
use crate::trap::SchedHooks;
use crate::types::CpuId;

const YIELD_REQUESTED: u32 = 1 << 31;

/// State owned by one logical execution context (one per core).
pub struct CpuState {
    pub id: CpuId,
    /// Interrupt-mask nesting depth.
    ncli: u32,
    /// Whether interrupts were enabled before the outermost mask.
    intena: bool,
    /// Critical-section count; the top bit records a deferred yield.
    no_sched: u32,
    pub ticks: u64,
    pub secret: SecretGuard,
    pub nmi: NmiCoalescer,
}

impl CpuState {
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            ncli: 0,
            intena: false,
            no_sched: 0,
            ticks: 0,
            secret: SecretGuard::new(),
            nmi: NmiCoalescer::new(),
        }
    }

    /// Masks interrupts; nestable. Two `push_cli` need two `pop_cli`.
    pub fn push_cli(&mut self, platform: &dyn Platform) {
        let was_enabled = platform.interrupts_off();
        if self.ncli == 0 {
            self.intena = was_enabled;
        }
        self.ncli += 1;
    }

    /// Unmasks one level; the outermost call restores whatever state was
    /// in effect before the outermost mask. Unbalanced calls are a broken
    /// locking invariant and unrecoverable.
    pub fn pop_cli(&mut self, platform: &dyn Platform) {
        assert!(
            !platform.interrupts_enabled(),
            "pop_cli with interrupts enabled"
        );
        assert!(self.ncli > 0, "pop_cli without matching push_cli");
        self.ncli -= 1;
        if self.ncli == 0 && self.intena {
            platform.interrupts_on();
        }
    }

    pub fn cli_depth(&self) -> u32 {
        self.ncli
    }

    /// Saved interrupt-enable state, for the NMI path: an NMI landing
    /// between a mask and its bookkeeping must not clobber this.
    pub fn save_intena(&self) -> bool {
        self.intena
    }

    pub fn restore_intena(&mut self, saved: bool) {
        self.intena = saved;
    }

    /// Enters a no-yield critical section.
    pub fn no_sched_enter(&mut self) {
        self.no_sched += 1;
    }

    /// Leaves a no-yield critical section; performs the yield a timer tick
    /// deferred while the section was held.
    pub fn no_sched_exit(&mut self, sched: &dyn SchedHooks) {
        debug_assert!(self.no_sched & !YIELD_REQUESTED > 0);
        self.no_sched -= 1;
        if self.no_sched == YIELD_REQUESTED {
            self.no_sched = 0;
            sched.yield_now();
        }
    }

    pub fn in_no_sched(&self) -> bool {
        self.no_sched & !YIELD_REQUESTED > 0
    }

    /// Records that a timer tick wanted to preempt but could not.
    pub fn request_deferred_yield(&mut self) {
        self.no_sched |= YIELD_REQUESTED;
    }

    pub fn yield_deferred(&self) -> bool {
        self.no_sched & YIELD_REQUESTED != 0
    }
}
