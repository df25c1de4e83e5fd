// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lazy secret-mapping defense against transient-execution leaks
//! OWNERS: @kernel-trap-team
//! PUBLIC API: SecretGuard, barrier accounting
//! DEPENDS_ON: cmdline (track_wb_crossings), hal (widen_kernel_view), task
//! INVARIANTS: secrets start unmapped every time a context is re-entered
//!             without them; widening happens at most once per context
//!             between two kernel-stack switches

extern crate alloc;

use alloc::collections::BTreeMap;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::cmdline;
use crate::hal::Platform;
use crate::task::Task;

/// How a context came to need the secret mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    /// A code path declared up front that it will touch secrets.
    Intentional,
    /// A fault on the secret region revealed the need reactively.
    Transparent,
}

// Instruction pointers that caused barrier crossings, kept only when the
// `track_wb_crossings` parameter is set. Sized for diagnostics, not for the
// hot path: the flag is checked before the lock is touched.
static TRANSPARENT_RIPS: Mutex<BTreeMap<u64, u64>> = Mutex::new(BTreeMap::new());
static INTENTIONAL_RIPS: Mutex<BTreeMap<u64, u64>> = Mutex::new(BTreeMap::new());

/// Per-execution-context view of whether kernel secrets are mapped.
#[derive(Debug, Default)]
pub struct SecretGuard {
    mapped: bool,
}

impl SecretGuard {
    pub const fn new() -> Self {
        Self { mapped: false }
    }

    pub fn secrets_mapped(&self) -> bool {
        self.mapped
    }

    /// Re-entered the context on a stack that does not carry secrets:
    /// the view narrows back down.
    pub fn reset_on_stack_switch(&mut self) {
        self.mapped = false;
    }

    /// Explicit widening for code that knows it will need secrets.
    /// Returns true when the view actually widened.
    pub fn ensure_secrets(
        &mut self,
        rip: u64,
        task: Option<&Task>,
        platform: &dyn Platform,
    ) -> bool {
        self.widen(BarrierKind::Intentional, rip, task, platform)
    }

    /// Reactive widening from the page-fault path.
    pub fn widen_transparent(
        &mut self,
        rip: u64,
        task: Option<&Task>,
        platform: &dyn Platform,
    ) -> bool {
        self.widen(BarrierKind::Transparent, rip, task, platform)
    }

    fn widen(
        &mut self,
        kind: BarrierKind,
        rip: u64,
        task: Option<&Task>,
        platform: &dyn Platform,
    ) -> bool {
        if self.mapped {
            return false;
        }
        platform.widen_kernel_view();
        self.mapped = true;
        if cmdline::get().track_wb_crossings {
            let mut rips = match kind {
                BarrierKind::Intentional => INTENTIONAL_RIPS.lock(),
                BarrierKind::Transparent => TRANSPARENT_RIPS.lock(),
            };
            *rips.entry(rip).or_insert(0) += 1;
        }
        if let Some(task) = task {
            let counter = match kind {
                BarrierKind::Intentional => &task.intentional_barriers,
                BarrierKind::Transparent => &task.transparent_barriers,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        true
    }
}

/// Recorded crossing count for `rip`, if tracking was enabled.
pub fn crossings(kind: BarrierKind, rip: u64) -> u64 {
    let rips = match kind {
        BarrierKind::Intentional => INTENTIONAL_RIPS.lock(),
        BarrierKind::Transparent => TRANSPARENT_RIPS.lock(),
    };
    rips.get(&rip).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::host::HostPlatform;
    use crate::mm::frame::HeapFrames;
    use crate::mm::AddressSpace;
    use alloc::sync::Arc;

    #[test]
    fn widening_happens_once_per_context() {
        let platform = HostPlatform::new();
        let mut guard = SecretGuard::new();
        assert!(guard.widen_transparent(0x1000, None, &platform));
        // Repeated faults at different secret addresses must not widen again.
        assert!(!guard.widen_transparent(0x2000, None, &platform));
        assert!(!guard.ensure_secrets(0x3000, None, &platform));
        assert_eq!(platform.widenings(), 1);
    }

    #[test]
    fn stack_switch_narrows_the_view_again() {
        let platform = HostPlatform::new();
        let mut guard = SecretGuard::new();
        assert!(guard.ensure_secrets(0x1000, None, &platform));
        guard.reset_on_stack_switch();
        assert!(!guard.secrets_mapped());
        assert!(guard.ensure_secrets(0x1000, None, &platform));
        assert_eq!(platform.widenings(), 2);
    }

    #[test]
    fn rip_accounting_follows_the_cmdline_switch() {
        crate::cmdline::init(crate::cmdline::Params {
            track_wb_crossings: true,
            ..Default::default()
        });
        let platform = HostPlatform::new();
        let mut guard = SecretGuard::new();
        guard.widen_transparent(0xdead_0010, None, &platform);
        guard.reset_on_stack_switch();
        guard.widen_transparent(0xdead_0010, None, &platform);
        assert_eq!(crossings(BarrierKind::Transparent, 0xdead_0010), 2);
        assert_eq!(crossings(BarrierKind::Intentional, 0xdead_0010), 0);
    }

    #[test]
    fn barrier_kinds_count_separately_per_task() {
        let platform = HostPlatform::new();
        let alloc = Arc::new(HeapFrames::new());
        let task = crate::task::Task::new("t", 1, AddressSpace::new(alloc).unwrap());
        let mut guard = SecretGuard::new();
        guard.widen_transparent(0x10, Some(&task), &platform);
        guard.reset_on_stack_switch();
        guard.ensure_secrets(0x20, Some(&task), &platform);
        assert_eq!(task.transparent_barriers.load(Ordering::Relaxed), 1);
        assert_eq!(task.intentional_barriers.load(Ordering::Relaxed), 1);
    }
}
