// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal task record consumed by the trap and syscall paths
//! OWNERS: @kernel-team
//! PUBLIC API: Task
//! DEPENDS_ON: mm::AddressSpace; the full task table lives in the process
//!             manager collaborator
//! INVARIANTS: the killed flag may be set from any core; it is only acted
//!             on at privilege-transition boundaries

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::mm::AddressSpace;
use crate::types::Pid;

/// The slice of a task this core needs: identity, its address space, and
/// the flags the dispatcher reads at trap boundaries.
pub struct Task {
    pub name: String,
    pub tid: Pid,
    pub vmap: Arc<AddressSpace>,
    killed: AtomicBool,
    /// Secret-mapping widenings requested explicitly by kernel code paths.
    pub intentional_barriers: AtomicU64,
    /// Secret-mapping widenings discovered reactively by a fault.
    pub transparent_barriers: AtomicU64,
    /// Recovery address for the in-flight user-memory access, or zero when
    /// no such access is active. While nonzero, an unresolvable fault on a
    /// user address redirects here instead of raising a signal.
    uaccess_recovery: AtomicU64,
}

impl Task {
    pub fn new(name: &str, tid: Pid, vmap: Arc<AddressSpace>) -> Self {
        Self {
            name: String::from(name),
            tid,
            vmap,
            killed: AtomicBool::new(false),
            intentional_barriers: AtomicU64::new(0),
            transparent_barriers: AtomicU64::new(0),
            uaccess_recovery: AtomicU64::new(0),
        }
    }

    /// Marks the task killed; it unwinds at its next safe exit point.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Enters a guarded user-memory access; faults that cannot be resolved
    /// will redirect execution to `recovery_rip` instead of signalling.
    pub fn begin_uaccess(&self, recovery_rip: u64) {
        self.uaccess_recovery.store(recovery_rip, Ordering::SeqCst);
    }

    pub fn end_uaccess(&self) {
        self.uaccess_recovery.store(0, Ordering::SeqCst);
    }

    pub fn uaccess_recovery(&self) -> Option<u64> {
        match self.uaccess_recovery.load(Ordering::SeqCst) {
            0 => None,
            rip => Some(rip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::HeapFrames;

    #[test]
    fn kill_is_sticky_and_cross_thread_visible() {
        let alloc = Arc::new(HeapFrames::new());
        let task = Arc::new(Task::new("victim", 7, AddressSpace::new(alloc).unwrap()));
        let clone = task.clone();
        std::thread::spawn(move || clone.kill()).join().unwrap();
        assert!(task.killed());
    }

    #[test]
    fn uaccess_window_opens_and_closes() {
        let alloc = Arc::new(HeapFrames::new());
        let task = Task::new("t", 1, AddressSpace::new(alloc).unwrap());
        assert_eq!(task.uaccess_recovery(), None);
        task.begin_uaccess(0xdead);
        assert_eq!(task.uaccess_recovery(), Some(0xdead));
        task.end_uaccess();
        assert_eq!(task.uaccess_recovery(), None);
    }
}
