// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap classification and dispatch: exceptions, IRQs, NMIs, secrets
//! OWNERS: @kernel-trap-team
//! PUBLIC API: TrapDispatcher, TrapFrame, IrqRegistry, NmiCoalescer, SecretGuard
//! DEPENDS_ON: mm (fault resolution), scheduler collaborator, hal, console
//! INVARIANTS: vectors 0–31 are CPU exceptions, 32+ device/software; no
//!             failure crosses the dispatch boundary as anything but a task
//!             signal or a kernel halt

pub mod dispatch;
pub mod frame;
pub mod irq;
pub mod nmi;
pub mod secret;
mod tests_prop;

pub use dispatch::{Disposition, TrapContext, TrapDispatcher};
pub use frame::TrapFrame;
pub use irq::{Irq, IrqHandler, IrqRegistry};
pub use nmi::{NmiCoalescer, NmiSource, NmiVerdict};
pub use secret::SecretGuard;

use crate::task::Task;
use crate::types::Pid;

// CPU-defined exception vectors.
pub const T_DIVIDE: u64 = 0;
pub const T_NMI: u64 = 2;
pub const T_BRKPT: u64 = 3;
pub const T_ILLOP: u64 = 6;
pub const T_DBLFLT: u64 = 8;
pub const T_GPFLT: u64 = 13;
pub const T_PGFLT: u64 = 14;

/// First vector available to device and software interrupts.
pub const T_IRQ0: u64 = 32;

// Device lines relative to `T_IRQ0`.
pub const IRQ_TIMER: usize = 0;
pub const IRQ_KBD: usize = 1;
pub const IRQ_COM1: usize = 4;
pub const IRQ_IDE: usize = 14;
pub const IRQ_SPURIOUS: usize = 31;

/// Syscall gate vector.
pub const T_SYSCALL: u64 = 64;

// Software vectors (inter-processor plumbing).
pub const T_TLBFLUSH: u64 = 250;
pub const T_PAUSE: u64 = 251;
pub const T_IPICALL: u64 = 252;
pub const T_WAKE_CORE: u64 = 253;

/// Scheduler collaborator: this core requests, never implements.
pub trait SchedHooks: Send + Sync {
    /// Per-tick bookkeeping on the timer vector.
    fn timer_tick(&self);
    /// Give up the CPU now.
    fn yield_now(&self);
    /// Mark a task runnable again.
    fn add_runnable(&self, pid: Pid);
    /// Deliver the architecture's fault signal to `task`; returns true if
    /// the task had a handler installed and can resume.
    fn deliver_fault_signal(&self, task: &Task) -> bool;
}
