// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Table-driven entry point for every exception, IRQ and syscall
//! OWNERS: @kernel-trap-team
//! PUBLIC API: TrapDispatcher, TrapContext, Disposition, VectorClass
//! DEPENDS_ON: mm (fault resolution), trap::{irq,nmi,secret}, sched/console
//!             collaborators, hal
//! INVARIANTS: the killed flag is observed at privilege-transition
//!             boundaries; secret-region widening takes precedence over
//!             ordinary resolution; kernel-privilege unhandled traps halt

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::frame::TrapFrame;
use super::irq::IrqRegistry;
use super::nmi::{NmiSource, NmiVerdict};
use super::{
    SchedHooks, IRQ_SPURIOUS, IRQ_TIMER, T_ILLOP, T_IPICALL, T_IRQ0, T_PAUSE, T_PGFLT,
    T_SYSCALL, T_TLBFLUSH, T_WAKE_CORE,
};
use crate::console::Console;
use crate::cpu::CpuState;
use crate::hal::Platform;
use crate::mm::{FaultError, FaultInfo, KTEXT_BASE, KTEXT_END, SECRET_BASE, USER_TOP};
use crate::syscall::{self, Args, SyscallOutcome, SyscallTable};
use crate::task::Task;
use crate::{cmdline, diag::report, log_error, log_warn};

/// Terminal state of one trap delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Instruction pointer adjusted as needed; execution continues.
    Resumed,
    /// The killed flag was observed at a privilege transition; the task
    /// unwinds to its exit path instead of re-entering user code.
    TaskTerminated,
    /// Unrecoverable; the report is out and the core must halt.
    KernelHalted,
}

/// What a vector number means to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorClass {
    Unused,
    CpuException,
    IrqChain,
    Software,
    Syscall,
}

/// Everything one trap delivery may touch. Built by the per-architecture
/// entry stub around the saved frame.
pub struct TrapContext<'a> {
    pub cpu: &'a mut CpuState,
    pub task: Option<&'a Task>,
    pub sched: &'a dyn SchedHooks,
    pub platform: &'a dyn Platform,
    pub console: &'a Console,
    pub syscalls: Option<&'a SyscallTable>,
}

/// A registered software vector handler.
pub type TrapHook = fn(&mut TrapFrame);

enum Flow {
    Resumed,
    Terminated,
    Fatal,
    Continue,
}

/// The vector table and its attendant registries.
pub struct TrapDispatcher {
    irqs: IrqRegistry,
    hooks: Mutex<[Option<TrapHook>; 256]>,
    nmi_sources: Mutex<Vec<Arc<dyn NmiSource>>>,
}

impl TrapDispatcher {
    pub fn new() -> Self {
        const NONE: Option<TrapHook> = None;
        let dispatcher = Self {
            irqs: IrqRegistry::new(),
            hooks: Mutex::new([NONE; 256]),
            nmi_sources: Mutex::new(Vec::new()),
        };
        dispatcher.irqs.reserve_legacy();
        dispatcher
    }

    pub fn irqs(&self) -> &IrqRegistry {
        &self.irqs
    }

    /// Registers a software handler for `vector`. Registration happens at
    /// bring-up, before the last core starts taking interrupts.
    pub fn register_trap_handler(&self, vector: u64, hook: TrapHook) {
        if let Some(slot) = self.hooks.lock().get_mut(vector as usize) {
            *slot = Some(hook);
        }
    }

    pub fn register_nmi_source(&self, source: Arc<dyn NmiSource>) {
        self.nmi_sources.lock().push(source);
    }

    /// Static classification of a vector number.
    pub fn classify(&self, vector: u64) -> VectorClass {
        match vector {
            0..=31 => VectorClass::CpuException,
            T_SYSCALL => VectorClass::Syscall,
            T_TLBFLUSH | T_PAUSE | T_IPICALL | T_WAKE_CORE => VectorClass::Software,
            v if v >= T_IRQ0 && self.irqs.has_handlers((v - T_IRQ0) as usize) => {
                VectorClass::IrqChain
            }
            v if (v as usize) < 256 && self.hooks.lock()[v as usize].is_some() => {
                VectorClass::Software
            }
            _ => VectorClass::Unused,
        }
    }

    /// Entry point for every vectored delivery except NMIs and double
    /// faults, which have their own stacks and entries below.
    pub fn dispatch(&self, ctx: &mut TrapContext<'_>, tf: &mut TrapFrame) -> Disposition {
        let vector = tf.trapno;
        match vector {
            v if v == T_IRQ0 + IRQ_TIMER as u64 => {
                ctx.cpu.ticks += 1;
                ctx.sched.timer_tick();
                ctx.platform.eoi();
                if ctx.cpu.in_no_sched() {
                    // Inside a no-yield critical section: note the request
                    // and let the section perform the yield on release.
                    ctx.cpu.request_deferred_yield();
                    return Disposition::Resumed;
                }
            }
            T_TLBFLUSH => {
                ctx.platform.eoi();
                if let Some(task) = ctx.task {
                    task.vmap.invalidate_translations();
                }
            }
            T_PAUSE | T_IPICALL | T_WAKE_CORE => {
                ctx.platform.eoi();
            }
            v if v == T_IRQ0 + IRQ_SPURIOUS as u64 || v == T_IRQ0 + 7 => {
                // [Intel SDM 10.9] the spurious vector must not be EOI'd.
                if cmdline::get().report_spurious_irqs {
                    log_warn!(target: "trap", "cpu{}: spurious interrupt at {:#x}", ctx.cpu.id, tf.rip);
                }
            }
            T_SYSCALL => {
                return self.handle_syscall(ctx, tf);
            }
            _ => match self.handle_other(ctx, tf) {
                Flow::Resumed => return Disposition::Resumed,
                Flow::Terminated => return Disposition::TaskTerminated,
                Flow::Fatal => return Disposition::KernelHalted,
                Flow::Continue => {}
            },
        }
        self.finish(ctx, tf, vector)
    }

    /// NMI entry. Runs on its own stack; the only locks reachable from
    /// here are ones taken exclusively from NMI context. The interrupted
    /// context's saved enable state is preserved around the handler so a
    /// preempted unmask cannot lose its pending re-enable.
    pub fn nmi_entry(&self, ctx: &mut TrapContext<'_>, tf: &TrapFrame) -> Disposition {
        let intena_save = ctx.cpu.save_intena();
        let sources: Vec<Arc<dyn NmiSource>> = self.nmi_sources.lock().clone();
        let mut handled = 0u32;
        for source in &sources {
            handled += source.poll();
        }
        let verdict = ctx.cpu.nmi.observe(tf.rip, handled);
        ctx.cpu.restore_intena(intena_save);
        // No EOI: only fixed-delivery interrupts are acknowledged, and
        // those cannot be programmed to produce the NMI vector.
        match verdict {
            NmiVerdict::Fatal => {
                report::kernel_trap_report(ctx.console, ctx.cpu.id, ctx.task, tf);
                Disposition::KernelHalted
            }
            _ => Disposition::Resumed,
        }
    }

    /// Double faults share one answer everywhere: report and halt.
    pub fn double_fault_entry(&self, ctx: &mut TrapContext<'_>, tf: &TrapFrame) -> Disposition {
        report::kernel_trap_report(ctx.console, ctx.cpu.id, ctx.task, tf);
        Disposition::KernelHalted
    }

    fn handle_syscall(&self, ctx: &mut TrapContext<'_>, tf: &mut TrapFrame) -> Disposition {
        let (Some(task), Some(table)) = (ctx.task, ctx.syscalls) else {
            report::kernel_trap_report(ctx.console, ctx.cpu.id, ctx.task, tf);
            return Disposition::KernelHalted;
        };
        let mut sysctx = syscall::SysContext {
            task,
            cpu: &mut *ctx.cpu,
            platform: ctx.platform,
            sched: ctx.sched,
        };
        match syscall::sysentry(table, &mut sysctx, tf.rax, Args::new(tf.syscall_args())) {
            SyscallOutcome::Return(value) => {
                tf.rax = value;
                Disposition::Resumed
            }
            SyscallOutcome::Exit => Disposition::TaskTerminated,
        }
    }

    fn handle_other(&self, ctx: &mut TrapContext<'_>, tf: &mut TrapFrame) -> Flow {
        let vector = tf.trapno;

        // Illegal opcode in kernel text: the software backstop for a
        // missing hardware feature gets one chance to emulate.
        if vector == T_ILLOP
            && !tf.user_mode()
            && (KTEXT_BASE..KTEXT_END).contains(&(tf.rip as usize))
            && emulate_popcnt(ctx.platform, tf)
        {
            return Flow::Resumed;
        }

        if vector >= T_IRQ0 {
            let gsi = (vector - T_IRQ0) as usize;
            if self.irqs.has_handlers(gsi) {
                self.irqs.trigger(gsi);
                ctx.platform.eoi();
                ctx.platform.legacy_eoi();
                return Flow::Resumed;
            }
        }

        if vector == T_PGFLT && self.do_pagefault(ctx, tf) {
            if let Some(task) = ctx.task {
                if task.killed() && tf.user_mode() {
                    return Flow::Terminated;
                }
            }
            return Flow::Resumed;
        }

        let hook = self
            .hooks
            .lock()
            .get(vector as usize)
            .copied()
            .flatten();
        if let Some(hook) = hook {
            // Registered handlers may touch secret data; widen up front.
            ctx.cpu.secret.ensure_secrets(tf.rip, ctx.task, ctx.platform);
            hook(tf);
            return Flow::Resumed;
        }

        match ctx.task {
            None => {
                report::kernel_trap_report(ctx.console, ctx.cpu.id, None, tf);
                Flow::Fatal
            }
            Some(task) => {
                if !tf.user_mode() {
                    report::kernel_trap_report(ctx.console, ctx.cpu.id, Some(task), tf);
                    return Flow::Fatal;
                }
                // In user space, assume the task misbehaved.
                log_error!(
                    target: "trap",
                    "tid {} {}: trap {} err {:#x} on cpu {} rip {:#x} addr {:#x} -- kill task",
                    task.tid,
                    task.name,
                    vector,
                    tf.err,
                    ctx.cpu.id,
                    tf.rip,
                    tf.fault_addr
                );
                task.kill();
                Flow::Continue
            }
        }
    }

    /// Page-fault triage. Ordering matters: a kernel-privilege fault on
    /// the secret region while secrets are unmapped is the
    /// transient-execution defense widening, not an address-space fault,
    /// and never consults the frame table.
    fn do_pagefault(&self, ctx: &mut TrapContext<'_>, tf: &mut TrapFrame) -> bool {
        let addr = tf.fault_addr as usize;
        let had_secrets = ctx.cpu.secret.secrets_mapped();

        if (!tf.user_mode() || ctx.task.is_none()) && !had_secrets && addr >= SECRET_BASE {
            ctx.cpu
                .secret
                .widen_transparent(tf.rip, ctx.task, ctx.platform);
            return true;
        }

        let Some(task) = ctx.task else {
            return false;
        };
        let info = tf.fault_info();

        if addr < USER_TOP && info.from_user() {
            if resolve_with_interrupts(ctx.platform, task, addr, info).is_ok() {
                return true;
            }
            return ctx.sched.deliver_fault_signal(task);
        }

        if let Some(recovery) = task.uaccess_recovery() {
            // Guarded user-memory access from kernel mode. If nothing
            // forbids it, resolve inline; otherwise fail the in-flight
            // operation by redirecting to its recovery stub.
            if ctx.cpu.cli_depth() == 0
                && resolve_with_interrupts(ctx.platform, task, addr, info).is_ok()
            {
                return true;
            }
            tf.rax = u64::MAX;
            tf.rip = recovery;
            return true;
        }

        false
    }

    fn finish(&self, ctx: &mut TrapContext<'_>, tf: &TrapFrame, vector: u64) -> Disposition {
        // Force task exit if it was killed while in user space; a task
        // still in the kernel keeps running to its regular return.
        if let Some(task) = ctx.task {
            if task.killed() && tf.user_mode() {
                return Disposition::TaskTerminated;
            }
        }
        if vector == T_IRQ0 + IRQ_TIMER as u64 && ctx.task.is_some() {
            ctx.sched.yield_now();
            // The task may have been killed while we were yielded.
            if let Some(task) = ctx.task {
                if task.killed() && tf.user_mode() {
                    return Disposition::TaskTerminated;
                }
            }
        }
        Disposition::Resumed
    }
}

impl Default for TrapDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Faults are resolved with interrupts re-enabled (the resolver may block
/// on frame allocation); the mask is restored before returning to the
/// trap path.
fn resolve_with_interrupts(
    platform: &dyn Platform,
    task: &Task,
    addr: usize,
    info: FaultInfo,
) -> Result<(), FaultError> {
    platform.interrupts_on();
    let result = task.vmap.pagefault(addr, info);
    platform.interrupts_off();
    result
}

/// Emulates `popcnt r64, r64` when the platform lacks it. Only needed so
/// the kernel can run on machine models without the feature bit; remove
/// once the baseline requires it.
fn emulate_popcnt(platform: &dyn Platform, tf: &mut TrapFrame) -> bool {
    let Some(instr) = platform.fetch_instruction(tf.rip) else {
        return false;
    };
    if instr & 0xc0_ff_ff_f0_ff != 0xc0_b8_0f_40_f3 {
        return false;
    }
    let src = ((instr >> 32) & 0x7) | (((instr >> 8) & 0x1) << 3);
    let dst = ((instr >> 35) & 0x7) | (((instr >> 9) & 0x1) << 3);
    let count = tf.gpr(src).count_ones() as u64;
    tf.set_gpr(dst, count);
    tf.rip += 5;
    true
}

#[cfg(test)]
mod tests;
