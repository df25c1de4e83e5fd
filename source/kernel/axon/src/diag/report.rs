// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unrecoverable-trap reports: register dump, decode, stack walk
//! OWNERS: @kernel-team
//! PUBLIC API: kernel_trap_report, print_trap, print_stack_trace, trap_name
//! DEPENDS_ON: console, mm (safe_read for the frame-pointer walk)
//! INVARIANTS: the report path never takes a lock it cannot steal and never
//!             faults while walking a suspect stack

use core::fmt::{self, Write};

use crate::console::Console;
use crate::mm::FaultInfo;
use crate::task::Task;
use crate::trap::{TrapFrame, T_PGFLT};
use crate::types::CpuId;

const TRAP_NAMES: [&str; 20] = [
    "#DE", "#DB", "NMI", "#BP", "#OF", "#BR", "#UD", "#NM", "#DF", "?", "#TS", "#NP", "#SS",
    "#GP", "#PF", "?", "#MF", "#AC", "#MC", "#XM",
];

pub fn trap_name(trapno: u64) -> &'static str {
    TRAP_NAMES.get(trapno as usize).copied().unwrap_or("?")
}

/// Full register dump plus decode lines, in the layout the serial-log
/// tooling expects.
pub fn print_trap(
    w: &mut dyn fmt::Write,
    cpu: CpuId,
    task: Option<&Task>,
    tf: &TrapFrame,
) -> fmt::Result {
    writeln!(
        w,
        "trap {} ({}) err {:#x} cpu {} cs {:#x} ss {:#x}",
        tf.trapno,
        trap_name(tf.trapno),
        tf.err,
        cpu,
        tf.cs,
        tf.ss
    )?;
    writeln!(
        w,
        "  rip {:016x} rsp {:016x} rbp {:016x}",
        tf.rip, tf.rsp, tf.rbp
    )?;
    writeln!(
        w,
        "  rdi {:016x} rsi {:016x} rdx {:016x}",
        tf.rdi, tf.rsi, tf.rdx
    )?;
    writeln!(
        w,
        "  rcx {:016x} r8  {:016x} r9  {:016x}",
        tf.rcx, tf.r8, tf.r9
    )?;
    writeln!(
        w,
        "  rax {:016x} rbx {:016x} r10 {:016x}",
        tf.rax, tf.rbx, tf.r10
    )?;
    writeln!(
        w,
        "  r11 {:016x} r12 {:016x} r13 {:016x}",
        tf.r11, tf.r12, tf.r13
    )?;
    writeln!(
        w,
        "  r14 {:016x} r15 {:016x} rflags {:016x}",
        tf.r14, tf.r15, tf.rflags
    )?;
    if let Some(task) = task {
        writeln!(w, "  task: name {} tid {}", task.name, task.tid)?;
    }
    if tf.trapno == T_PGFLT {
        let info = tf.fault_info();
        writeln!(
            w,
            "  page fault: {} {} {:016x} from {} mode",
            if info.contains(FaultInfo::PRESENT) {
                "protection violation"
            } else {
                "non-present page"
            },
            if info.is_write() { "writing" } else { "reading" },
            tf.fault_addr,
            if info.from_user() { "user" } else { "kernel" }
        )?;
    }
    Ok(())
}

/// Follows the frame-pointer chain, reading each frame through `read` so a
/// corrupt stack terminates the walk instead of faulting the reporter.
pub fn print_stack_trace(
    w: &mut dyn fmt::Write,
    mut rbp: u64,
    read: &dyn Fn(u64, &mut [u8; 8]) -> bool,
) -> fmt::Result {
    const MAX_FRAMES: usize = 10;
    for _ in 0..MAX_FRAMES {
        let mut bytes = [0u8; 8];
        if !read(rbp.wrapping_add(8), &mut bytes) {
            break;
        }
        let saved_rip = u64::from_le_bytes(bytes);
        if saved_rip == 0 {
            break;
        }
        // Point at the call instruction, not the return site.
        writeln!(w, "  {:016x}", saved_rip.wrapping_sub(1))?;
        if !read(rbp, &mut bytes) {
            break;
        }
        rbp = u64::from_le_bytes(bytes);
    }
    Ok(())
}

/// Prints the unrecoverable kernel-trap report and latches the panic
/// state. The caller halts the core afterwards; with a wedged console the
/// bounded emergency acquire keeps this from deadlocking.
pub fn kernel_trap_report(console: &Console, cpu: CpuId, task: Option<&Task>, tf: &TrapFrame) {
    let mut session = console.enter_emergency(cpu);
    let _ = write!(session, "kernel ");
    let _ = print_trap(&mut session, cpu, task, tf);
    if let Some(task) = task {
        let vmap = task.vmap.clone();
        let _ = print_stack_trace(&mut session, tf.rbp, &move |addr, out| {
            vmap.safe_read(out, addr as usize) == out.len()
        });
    }
    drop(session);
    console.set_panicked();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CaptureSink;
    use crate::trap::T_GPFLT;

    #[test]
    fn report_names_the_vector_and_latches_panic() {
        let sink = CaptureSink::new();
        let console = Console::new(sink.clone());
        console.set_locking(true);
        let mut tf = TrapFrame::default();
        tf.trapno = T_GPFLT;
        tf.rip = 0xffff_ffff_8000_1234;
        kernel_trap_report(&console, 0, None, &tf);
        let out = sink.contents();
        assert!(out.contains("kernel trap 13 (#GP)"));
        assert!(out.contains("rip ffffffff80001234"));
        assert!(console.panicked());
    }

    #[test]
    fn page_fault_reports_decode_the_error_bits() {
        let sink = CaptureSink::new();
        let console = Console::new(sink.clone());
        let mut tf = TrapFrame::default();
        tf.trapno = T_PGFLT;
        tf.err = (FaultInfo::WRITE | FaultInfo::USER).bits() as u64;
        tf.fault_addr = 0x4000;
        kernel_trap_report(&console, 1, None, &tf);
        let out = sink.contents();
        assert!(out.contains("non-present page writing"));
        assert!(out.contains("from user mode"));
    }

    #[test]
    fn stack_walk_stops_at_unreadable_frames() {
        let mut out = alloc::string::String::new();
        // One readable frame, then an unreadable parent.
        let read = |addr: u64, bytes: &mut [u8; 8]| -> bool {
            match addr {
                0x1008 => {
                    *bytes = 0xffff_ffff_8000_2000u64.to_le_bytes();
                    true
                }
                0x1000 => {
                    *bytes = 0x2000u64.to_le_bytes();
                    true
                }
                _ => false,
            }
        };
        print_stack_trace(&mut out, 0x1000, &read).unwrap();
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("ffffffff80001fff"));
    }
}
