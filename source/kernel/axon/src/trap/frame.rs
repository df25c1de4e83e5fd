// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved CPU state at the moment a vector fired
//! OWNERS: @kernel-trap-team
//! PUBLIC API: TrapFrame
//! DEPENDS_ON: none
//! INVARIANTS: handlers treat the frame as immutable except where they must
//!             adjust control flow (emulation advance, recovery redirect)

use crate::mm::FaultInfo;

/// Register snapshot pushed by the trap entry stub.
///
/// Field order mirrors the entry stub's save sequence; `fault_addr` is the
/// faulting-address register latched immediately on entry so a nested fault
/// cannot clobber it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fault_addr: u64,
}

impl TrapFrame {
    /// True when the trap interrupted user-privilege execution.
    #[inline]
    pub fn user_mode(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Page-fault error-code bits, in the resolver's vocabulary.
    #[inline]
    pub fn fault_info(&self) -> FaultInfo {
        FaultInfo::from_bits_truncate(self.err as u32)
    }

    /// The six register-passed syscall arguments.
    #[inline]
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }

    /// General-purpose register by hardware encoding index.
    pub fn gpr(&self, index: u64) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    pub fn set_gpr(&mut self, index: u64, value: u64) {
        match index & 0xf {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => self.rsp = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_comes_from_cs() {
        let mut tf = TrapFrame::default();
        assert!(!tf.user_mode());
        tf.cs = 0x23;
        assert!(tf.user_mode());
    }

    #[test]
    fn gpr_roundtrip_by_encoding() {
        let mut tf = TrapFrame::default();
        for idx in 0..16u64 {
            tf.set_gpr(idx, 0x100 + idx);
        }
        assert_eq!(tf.gpr(0), 0x100); // rax
        assert_eq!(tf.gpr(4), 0x104); // rsp
        assert_eq!(tf.gpr(15), 0x10f); // r15
    }
}
