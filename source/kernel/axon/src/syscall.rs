// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatch table and entry glue
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, sysentry, SYSCALL_* IDs
//! DEPENDS_ON: task (killed flag), mm (error aggregation)
//! INVARIANTS: fixed MAX_SYSCALL window; the killed flag is observed both
//!             before and after the handler runs; one 64-bit result

use core::fmt;

use crate::cpu::CpuState;
use crate::hal::Platform;
use crate::mm::address_space::Protection;
use crate::mm::{FaultError, MmError, PageDesc};
use crate::task::Task;
use crate::trap::SchedHooks;
use crate::types::{PageLen, VirtAddr};

/// Maximum number of syscalls supported by this increment.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult = Result<u64, Error>;

/// Syscall arguments passed in the six argument registers.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [u64; 6],
}

impl Args {
    pub const fn new(regs: [u64; 6]) -> Self {
        Self { regs }
    }

    pub fn get(&self, index: usize) -> u64 {
        self.regs[index]
    }
}

/// Public syscall numbers.
pub const SYSCALL_YIELD: u64 = 0;
pub const SYSCALL_SBRK: u64 = 1;
pub const SYSCALL_MMAP: u64 = 2;
pub const SYSCALL_MUNMAP: u64 = 3;
pub const SYSCALL_MPROTECT: u64 = 4;
pub const SYSCALL_EXIT: u64 = 5;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Address-space operation failed.
    Mm(MmError),
    /// User memory could not be materialized.
    Fault(FaultError),
}

impl From<MmError> for Error {
    fn from(value: MmError) -> Self {
        Self::Mm(value)
    }
}

impl From<FaultError> for Error {
    fn from(value: FaultError) -> Self {
        Self::Fault(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

const ENOMEM: u64 = 12;
const EFAULT: u64 = 14;
const EINVAL: u64 = 22;
const ENOSPC: u64 = 28;
const ENOSYS: u64 = 38;

const fn errno(code: u64) -> u64 {
    (code as i64).wrapping_neg() as u64
}

fn encode_error(err: Error) -> u64 {
    match err {
        Error::InvalidSyscall => errno(ENOSYS),
        Error::Mm(MmError::OutOfFrames) => errno(ENOMEM),
        Error::Mm(MmError::NoSpace) => errno(ENOSPC),
        Error::Mm(MmError::AsidExhausted) => errno(ENOSPC),
        Error::Mm(_) => errno(EINVAL),
        Error::Fault(FaultError::OutOfFrames) => errno(ENOMEM),
        Error::Fault(FaultError::Unresolved) => errno(EFAULT),
    }
}

/// Everything a handler may touch.
pub struct SysContext<'a> {
    pub task: &'a Task,
    pub cpu: &'a mut CpuState,
    pub platform: &'a dyn Platform,
    pub sched: &'a dyn SchedHooks,
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut SysContext<'_>, &Args) -> SysResult;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    pub fn register(&mut self, number: u64, handler: Handler) {
        if let Some(slot) = self.handlers.get_mut(number as usize) {
            *slot = Some(handler);
        }
    }

    #[must_use]
    pub fn dispatch(&self, number: u64, ctx: &mut SysContext<'_>, args: &Args) -> SysResult {
        self.handlers
            .get(number as usize)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// What the entry stub should do after the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Resume user execution with this result in the return register.
    Return(u64),
    /// The task was killed; unwind to task exit instead of returning.
    Exit,
}

/// Syscall entry: up to six register-passed arguments plus a call number,
/// one 64-bit result. A task killed from another core never re-enters user
/// space through here.
pub fn sysentry(
    table: &SyscallTable,
    ctx: &mut SysContext<'_>,
    number: u64,
    args: Args,
) -> SyscallOutcome {
    if ctx.task.killed() {
        return SyscallOutcome::Exit;
    }
    let result = match table.dispatch(number, ctx, &args) {
        Ok(value) => value,
        Err(err) => encode_error(err),
    };
    if ctx.task.killed() {
        return SyscallOutcome::Exit;
    }
    SyscallOutcome::Return(result)
}

fn sys_yield(ctx: &mut SysContext<'_>, _args: &Args) -> SysResult {
    ctx.sched.yield_now();
    Ok(0)
}

fn sys_sbrk(ctx: &mut SysContext<'_>, args: &Args) -> SysResult {
    let old = ctx.task.vmap.sbrk(args.get(0) as i64 as isize)?;
    Ok(old as u64)
}

// Typed decode in front of every range-taking call, so handler bodies only
// ever see canonical, page-aligned arguments.
fn decode_range(args: &Args) -> Result<(VirtAddr, PageLen), Error> {
    let va = VirtAddr::page_aligned(args.get(0) as usize).ok_or(MmError::Unaligned)?;
    let len = PageLen::from_bytes_aligned(args.get(1) as usize).ok_or(MmError::Unaligned)?;
    Ok((va, len))
}

fn sys_mmap(ctx: &mut SysContext<'_>, args: &Args) -> SysResult {
    let len = PageLen::from_bytes_aligned(args.get(1) as usize).ok_or(MmError::Unaligned)?;
    let start = match args.get(0) as usize {
        0 => None,
        addr => Some(
            VirtAddr::page_aligned(addr)
                .ok_or(MmError::Unaligned)?
                .raw(),
        ),
    };
    let base = ctx.task.vmap.insert(PageDesc::anon(), start, len.raw())?;
    Ok(base as u64)
}

fn sys_munmap(ctx: &mut SysContext<'_>, args: &Args) -> SysResult {
    let (va, len) = decode_range(args)?;
    ctx.task.vmap.remove(va.raw(), len.raw())?;
    Ok(0)
}

fn sys_mprotect(ctx: &mut SysContext<'_>, args: &Args) -> SysResult {
    let (va, len) = decode_range(args)?;
    let prot = if args.get(2) & 0x2 != 0 {
        Protection::ReadWrite
    } else {
        Protection::ReadOnly
    };
    ctx.task.vmap.protect(va.raw(), len.raw(), prot)?;
    Ok(0)
}

/// Installs the baseline memory-management handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_SBRK, sys_sbrk);
    table.register(SYSCALL_MMAP, sys_mmap);
    table.register(SYSCALL_MUNMAP, sys_munmap);
    table.register(SYSCALL_MPROTECT, sys_mprotect);
}
