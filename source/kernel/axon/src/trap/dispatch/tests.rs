// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trap-dispatch behavior: classification, timer deferral, fault triage,
//! emulation, and the terminal states.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::*;
use crate::console::{CaptureSink, Console};
use crate::cpu::CpuState;
use crate::hal::host::HostPlatform;
use crate::mm::descriptor::PageDesc;
use crate::mm::frame::HeapFrames;
use crate::mm::{AddressSpace, HwFlags, PAGE_SIZE};
use crate::syscall::{install_handlers, SYSCALL_YIELD};
use crate::task::Task;
use crate::trap::irq::IrqHandler;

struct MockSched {
    ticks: AtomicUsize,
    yields: AtomicUsize,
    signal_handled: AtomicBool,
    signals: AtomicUsize,
}

impl MockSched {
    fn new() -> Self {
        Self {
            ticks: AtomicUsize::new(0),
            yields: AtomicUsize::new(0),
            signal_handled: AtomicBool::new(false),
            signals: AtomicUsize::new(0),
        }
    }
}

impl SchedHooks for MockSched {
    fn timer_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
    }
    fn add_runnable(&self, _pid: u32) {}
    fn deliver_fault_signal(&self, _task: &Task) -> bool {
        self.signals.fetch_add(1, Ordering::SeqCst);
        self.signal_handled.load(Ordering::SeqCst)
    }
}

struct Fixture {
    platform: HostPlatform,
    sched: MockSched,
    console: Console,
    sink: Arc<CaptureSink>,
    task: Task,
}

impl Fixture {
    fn new() -> Self {
        let sink = CaptureSink::new();
        let console = Console::new(sink.clone());
        console.set_locking(true);
        let alloc = Arc::new(HeapFrames::new());
        let task = Task::new("init", 1, AddressSpace::new(alloc).unwrap());
        Self { platform: HostPlatform::new(), sched: MockSched::new(), console, sink, task }
    }

    fn ctx<'a>(&'a self, cpu: &'a mut CpuState) -> TrapContext<'a> {
        TrapContext {
            cpu,
            task: Some(&self.task),
            sched: &self.sched,
            platform: &self.platform,
            console: &self.console,
            syscalls: None,
        }
    }
}

fn user_frame(vector: u64) -> TrapFrame {
    let mut tf = TrapFrame::default();
    tf.trapno = vector;
    tf.cs = 0x23;
    tf.rip = 0x40_0000;
    tf
}

fn kernel_frame(vector: u64) -> TrapFrame {
    let mut tf = TrapFrame::default();
    tf.trapno = vector;
    tf.cs = 0x08;
    tf.rip = (KTEXT_BASE + 0x1000) as u64;
    tf
}

#[test]
fn classification_covers_the_entry_kinds() {
    let dispatcher = TrapDispatcher::new();
    assert_eq!(dispatcher.classify(T_PGFLT), VectorClass::CpuException);
    assert_eq!(dispatcher.classify(T_SYSCALL), VectorClass::Syscall);
    assert_eq!(dispatcher.classify(T_TLBFLUSH), VectorClass::Software);
    assert_eq!(dispatcher.classify(200), VectorClass::Unused);
    let irq = dispatcher.irqs().reserve(Some(&[20])).unwrap();
    struct Nop;
    impl IrqHandler for Nop {
        fn handle_irq(&self) {}
    }
    dispatcher.irqs().register_handler(&irq, Arc::new(Nop));
    assert_eq!(
        dispatcher.classify(T_IRQ0 + 20),
        VectorClass::IrqChain
    );
}

#[test]
fn timer_tick_yields_and_acknowledges() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let mut tf = user_frame(T_IRQ0 + IRQ_TIMER as u64);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert_eq!(fixture.sched.ticks.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.sched.yields.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.platform.eois(), 1);
    assert_eq!(cpu.ticks, 1);
}

#[test]
fn timer_tick_defers_yield_inside_no_sched() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    cpu.no_sched_enter();
    let mut tf = user_frame(T_IRQ0 + IRQ_TIMER as u64);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert_eq!(fixture.sched.yields.load(Ordering::SeqCst), 0);
    assert!(cpu.yield_deferred());
    // Leaving the critical section performs the deferred yield.
    cpu.no_sched_exit(&fixture.sched);
    assert_eq!(fixture.sched.yields.load(Ordering::SeqCst), 1);
}

#[test]
fn registered_chain_runs_and_acknowledges() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    static FIRED: AtomicUsize = AtomicUsize::new(0);
    struct Count;
    impl IrqHandler for Count {
        fn handle_irq(&self) {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }
    }
    let irq = dispatcher.irqs().reserve(Some(&[21])).unwrap();
    dispatcher.irqs().register_handler(&irq, Arc::new(Count));
    let mut cpu = CpuState::new(0);
    let mut tf = user_frame(irq.vector as u64);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.platform.eois(), 1);
    assert_eq!(fixture.platform.legacy_eois(), 1);
}

#[test]
fn user_fault_on_mapped_page_resolves() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let base = fixture
        .task
        .vmap
        .insert(PageDesc::anon(), Some(0x40_0000), 2 * PAGE_SIZE)
        .unwrap();
    let mut cpu = CpuState::new(0);
    let mut tf = user_frame(T_PGFLT);
    tf.err = (crate::mm::FaultInfo::USER | crate::mm::FaultInfo::WRITE).bits() as u64;
    tf.fault_addr = base as u64;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    let (_frame, flags) = fixture.task.vmap.translation(base / PAGE_SIZE).unwrap();
    assert!(flags.contains(HwFlags::WRITE));
    // Interrupt mask restored after the enabled-resolution window.
    assert!(!fixture.platform.interrupts_enabled());
}

#[test]
fn unresolvable_user_fault_kills_the_task() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let mut tf = user_frame(T_PGFLT);
    tf.err = crate::mm::FaultInfo::USER.bits() as u64;
    tf.fault_addr = 0x9999_0000;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(
        dispatcher.dispatch(&mut ctx, &mut tf),
        Disposition::TaskTerminated
    );
    assert_eq!(fixture.sched.signals.load(Ordering::SeqCst), 1);
    assert!(fixture.task.killed());
    // Nothing was allocated for the doomed access.
    assert_eq!(fixture.task.vmap.mapped_pages(), 0);
}

#[test]
fn handled_fault_signal_resumes_the_task() {
    let fixture = Fixture::new();
    fixture.sched.signal_handled.store(true, Ordering::SeqCst);
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let mut tf = user_frame(T_PGFLT);
    tf.err = crate::mm::FaultInfo::USER.bits() as u64;
    tf.fault_addr = 0x9999_0000;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert!(!fixture.task.killed());
}

#[test]
fn secret_region_fault_widens_instead_of_resolving() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let mut tf = kernel_frame(T_PGFLT);
    tf.fault_addr = (SECRET_BASE + 0x4_2000) as u64;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert!(cpu.secret.secrets_mapped());
    assert_eq!(fixture.platform.widenings(), 1);
    // The frame table was never consulted.
    assert_eq!(fixture.task.vmap.mapped_pages(), 0);
    assert_eq!(
        fixture.task.transparent_barriers.load(Ordering::SeqCst),
        1
    );
}

#[test]
fn secret_fault_with_secrets_mapped_is_a_real_kernel_trap() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    cpu.secret
        .ensure_secrets(0x1000, Some(&fixture.task), &fixture.platform);
    let mut tf = kernel_frame(T_PGFLT);
    tf.fault_addr = (SECRET_BASE + 0x4_2000) as u64;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(
        dispatcher.dispatch(&mut ctx, &mut tf),
        Disposition::KernelHalted
    );
    assert!(fixture.sink.contents().contains("kernel trap 14 (#PF)"));
}

#[test]
fn uaccess_fault_redirects_to_recovery() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    fixture.task.begin_uaccess(0xffff_ffff_8004_5000);
    let mut cpu = CpuState::new(0);
    let mut tf = kernel_frame(T_PGFLT);
    // Kernel-mode access to an unmapped user address.
    tf.err = 0;
    tf.fault_addr = 0x5000_0000;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert_eq!(tf.rip, 0xffff_ffff_8004_5000);
    assert_eq!(tf.rax, u64::MAX);
    assert!(!fixture.task.killed());
}

#[test]
fn uaccess_fault_on_mapped_page_resolves_inline() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let base = fixture
        .task
        .vmap
        .insert(PageDesc::anon(), Some(0x7000_0000), PAGE_SIZE)
        .unwrap();
    fixture.task.begin_uaccess(0xffff_ffff_8004_5000);
    let mut cpu = CpuState::new(0);
    let mut tf = kernel_frame(T_PGFLT);
    tf.err = 0;
    tf.fault_addr = base as u64;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    // Resolved, not redirected.
    assert_eq!(tf.rip, (KTEXT_BASE + 0x1000) as u64);
    assert!(fixture.task.vmap.translation(base / PAGE_SIZE).is_some());
}

#[test]
fn illegal_opcode_in_kernel_text_is_emulated() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let mut tf = kernel_frame(T_ILLOP);
    // popcnt rbx, rax: f3 48 0f b8 d8; modrm 0xd8 is mod 11, reg rbx, rm rax.
    fixture.platform.plant_instruction(tf.rip, 0xd8_b8_0f_48_f3);
    tf.rax = 0xff00_ff00;
    let rip_before = tf.rip;
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert_eq!(tf.rbx, 16);
    assert_eq!(tf.rip, rip_before + 5);
}

#[test]
fn illegal_opcode_from_user_mode_kills() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let mut tf = user_frame(T_ILLOP);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(
        dispatcher.dispatch(&mut ctx, &mut tf),
        Disposition::TaskTerminated
    );
    assert!(fixture.task.killed());
}

#[test]
fn unhandled_kernel_trap_reports_and_halts() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(2);
    let mut tf = kernel_frame(crate::trap::T_GPFLT);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(
        dispatcher.dispatch(&mut ctx, &mut tf),
        Disposition::KernelHalted
    );
    let out = fixture.sink.contents();
    assert!(out.contains("kernel trap 13 (#GP)"));
    assert!(out.contains("cpu 2"));
    assert!(fixture.console.panicked());
}

#[test]
fn registered_software_vector_runs_with_secrets() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    fn bump(tf: &mut TrapFrame) {
        tf.r15 = 0x77;
    }
    dispatcher.register_trap_handler(100, bump);
    assert_eq!(dispatcher.classify(100), VectorClass::Software);
    let mut cpu = CpuState::new(0);
    let mut tf = kernel_frame(100);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert_eq!(tf.r15, 0x77);
    assert!(cpu.secret.secrets_mapped());
}

#[test]
fn syscall_vector_routes_through_the_table() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut table = SyscallTable::new();
    install_handlers(&mut table);
    let mut cpu = CpuState::new(0);
    let mut tf = user_frame(T_SYSCALL);
    tf.rax = SYSCALL_YIELD;
    let mut ctx = fixture.ctx(&mut cpu);
    ctx.syscalls = Some(&table);
    assert_eq!(dispatcher.dispatch(&mut ctx, &mut tf), Disposition::Resumed);
    assert_eq!(tf.rax, 0);
    assert_eq!(fixture.sched.yields.load(Ordering::SeqCst), 1);
}

#[test]
fn double_fault_always_halts() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let tf = kernel_frame(crate::trap::T_DBLFLT);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(
        dispatcher.double_fault_entry(&mut ctx, &tf),
        Disposition::KernelHalted
    );
    assert!(fixture.sink.contents().contains("(#DF)"));
}

#[test]
fn attributed_nmi_resumes_and_preserves_intena() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    struct OneShot(AtomicUsize);
    impl NmiSource for OneShot {
        fn poll(&self) -> u32 {
            (self.0.swap(0, Ordering::SeqCst)) as u32
        }
    }
    dispatcher.register_nmi_source(Arc::new(OneShot(AtomicUsize::new(1))));
    let mut cpu = CpuState::new(0);
    cpu.push_cli(&fixture.platform);
    let saved = cpu.save_intena();
    let tf = kernel_frame(crate::trap::T_NMI);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(dispatcher.nmi_entry(&mut ctx, &tf), Disposition::Resumed);
    assert_eq!(cpu.save_intena(), saved);
    // No EOI on the NMI path.
    assert_eq!(fixture.platform.eois(), 0);
}

#[test]
fn unattributed_nmi_without_credit_halts() {
    let fixture = Fixture::new();
    let dispatcher = TrapDispatcher::new();
    let mut cpu = CpuState::new(0);
    let tf = kernel_frame(crate::trap::T_NMI);
    let mut ctx = fixture.ctx(&mut cpu);
    assert_eq!(
        dispatcher.nmi_entry(&mut ctx, &tf),
        Disposition::KernelHalted
    );
    assert!(fixture.sink.contents().contains("NMI"));
}
