// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Locking, reentrant, nestable console sink
//! OWNERS: @kernel-team
//! PUBLIC API: Console, ConsoleOutput, Session, CaptureSink
//! DEPENDS_ON: UART/CGA collaborators behind ConsoleOutput
//! INVARIANTS: the holding context may re-enter (a fault while printing a
//!             diagnostic must still print); the unrecoverable path never
//!             spins forever on a wedged holder

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::types::CpuId;

/// Byte sink behind the console (UART, CGA, a capture buffer in tests).
pub trait ConsoleOutput: Send + Sync {
    fn write_byte(&self, byte: u8);
}

struct ConsState {
    holder: Option<CpuId>,
    nesting: u32,
}

/// The kernel console.
///
/// `enter` gives a session that is reentrant for the same execution
/// context: a nested diagnostic from the holder bumps a nesting count
/// instead of deadlocking. Anonymous sessions (log lines) queue normally.
pub struct Console {
    out: Arc<dyn ConsoleOutput>,
    state: Mutex<ConsState>,
    locking: AtomicBool,
    panicked: AtomicBool,
}

impl Console {
    pub fn new(out: Arc<dyn ConsoleOutput>) -> Self {
        Self {
            out,
            state: Mutex::new(ConsState { holder: None, nesting: 0 }),
            locking: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
        }
    }

    /// Turns locking on once interrupts/secondary cores are live.
    pub fn set_locking(&self, on: bool) {
        self.locking.store(on, Ordering::SeqCst);
    }

    /// Latches the panic state; the platform halts after the report.
    pub fn set_panicked(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    pub fn panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    /// Opens a reentrant session for `cpu`.
    pub fn enter(&self, cpu: CpuId) -> Session<'_> {
        if !self.locking.load(Ordering::SeqCst) {
            return Session { console: self, kind: SessionKind::Unlocked };
        }
        loop {
            let mut state = self.state.lock();
            match state.holder {
                None => {
                    state.holder = Some(cpu);
                    state.nesting = 1;
                    return Session { console: self, kind: SessionKind::Held };
                }
                Some(holder) if holder == cpu => {
                    state.nesting += 1;
                    return Session { console: self, kind: SessionKind::Held };
                }
                Some(_) => {}
            }
            drop(state);
            core::hint::spin_loop();
        }
    }

    /// Opens a queued, non-reentrant session (log lines).
    pub fn enter_anonymous(&self) -> Session<'_> {
        if !self.locking.load(Ordering::SeqCst) {
            return Session { console: self, kind: SessionKind::Unlocked };
        }
        loop {
            let mut state = self.state.lock();
            if state.holder.is_none() {
                state.holder = Some(CpuId::MAX);
                state.nesting = 1;
                return Session { console: self, kind: SessionKind::Held };
            }
            drop(state);
            core::hint::spin_loop();
        }
    }

    /// Session for the unrecoverable-trap path: tries to take the console
    /// for a bounded number of spins, then claims it regardless so the
    /// report always comes out.
    pub fn enter_emergency(&self, cpu: CpuId) -> Session<'_> {
        const TRIES: usize = 1_000_000;
        if !self.locking.load(Ordering::SeqCst) {
            return Session { console: self, kind: SessionKind::Unlocked };
        }
        for _ in 0..TRIES {
            let mut state = self.state.lock();
            match state.holder {
                None => {
                    state.holder = Some(cpu);
                    state.nesting = 1;
                    return Session { console: self, kind: SessionKind::Held };
                }
                Some(holder) if holder == cpu => {
                    state.nesting += 1;
                    return Session { console: self, kind: SessionKind::Held };
                }
                Some(_) => {}
            }
            drop(state);
            core::hint::spin_loop();
        }
        let mut state = self.state.lock();
        state.holder = Some(cpu);
        state.nesting = 1;
        Session { console: self, kind: SessionKind::Held }
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.nesting = state.nesting.saturating_sub(1);
        if state.nesting == 0 {
            state.holder = None;
        }
    }

    fn put(&self, byte: u8) {
        if byte == b'\n' {
            self.out.write_byte(b'\r');
        }
        self.out.write_byte(byte);
    }

    /// Current nesting depth; diagnostic only.
    pub fn nesting(&self) -> u32 {
        self.state.lock().nesting
    }
}

enum SessionKind {
    Held,
    Unlocked,
}

/// An open console session; writing goes straight to the sink.
pub struct Session<'a> {
    console: &'a Console,
    kind: SessionKind,
}

impl fmt::Write for Session<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.console.put(byte);
        }
        Ok(())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let SessionKind::Held = self.kind {
            self.console.exit();
        }
    }
}

/// Capture sink for host tests and the in-memory boot log.
pub struct CaptureSink {
    buf: Mutex<alloc::string::String>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { buf: Mutex::new(alloc::string::String::new()) })
    }

    pub fn contents(&self) -> alloc::string::String {
        self.buf.lock().clone()
    }
}

impl ConsoleOutput for CaptureSink {
    fn write_byte(&self, byte: u8) {
        self.buf.lock().push(byte as char);
    }
}

static GLOBAL: spin::Once<Console> = spin::Once::new();

/// Installs the kernel-wide console used by the log macros.
pub fn init(out: Arc<dyn ConsoleOutput>) {
    GLOBAL.call_once(|| {
        let console = Console::new(out);
        console.set_locking(true);
        console
    });
}

/// The kernel-wide console, if one has been installed.
pub fn global() -> Option<&'static Console> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write as _;

    #[test]
    fn reentry_from_the_holder_nests() {
        let sink = CaptureSink::new();
        let console = Console::new(sink.clone());
        console.set_locking(true);
        let mut outer = console.enter(0);
        write!(outer, "outer ").unwrap();
        {
            let mut inner = console.enter(0);
            write!(inner, "inner").unwrap();
            assert_eq!(console.nesting(), 2);
        }
        assert_eq!(console.nesting(), 1);
        drop(outer);
        assert_eq!(console.nesting(), 0);
        assert_eq!(sink.contents(), "outer inner");
    }

    #[test]
    fn newline_becomes_crlf() {
        let sink = CaptureSink::new();
        let console = Console::new(sink.clone());
        let mut session = console.enter(0);
        writeln!(session, "x").unwrap();
        drop(session);
        assert_eq!(sink.contents(), "x\r\n");
    }

    #[test]
    fn emergency_claims_a_wedged_console() {
        let sink = CaptureSink::new();
        let console = Console::new(sink.clone());
        console.set_locking(true);
        let held = console.enter(1);
        // A different cpu reporting a kernel trap must still get through.
        let mut report = console.enter_emergency(2);
        write!(report, "report").unwrap();
        drop(report);
        drop(held);
        assert_eq!(sink.contents(), "report");
    }
}
