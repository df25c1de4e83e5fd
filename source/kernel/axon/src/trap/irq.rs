// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware interrupt line registry and handler chains
//! OWNERS: @kernel-trap-team
//! PUBLIC API: IrqRegistry, IrqHandler, Irq
//! DEPENDS_ON: interrupt-controller collaborator (ack happens in dispatch)
//! INVARIANTS: a reserved line is never handed out again while held; chains
//!             fire most-recently-registered first

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use super::T_IRQ0;

/// Number of lines behind the vector window `[T_IRQ0, 256)`.
pub const NUM_LINES: usize = 256 - T_IRQ0 as usize;

/// A device's interrupt callback. Multiple handlers may share one line;
/// each fires unconditionally when the line trips.
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self);
}

/// A successfully reserved interrupt line.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Irq {
    pub gsi: usize,
    pub vector: usize,
    pub level_triggered: bool,
    pub active_low: bool,
}

impl fmt::Debug for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IRQ {}", self.gsi)?;
        match (self.level_triggered, self.active_low) {
            (true, true) => write!(f, " (level low)"),
            (true, false) => write!(f, " (level high)"),
            (false, true) => write!(f, " (falling edge)"),
            (false, false) => write!(f, " (rising edge)"),
        }
    }
}

struct LineState {
    in_use: bool,
    chain: Vec<Arc<dyn IrqHandler>>,
}

/// Allocation state and handler chains for every hardware line.
pub struct IrqRegistry {
    lines: Mutex<Vec<LineState>>,
}

impl IrqRegistry {
    pub fn new() -> Self {
        let mut lines = Vec::with_capacity(NUM_LINES);
        for _ in 0..NUM_LINES {
            lines.push(LineState { in_use: false, chain: Vec::new() });
        }
        Self { lines: Mutex::new(lines) }
    }

    /// Reserves the lines firmware already spoke for: the legacy ISA block,
    /// the spurious vector, and line 255 (unusable for message-signaled
    /// interrupts). Called once at bring-up.
    pub fn reserve_legacy(&self) {
        let mut lines = self.lines.lock();
        for line in lines.iter_mut().take(16) {
            line.in_use = true;
        }
        lines[super::IRQ_SPURIOUS].in_use = true;
        lines[NUM_LINES - 1].in_use = true;
    }

    /// Claims a free line. With `accept` the choice is restricted to that
    /// set; otherwise the scan starts from the top, because system-assigned
    /// lines tend to be low.
    pub fn reserve(&self, accept: Option<&[usize]>) -> Option<Irq> {
        let mut lines = self.lines.lock();
        let gsi = match accept {
            Some(set) => set
                .iter()
                .copied()
                .find(|&gsi| gsi < NUM_LINES && !lines[gsi].in_use)?,
            None => (0..NUM_LINES).rev().find(|&gsi| !lines[gsi].in_use)?,
        };
        lines[gsi].in_use = true;
        Some(Irq {
            gsi,
            vector: T_IRQ0 as usize + gsi,
            level_triggered: false,
            active_low: false,
        })
    }

    /// Appends a handler to the line's chain; it will fire before the
    /// handlers registered earlier.
    pub fn register_handler(&self, irq: &Irq, handler: Arc<dyn IrqHandler>) {
        let mut lines = self.lines.lock();
        debug_assert!(lines[irq.gsi].in_use);
        lines[irq.gsi].chain.push(handler);
    }

    pub fn has_handlers(&self, gsi: usize) -> bool {
        self.lines
            .lock()
            .get(gsi)
            .map_or(false, |line| !line.chain.is_empty())
    }

    /// Runs the chain for `gsi`, most recently registered first; returns
    /// the number of handlers invoked. The chain is cloned out so a handler
    /// may itself take the registry lock.
    pub fn trigger(&self, gsi: usize) -> usize {
        let chain: Vec<Arc<dyn IrqHandler>> = match self.lines.lock().get(gsi) {
            Some(line) => line.chain.iter().rev().cloned().collect(),
            None => return 0,
        };
        for handler in &chain {
            handler.handle_irq();
        }
        chain.len()
    }
}

impl Default for IrqRegistry {
    fn default() -> Self {
        Self::new()
    }
}
