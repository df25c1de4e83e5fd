// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams the dispatch core drives
//! OWNERS: @kernel-team
//! PUBLIC API: Platform trait, host implementation
//! DEPENDS_ON: architecture layer (bare-metal builds) or the host stub
//! INVARIANTS: the core never touches hardware except through these traits

pub mod host;

use crate::types::Asid;

/// Operations the trap/fault core needs from the platform.
pub trait Platform: Send + Sync {
    /// Disables local interrupt delivery; returns whether it was enabled.
    fn interrupts_off(&self) -> bool;
    /// Re-enables local interrupt delivery.
    fn interrupts_on(&self);
    fn interrupts_enabled(&self) -> bool;

    /// Acknowledges the local interrupt controller.
    fn eoi(&self);
    /// Acknowledges the legacy controller for lines routed through it.
    fn legacy_eoi(&self);

    /// Raw instruction bytes at `rip`, for the software-emulated-opcode
    /// backstop. `None` if the text cannot be read.
    fn fetch_instruction(&self, rip: u64) -> Option<u64>;

    /// Installs the full kernel translation for the current context
    /// (secret-mapping widening).
    fn widen_kernel_view(&self);

    /// Drops remote translations tagged with `asid`.
    fn flush_asid(&self, asid: Asid);

    /// Monotonic time in nanoseconds.
    fn now(&self) -> u64;
}
