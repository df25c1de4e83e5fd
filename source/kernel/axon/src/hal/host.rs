// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic host implementation of the platform seams
//! OWNERS: @kernel-team
//! PUBLIC API: HostPlatform
//! DEPENDS_ON: none
//! INVARIANTS: fully observable: every acknowledge and widen is counted

extern crate alloc;

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use super::Platform;
use crate::types::Asid;

/// Host stand-in for the hardware: interrupt-enable flag, programmable
/// text bytes for the emulation path, and counters for everything else.
pub struct HostPlatform {
    int_enabled: AtomicBool,
    eois: AtomicUsize,
    legacy_eois: AtomicUsize,
    widenings: AtomicUsize,
    flushes: AtomicUsize,
    clock: AtomicU64,
    text: Mutex<BTreeMap<u64, u64>>,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            int_enabled: AtomicBool::new(true),
            eois: AtomicUsize::new(0),
            legacy_eois: AtomicUsize::new(0),
            widenings: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            text: Mutex::new(BTreeMap::new()),
        }
    }

    /// Plants raw instruction bytes at `rip` for `fetch_instruction`.
    pub fn plant_instruction(&self, rip: u64, bytes: u64) {
        self.text.lock().insert(rip, bytes);
    }

    pub fn eois(&self) -> usize {
        self.eois.load(Ordering::SeqCst)
    }

    pub fn legacy_eois(&self) -> usize {
        self.legacy_eois.load(Ordering::SeqCst)
    }

    pub fn widenings(&self) -> usize {
        self.widenings.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn advance_clock(&self, ns: u64) {
        self.clock.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HostPlatform {
    fn interrupts_off(&self) -> bool {
        self.int_enabled.swap(false, Ordering::SeqCst)
    }

    fn interrupts_on(&self) {
        self.int_enabled.store(true, Ordering::SeqCst);
    }

    fn interrupts_enabled(&self) -> bool {
        self.int_enabled.load(Ordering::SeqCst)
    }

    fn eoi(&self) {
        self.eois.fetch_add(1, Ordering::SeqCst);
    }

    fn legacy_eoi(&self) {
        self.legacy_eois.fetch_add(1, Ordering::SeqCst);
    }

    fn fetch_instruction(&self, rip: u64) -> Option<u64> {
        self.text.lock().get(&rip).copied()
    }

    fn widen_kernel_view(&self) {
        self.widenings.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_asid(&self, _asid: Asid) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}
