// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Named boot parameters read by the fault and trap paths
//! OWNERS: @kernel-team
//! PUBLIC API: Params, init, get, view_param
//! DEPENDS_ON: loader collaborator (parsing is out of scope; values arrive typed)
//! INVARIANTS: initialized at most once, before the last core starts
//!             handling interrupts; reads are lock-free afterwards

use spin::Once;

/// Tunables consulted at fault/trap time.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    /// Record the instruction pointers that cause secret-mapping widenings.
    pub track_wb_crossings: bool,
    /// Log spurious interrupt vectors instead of dropping them silently.
    pub report_spurious_irqs: bool,
    /// Capacity of the per-address-space quasi-visible scratch pool.
    pub scratch_pool_pages: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            track_wb_crossings: false,
            report_spurious_irqs: true,
            scratch_pool_pages: 128,
        }
    }
}

/// A parameter value as seen through the name-based read contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    Count(usize),
}

static PARAMS: Once<Params> = Once::new();

/// Installs the boot-time parameter set. Later calls are ignored.
pub fn init(params: Params) {
    PARAMS.call_once(|| params);
}

/// The active parameter set, or compiled-in defaults before `init`.
pub fn get() -> Params {
    PARAMS.get().copied().unwrap_or_default()
}

/// Name-based read contract used by collaborators: `Some(value)` for a
/// known parameter, `None` otherwise.
pub fn view_param(name: &str) -> Option<ParamValue> {
    let params = get();
    match name {
        "track_wb_crossings" => Some(ParamValue::Bool(params.track_wb_crossings)),
        "report_spurious_irqs" => Some(ParamValue::Bool(params.report_spurious_irqs)),
        "scratch_pool_pages" => Some(ParamValue::Count(params.scratch_pool_pages)),
        _ => None,
    }
}
