// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory core: descriptors, frame table, address spaces
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, PageDesc, DescFlags, FaultInfo, Pageable, FrameRef
//! DEPENDS_ON: frame-allocator collaborator (trait seam), cmdline, diag
//! INVARIANTS: structural lock before page lock; no translation survives a
//!             permission narrowing; failures are Results up to the trap boundary

extern crate alloc;

use bitflags::bitflags;

pub mod address_space;
pub mod descriptor;
pub mod frame;
pub mod frame_table;
pub mod pageable;
pub mod translation;

pub use address_space::AddressSpace;
pub use descriptor::{DescFlags, PageDesc};
pub use frame::{Frame, FrameAllocator, FrameRef, HeapFrames};
pub use pageable::{BufferObject, Pageable, PageableError, SharedMemory};
pub use translation::{HwFlags, TranslationCache};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Exclusive top of the user half; everything at or above is kernel territory.
pub const USER_TOP: usize = 0x0000_8000_0000_0000;

/// Base of the kernel-secret region. Data at or above this address stays
/// unmapped from a context's page tables until the context demonstrably
/// needs it (see `trap::secret`). The exact boundary is a platform choice;
/// this constant is the single knob.
pub const SECRET_BASE: usize = 0xffff_ff00_0000_0000;

/// Kernel text window used by the illegal-opcode emulation path.
pub const KTEXT_BASE: usize = 0xffff_ffff_8000_0000;
pub const KTEXT_END: usize = 0xffff_ffff_c000_0000;

static_assertions::const_assert!(USER_TOP % PAGE_SIZE == 0);
static_assertions::const_assert!(SECRET_BASE >= USER_TOP);

/// Highest user-mappable page index (exclusive).
pub const USER_PAGES: usize = USER_TOP / PAGE_SIZE;

/// True for addresses in canonical form (low or high half of the 48-bit split).
#[inline]
pub const fn is_canonical(addr: usize) -> bool {
    addr < USER_TOP || addr >= 0xffff_8000_0000_0000
}

/// Error returned by address-space mutation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Start or length was not page aligned.
    Unaligned,
    /// Range extends beyond the user half.
    OutOfRange,
    /// Range overlaps an existing mapping, or no unmapped window of the
    /// requested length exists.
    NoSpace,
    /// The physical frame allocator is exhausted.
    OutOfFrames,
    /// Heap shrink below the floor, or a nonsensical brk target.
    BadBrk,
    /// No more ASIDs are available.
    AsidExhausted,
}

/// Why a page fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No descriptor covers the address, or the access violates protection
    /// with no copy-on-write or demand path to take.
    Unresolved,
    /// A frame was needed and the allocator had none.
    OutOfFrames,
}

bitflags! {
    /// Hardware page-fault error-code bits as delivered with the vector.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultInfo: u32 {
        /// Fault on a present page (protection), not a missing one.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The access originated in user mode.
        const USER = 1 << 2;
    }
}

impl FaultInfo {
    #[inline]
    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    #[inline]
    pub fn from_user(self) -> bool {
        self.contains(Self::USER)
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use core::sync::atomic::{AtomicBool, Ordering};

    pub(crate) static DENY_NEXT_FRAME_ALLOC: AtomicBool = AtomicBool::new(false);

    /// Forces the next frame allocation to fail, regardless of allocator state.
    pub fn deny_next_frame_alloc() {
        DENY_NEXT_FRAME_ALLOC.store(true, Ordering::SeqCst);
    }

    pub(crate) fn frame_alloc_denied() -> bool {
        DENY_NEXT_FRAME_ALLOC.swap(false, Ordering::SeqCst)
    }
}

mod tests_prop;
