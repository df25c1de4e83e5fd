// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-virtual-page mapping descriptor
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageDesc, DescFlags
//! DEPENDS_ON: mm::frame, mm::pageable
//! INVARIANTS: COW only on mapped descriptors with a shareable frame; a
//!             descriptor without a frame never reaches hardware writable

extern crate alloc;

use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;

use super::frame::FrameRef;
use super::pageable::Pageable;
use super::PAGE_SIZE;

bitflags! {
    /// Mapping-state bits of one virtual page frame.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u64 {
        /// This virtual page frame has been mapped.
        const MAPPED = 1 << 0;
        /// Copy-on-write: a write fault copies the page and clears this bit,
        /// a read fault maps the existing page read-only.
        const COW = 1 << 1;
        /// Anonymous memory; cleared when a backing object is attached.
        const ANON = 1 << 2;
        /// The page is writable (descriptor-level permission; the hardware
        /// view may lag behind until a write fault).
        const WRITE = 1 << 3;
        /// Shared across address-space duplication instead of COW'd.
        const SHARED = 1 << 4;
    }
}

/// Metadata for one page of an address space.
///
/// Plays the role a "virtual memory area" plays elsewhere, except it does
/// not know its own size: the frame table stores one of these per page, and
/// a contiguous file mapping produces a run of identical descriptors
/// (identical because `start` is the virtual address of the backing
/// object's byte zero rather than a per-page offset).
pub struct PageDesc {
    pub flags: DescFlags,
    /// The physical frame faulted into this page, if any.
    pub frame: Option<FrameRef>,
    /// Backing object, or `None` for anonymous memory.
    pub backing: Option<Arc<dyn Pageable>>,
    /// Virtual address of the backing object's byte zero; may be negative.
    /// Zero for anonymous memory.
    pub start: i64,
}

impl PageDesc {
    /// Descriptor for unmapped memory.
    pub const fn unmapped() -> Self {
        Self { flags: DescFlags::empty(), frame: None, backing: None, start: 0 }
    }

    /// Writable anonymous memory, faulted in on demand.
    pub fn anon() -> Self {
        Self {
            flags: DescFlags::MAPPED | DescFlags::ANON | DescFlags::WRITE,
            frame: None,
            backing: None,
            start: 0,
        }
    }

    /// Maps `backing` with its byte zero at virtual address `start`.
    pub fn backed(backing: Arc<dyn Pageable>, start: i64) -> Self {
        Self {
            flags: DescFlags::MAPPED | DescFlags::WRITE,
            frame: None,
            backing: Some(backing),
            start,
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.flags.contains(DescFlags::MAPPED)
    }

    /// Logical page index of `va` within the backing object.
    pub fn backing_page(&self, va: usize) -> u64 {
        debug_assert!(self.backing.is_some());
        ((va as i64 - self.start) / PAGE_SIZE as i64) as u64
    }

    /// Duplicates this descriptor for use in another address space.
    ///
    /// The frame and backing references are shared; the duplicate starts
    /// unattached to any per-core translation cache, so the new space must
    /// fault its own hardware mappings in.
    pub fn dup(&self) -> Self {
        Self {
            flags: self.flags,
            frame: self.frame.clone(),
            backing: self.backing.clone(),
            start: self.start,
        }
    }

    /// Drops the frame and backing references, returning to unmapped state.
    pub fn clear(&mut self) {
        self.flags = DescFlags::empty();
        self.frame = None;
        self.backing = None;
        self.start = 0;
    }
}

impl fmt::Debug for PageDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDesc")
            .field("flags", &self.flags)
            .field("frame", &self.frame.as_ref().map(|fr| fr.as_ptr()))
            .field("backed", &self.backing.is_some())
            .field("start", &self.start)
            .finish()
    }
}
