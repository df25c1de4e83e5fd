// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for safer decoding at the syscall/fault boundary
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PageLen, Pid, CpuId, Asid
//! DEPENDS_ON: mm::layout (canonical form, PAGE_SIZE)
//! INVARIANTS: Enforce canonical addresses and page alignment at construction;
//!             prevent type confusion between pids, cpu ids and ASIDs

use crate::mm::{is_canonical, PAGE_SIZE};
use core::fmt;

/// Task identifier.
pub type Pid = u32;

/// Logical execution context (one per hardware thread).
pub type CpuId = u32;

/// Address-space identifier used to tag cached hardware translations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Asid(pub u16);

/// A canonical virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// A canonical, page-aligned virtual address.
    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.0 % PAGE_SIZE == 0)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    /// Index of the page containing this address.
    #[inline]
    pub fn vpn(self) -> usize {
        self.0 / PAGE_SIZE
    }

    /// Byte offset within the containing page.
    #[inline]
    pub fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<usize> {
        self.0.checked_add(bytes)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A non-zero, page-multiple byte length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageLen(usize);

impl PageLen {
    #[inline]
    pub fn from_bytes_aligned(bytes: usize) -> Option<Self> {
        if bytes == 0 || bytes % PAGE_SIZE != 0 {
            return None;
        }
        Some(Self(bytes))
    }

    /// Length covering `pages` whole pages.
    #[inline]
    pub fn from_pages(pages: usize) -> Option<Self> {
        pages.checked_mul(PAGE_SIZE).and_then(Self::from_bytes_aligned)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn pages(self) -> usize {
        self.0 / PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_aligned_rejects_offsets() {
        assert!(VirtAddr::page_aligned(0x1000).is_some());
        assert!(VirtAddr::page_aligned(0x1001).is_none());
    }

    #[test]
    fn page_len_rejects_zero_and_partial() {
        assert!(PageLen::from_bytes_aligned(0).is_none());
        assert!(PageLen::from_bytes_aligned(PAGE_SIZE + 1).is_none());
        assert_eq!(PageLen::from_pages(3).map(PageLen::pages), Some(3));
    }

    #[test]
    fn vpn_and_offset_split_the_address() {
        let va = VirtAddr::new(0x3_2084).unwrap();
        assert_eq!(va.vpn(), 0x32);
        assert_eq!(va.page_offset(), 0x84);
    }
}
