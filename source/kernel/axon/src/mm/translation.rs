// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-address-space model of installed hardware translations
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TranslationCache, HwFlags, alloc_asid, free_asid
//! DEPENDS_ON: mm::frame
//! INVARIANTS: an entry never outlives its descriptor's mapping; narrowing
//!             a permission always removes the stale wider entry first

extern crate alloc;

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use spin::Mutex;

use super::frame::FrameRef;
use crate::types::Asid;

bitflags! {
    /// Permissions actually installed in the hardware page table.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HwFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        /// Short-lived quasi-visible alias, not backed by a descriptor.
        const SCRATCH = 1 << 3;
    }
}

struct HwEntry {
    frame: FrameRef,
    flags: HwFlags,
}

/// The subset of an address space's mappings the hardware can currently
/// translate. Faults consult the descriptor table and then install here;
/// `remove`/`protect` invalidate here so no stale permissive translation
/// survives.
pub struct TranslationCache {
    asid: Asid,
    entries: BTreeMap<usize, HwEntry>,
    /// Bumped on every invalidation; stands in for the shootdown the
    /// hardware layer performs on the real page table.
    generation: u64,
}

impl TranslationCache {
    pub fn new(asid: Asid) -> Self {
        Self { asid, entries: BTreeMap::new(), generation: 0 }
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    pub fn install(&mut self, vpn: usize, frame: FrameRef, flags: HwFlags) {
        debug_assert!(flags.contains(HwFlags::PRESENT));
        self.entries.insert(vpn, HwEntry { frame, flags });
    }

    /// Translation for `vpn`, if installed.
    pub fn lookup(&self, vpn: usize) -> Option<(FrameRef, HwFlags)> {
        self.entries.get(&vpn).map(|e| (e.frame.clone(), e.flags))
    }

    pub fn invalidate(&mut self, vpn: usize) {
        if self.entries.remove(&vpn).is_some() {
            self.generation += 1;
        }
    }

    /// Drops every translation (including scratch aliases) in the range.
    pub fn invalidate_range(&mut self, vpn: usize, pages: usize) {
        let end = vpn.saturating_add(pages);
        let victims: alloc::vec::Vec<usize> =
            self.entries.range(vpn..end).map(|(k, _)| *k).collect();
        for page in victims {
            self.entries.remove(&page);
            self.generation += 1;
        }
    }

    pub fn invalidate_all(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.generation += 1;
        }
    }

    /// Number of invalidations performed; observable by tests asserting
    /// that narrowing operations actually shoot translations down.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn installed_pages(&self) -> usize {
        self.entries.len()
    }
}

/// Maximum ASIDs made available by the allocator; ASID 0 is reserved for
/// the kernel's own global mappings.
const MAX_ASIDS: usize = 4096;
const WORD_BITS: usize = u64::BITS as usize;
const BITMAP_WORDS: usize = MAX_ASIDS / WORD_BITS;

struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        bitmap[0] = 1;
        Self { bitmap, next: 1 }
    }

    fn allocate(&mut self) -> Option<Asid> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            self.next = (index + 1) % MAX_ASIDS;
            let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(Asid(index as u16));
            }
        }
        None
    }

    fn free(&mut self, asid: Asid) {
        let index = asid.0 as usize;
        if index != 0 && index < MAX_ASIDS {
            self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }
}

static ASIDS: Mutex<AsidAllocator> = Mutex::new(AsidAllocator::new());

pub fn alloc_asid() -> Option<Asid> {
    ASIDS.lock().allocate()
}

pub fn free_asid(asid: Asid) {
    ASIDS.lock().free(asid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::{FrameAllocator, HeapFrames};

    #[test]
    fn narrowing_bumps_the_generation() {
        let alloc = HeapFrames::new();
        let mut cache = TranslationCache::new(Asid(1));
        let frame = alloc.alloc_frame().unwrap();
        cache.install(7, frame, HwFlags::PRESENT | HwFlags::USER | HwFlags::WRITE);
        let before = cache.generation();
        cache.invalidate(7);
        assert_eq!(cache.generation(), before + 1);
        assert!(cache.lookup(7).is_none());
        // Invalidating an absent entry is not a shootdown.
        cache.invalidate(7);
        assert_eq!(cache.generation(), before + 1);
    }

    #[test]
    fn asids_are_unique_until_freed() {
        let a = alloc_asid().unwrap();
        let b = alloc_asid().unwrap();
        assert_ne!(a, b);
        assert_ne!(a.0, 0);
        free_asid(a);
        free_asid(b);
    }
}
