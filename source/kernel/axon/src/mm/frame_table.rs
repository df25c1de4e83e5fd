// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sparse, lockable table of per-page descriptors
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameTable, PageSlot
//! DEPENDS_ON: mm::descriptor
//! INVARIANTS: structural mutations happen under the table lock; per-page
//!             state is guarded by the node lock, taken after the table
//!             lock is dropped so disjoint pages never serialize

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::descriptor::PageDesc;
use super::{MmError, USER_PAGES};

/// One table node: the fine-grained lock plus the descriptor it guards.
pub type PageSlot = Mutex<PageDesc>;

/// First page index considered by the unmapped-window search; keeps the
/// null page and its neighborhood permanently unmapped.
const FIRST_SEARCH_PAGE: usize = 0x100;

struct TableInner {
    slots: BTreeMap<usize, Arc<PageSlot>>,
    /// Where the last first-fit search left off.
    unmapped_hint: usize,
}

/// Associative structure from virtual page index to descriptor node.
///
/// The map itself is the "structural" level: inserts and removes of nodes
/// take `inner`; pointwise descriptor edits take only the node lock of an
/// `Arc` obtained while the structural lock was held.
pub struct FrameTable {
    inner: Mutex<TableInner>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: BTreeMap::new(),
                unmapped_hint: FIRST_SEARCH_PAGE,
            }),
        }
    }

    /// Node covering `vpn`, if one exists.
    pub fn slot(&self, vpn: usize) -> Option<Arc<PageSlot>> {
        self.inner.lock().slots.get(&vpn).cloned()
    }

    /// Installs a duplicate of `desc` on every page of the range.
    ///
    /// Fails without side effects if any page of the range already has a
    /// node or the range leaves the user half.
    pub fn insert_range(&self, desc: &PageDesc, vpn: usize, pages: usize) -> Result<(), MmError> {
        let end = vpn.checked_add(pages).ok_or(MmError::OutOfRange)?;
        if end > USER_PAGES {
            return Err(MmError::OutOfRange);
        }
        let mut inner = self.inner.lock();
        if inner.slots.range(vpn..end).next().is_some() {
            return Err(MmError::NoSpace);
        }
        for page in vpn..end {
            inner.slots.insert(page, Arc::new(Mutex::new(desc.dup())));
        }
        Ok(())
    }

    /// Installs an already-built node at `vpn` (used by `copy`).
    pub fn adopt(&self, vpn: usize, slot: Arc<PageSlot>) {
        self.inner.lock().slots.insert(vpn, slot);
    }

    /// Detaches every node in the range and returns them for teardown.
    /// Nodes outside the range are untouched.
    pub fn remove_range(&self, vpn: usize, pages: usize) -> Vec<Arc<PageSlot>> {
        let end = vpn.saturating_add(pages);
        let mut inner = self.inner.lock();
        let victims: Vec<usize> = inner.slots.range(vpn..end).map(|(k, _)| *k).collect();
        let mut hint = inner.unmapped_hint;
        let mut removed = Vec::with_capacity(victims.len());
        for page in victims {
            if let Some(slot) = inner.slots.remove(&page) {
                removed.push(slot);
            }
            hint = hint.min(page);
        }
        inner.unmapped_hint = hint.max(FIRST_SEARCH_PAGE);
        removed
    }

    /// Nodes currently covering the range, in ascending page order.
    pub fn range(&self, vpn: usize, pages: usize) -> Vec<(usize, Arc<PageSlot>)> {
        let end = vpn.saturating_add(pages);
        self.inner
            .lock()
            .slots
            .range(vpn..end)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Every node in the table, in ascending page order.
    pub fn snapshot(&self) -> Vec<(usize, Arc<PageSlot>)> {
        self.inner.lock().slots.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// First-fit search for an unmapped window of `pages` pages.
    ///
    /// Remembers where the previous search ended so repeated allocations
    /// stay near-amortized-constant; wraps to the bottom of the user half
    /// before giving up.
    pub fn find_unmapped(&self, pages: usize) -> Option<usize> {
        if pages == 0 || pages > USER_PAGES {
            return None;
        }
        let mut inner = self.inner.lock();
        let hint = inner.unmapped_hint;
        let found = Self::scan(&inner.slots, hint, USER_PAGES, pages)
            .or_else(|| Self::scan(&inner.slots, FIRST_SEARCH_PAGE, hint, pages))?;
        inner.unmapped_hint = found + pages;
        Some(found)
    }

    fn scan(
        slots: &BTreeMap<usize, Arc<PageSlot>>,
        mut candidate: usize,
        limit: usize,
        pages: usize,
    ) -> Option<usize> {
        while candidate.checked_add(pages)? <= limit {
            match slots.range(candidate..candidate + pages).next() {
                None => return Some(candidate),
                Some((occupied, _)) => candidate = occupied + 1,
            }
        }
        None
    }

    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_overlap_without_side_effects() {
        let table = FrameTable::new();
        table.insert_range(&PageDesc::anon(), 0x400, 3).unwrap();
        assert_eq!(
            table.insert_range(&PageDesc::anon(), 0x402, 2),
            Err(MmError::NoSpace)
        );
        // The overlapping attempt must not have installed a partial range.
        assert!(table.slot(0x403).is_none());
        assert_eq!(table.mapped_pages(), 3);
    }

    #[test]
    fn insert_rejects_out_of_range() {
        let table = FrameTable::new();
        assert_eq!(
            table.insert_range(&PageDesc::anon(), USER_PAGES - 1, 2),
            Err(MmError::OutOfRange)
        );
    }

    #[test]
    fn remove_range_leaves_neighbors() {
        let table = FrameTable::new();
        table.insert_range(&PageDesc::anon(), 0x400, 2).unwrap();
        table.insert_range(&PageDesc::anon(), 0x500, 2).unwrap();
        let removed = table.remove_range(0x400, 2);
        assert_eq!(removed.len(), 2);
        assert!(table.slot(0x400).is_none());
        assert!(table.slot(0x500).is_some());
        assert!(table.slot(0x501).is_some());
    }

    #[test]
    fn find_unmapped_skips_existing_and_advances_hint() {
        let table = FrameTable::new();
        let first = table.find_unmapped(4).unwrap();
        table.insert_range(&PageDesc::anon(), first, 4).unwrap();
        let second = table.find_unmapped(4).unwrap();
        assert!(second >= first + 4);
        table.insert_range(&PageDesc::anon(), second, 4).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn find_unmapped_revisits_freed_space() {
        let table = FrameTable::new();
        let first = table.find_unmapped(2).unwrap();
        table.insert_range(&PageDesc::anon(), first, 2).unwrap();
        let second = table.find_unmapped(2).unwrap();
        table.insert_range(&PageDesc::anon(), second, 2).unwrap();
        table.remove_range(first, 2);
        // Removal pulls the hint back, so the freed window is found again.
        let again = table.find_unmapped(2).unwrap();
        assert_eq!(again, first);
    }
}
