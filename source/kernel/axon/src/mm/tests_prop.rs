// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for descriptors and the frame table
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - dup() preserves everything but produces detached, shareable state
//!   - insert/remove round-trips leave the table empty
//!   - find_unmapped never returns an occupied window

use alloc::sync::Arc;
use proptest::prelude::*;

use super::descriptor::{DescFlags, PageDesc};
use super::frame::{FrameAllocator, HeapFrames};
use super::frame_table::FrameTable;
use super::USER_PAGES;

fn arb_flags() -> impl Strategy<Value = DescFlags> {
    (0u64..32).prop_map(DescFlags::from_bits_truncate)
}

fn arb_range() -> impl Strategy<Value = (usize, usize)> {
    // Page index and length, kept inside the user half.
    (0x100usize..USER_PAGES - 64, 1usize..64)
}

proptest! {
    #[test]
    fn dup_preserves_flags_and_shares_the_frame(flags in arb_flags(), with_frame in any::<bool>()) {
        let alloc = HeapFrames::new();
        let mut desc = PageDesc::unmapped();
        desc.flags = flags;
        if with_frame {
            desc.frame = alloc.alloc_frame();
        }
        let twin = desc.dup();
        prop_assert_eq!(twin.flags, desc.flags);
        prop_assert_eq!(twin.start, desc.start);
        prop_assert_eq!(twin.frame.is_some(), with_frame);
        if let (Some(a), Some(b)) = (&desc.frame, &twin.frame) {
            prop_assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn insert_remove_roundtrip_empties_the_table((vpn, pages) in arb_range()) {
        let table = FrameTable::new();
        table.insert_range(&PageDesc::anon(), vpn, pages).unwrap();
        prop_assert_eq!(table.mapped_pages(), pages);
        let removed = table.remove_range(vpn, pages);
        prop_assert_eq!(removed.len(), pages);
        prop_assert_eq!(table.mapped_pages(), 0);
    }

    #[test]
    fn found_windows_are_actually_unmapped(
        (vpn, pages) in arb_range(),
        want in 1usize..32,
    ) {
        let table = FrameTable::new();
        table.insert_range(&PageDesc::anon(), vpn, pages).unwrap();
        let found = table.find_unmapped(want).unwrap();
        // The returned window must not intersect the occupied range.
        prop_assert!(found + want <= vpn || found >= vpn + pages);
        table.insert_range(&PageDesc::anon(), found, want).unwrap();
    }

    #[test]
    fn partial_remove_keeps_the_rest((vpn, pages) in arb_range()) {
        prop_assume!(pages >= 2);
        let table = FrameTable::new();
        table.insert_range(&PageDesc::anon(), vpn, pages).unwrap();
        table.remove_range(vpn, 1);
        prop_assert_eq!(table.mapped_pages(), pages - 1);
        prop_assert!(table.slot(vpn).is_none());
        prop_assert!(table.slot(vpn + 1).is_some());
    }
}
