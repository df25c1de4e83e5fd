// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for IRQ reservation and NMI coalescing
//! OWNERS: @kernel-trap-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - reserve() uniqueness while reservations are held
//!   - reserve() with an accept set only ever returns members of the set
//!   - the NMI swallow credit never underflows, and a storm covered by its
//!     first delivery is never fatal

use proptest::prelude::*;

use super::irq::{IrqRegistry, NUM_LINES};
use super::nmi::{NmiCoalescer, NmiVerdict};

proptest! {
    #[test]
    fn reserved_lines_are_unique_while_held(count in 1usize..64) {
        let registry = IrqRegistry::new();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..count {
            let irq = registry.reserve(None).unwrap();
            prop_assert!(seen.insert(irq.gsi));
        }
    }

    #[test]
    fn accept_set_is_honored(set in proptest::collection::btree_set(0usize..NUM_LINES, 1..8)) {
        let registry = IrqRegistry::new();
        let accept: Vec<usize> = set.iter().copied().collect();
        while let Some(irq) = registry.reserve(Some(&accept)) {
            prop_assert!(set.contains(&irq.gsi));
        }
        // Once the set is exhausted, an unrestricted reserve still works.
        prop_assert!(registry.reserve(None).is_some());
    }

    #[test]
    fn swallow_credit_never_underflows(events in proptest::collection::vec((0u64..4, 0u32..5), 1..64)) {
        let mut nmi = NmiCoalescer::new();
        for (pc, handled) in events {
            let before = nmi.swallow_credit();
            nmi.observe(0x1000 + pc, handled);
            // The credit is a counter, not a difference; it can only grow
            // by handled-1 and shrink by one per swallowed delivery.
            prop_assert!(nmi.swallow_credit() <= before + handled);
        }
    }

    #[test]
    fn storm_paid_for_up_front_is_never_fatal(extra in 0u32..8, echoes in 0u32..8) {
        let mut nmi = NmiCoalescer::new();
        let first = nmi.observe(0x7000, echoes + extra + 1);
        prop_assert_eq!(first, NmiVerdict::Attributed);
        for _ in 0..echoes {
            prop_assert_ne!(nmi.observe(0x7000, 0), NmiVerdict::Fatal);
        }
    }
}
