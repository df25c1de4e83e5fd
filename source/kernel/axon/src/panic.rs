// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unified panic handler for no_std kernel images
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: console (emergency session)
//! INVARIANTS: minimal formatting; no allocations; never panics again

use core::fmt::Write;
use core::panic::PanicInfo;

/// Emits a panic message including the source location, then parks the
/// core. Uses the emergency console path so a wedged holder cannot block
/// the last words.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(console) = crate::console::global() {
        let mut session = console.enter_emergency(0);
        let _ = session.write_str("\npanic: ");
        if let Some(location) = info.location() {
            let _ = write!(session, "{}:{}: ", location.file(), location.line());
        }
        let _ = write!(session, "{}", info.message());
        let _ = session.write_str("\n");
        drop(session);
        console.set_panicked();
    }
    loop {
        core::hint::spin_loop();
    }
}
