// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler emitting diagnostics over the serial console
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: uart::KernelUart
//! INVARIANTS: No allocation; never returns

use core::fmt::Write;
use core::panic::PanicInfo;

use crate::uart::KernelUart;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // A panic while the console is held would deadlock; skip the report instead.
    if let Some(mut w) = KernelUart::try_lock() {
        let _ = w.write_str("\nPANIC: ");
        if let Some(location) = info.location() {
            let _ = write!(w, "{}:{}: ", location.file(), location.line());
        }
        let _ = writeln!(w, "{}", info.message());
    }
    loop {
        // SAFETY: stopping the CPU with interrupts masked is always sound.
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}
