// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel console used for log output.
//!
//! On bare-metal x86 this drives the COM1 16550 UART through port I/O. Host builds keep
//! the most recent output in a bounded in-memory buffer so tests can inspect it.

use core::fmt::{self, Write};
use spin::Mutex;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
use alloc::string::String;

/// I/O port base of the first serial port.
#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
pub(crate) const COM1: u16 = 0x3f8;
#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
const UART_LSR: u16 = 5;
#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
const LSR_TX_IDLE: u8 = 1 << 5;
#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
const LSR_RX_READY: u8 = 1 << 0;

/// Bytes retained by the host capture buffer before old output is discarded.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
const CAPTURE_LIMIT: usize = 64 * 1024;

static CONSOLE: Mutex<KernelUart> = Mutex::new(KernelUart::new(COM1));

/// Console writer; lock it through [`KernelUart::lock`].
pub struct KernelUart {
    #[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
    port: u16,
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    captured: String,
}

impl KernelUart {
    const fn new(port: u16) -> Self {
        Self {
            port,
            #[cfg(not(all(target_arch = "x86", target_os = "none")))]
            captured: String::new(),
        }
    }

    /// Returns a guard for the console singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        CONSOLE.lock()
    }

    /// Like [`KernelUart::lock`] but gives up if the console is already held.
    pub fn try_lock() -> Option<spin::MutexGuard<'static, KernelUart>> {
        CONSOLE.try_lock()
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn write_byte(&mut self, byte: u8) {
        while crate::arch::x86::inb(self.port + UART_LSR) & LSR_TX_IDLE == 0 {}
        crate::arch::x86::outb(self.port, byte);
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn capture(&mut self, s: &str) {
        if self.captured.len() + s.len() > CAPTURE_LIMIT {
            let keep_from = self.captured.len() / 2;
            let cut = (keep_from..self.captured.len())
                .find(|&i| self.captured.is_char_boundary(i))
                .unwrap_or(self.captured.len());
            self.captured.drain(..cut);
        }
        self.captured.push_str(s);
    }

    /// Returns the next byte received on the serial line, if any.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub fn try_read_byte(&mut self) -> Option<u8> {
        if crate::arch::x86::inb(self.port + UART_LSR) & LSR_RX_READY == 0 {
            return None;
        }
        Some(crate::arch::x86::inb(self.port))
    }
}

impl Write for KernelUart {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.capture(s);
        Ok(())
    }
}

/// Drains and returns everything written to the host console so far.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn take_captured() -> String {
    core::mem::take(&mut KernelUart::lock().captured)
}
