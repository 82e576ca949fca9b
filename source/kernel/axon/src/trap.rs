// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap frame layout, interrupt vectors and dispatch outcomes
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, INT_* vectors, PageFault, Dispatch, Fatal
//! DEPENDS_ON: mm::InvariantViolation, types
//! INVARIANTS: TrapFrame matches the push order of the external vector stubs
//!             (pushal, %es, %ds, intno, err, then the CPU-pushed iret frame)

use alloc::string::String;
use bitflags::bitflags;
use core::fmt;
use static_assertions::const_assert_eq;

use crate::mm::InvariantViolation;
use crate::types::{Pid, VirtAddr};

/// Page fault.
pub const INT_PAGEFAULT: u32 = 14;
/// Interval timer.
pub const INT_TIMER: u32 = 32;
/// `sys_panic(msg)`: halt the machine with a user message.
pub const INT_SYS_PANIC: u32 = 48;
/// `sys_getpid() -> pid`.
pub const INT_SYS_GETPID: u32 = 49;
/// `sys_yield()`.
pub const INT_SYS_YIELD: u32 = 50;
/// `sys_page_alloc(va) -> 0 | -1`.
pub const INT_SYS_PAGE_ALLOC: u32 = 51;
/// `sys_fork() -> child pid | 0 | -1`.
pub const INT_SYS_FORK: u32 = 52;

/// Code segment selector for user mode (GDT slot 3, RPL 3).
pub const SEGSEL_APP_CODE: u32 = 0x18 | 3;
/// Data segment selector for user mode (GDT slot 4, RPL 3).
pub const SEGSEL_APP_DATA: u32 = 0x20 | 3;
/// `%eflags` interrupt-enable bit.
pub const EFLAGS_IF: u32 = 1 << 9;

/// Saved user register state.
///
/// Segment selectors occupy the low 16 bits of their slot; the high bits are padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// `%esp` as pushed by `pushal`; ignored by `popal`.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub es: u32,
    pub ds: u32,
    /// Interrupt vector.
    pub intno: u32,
    /// Error code pushed by the CPU, or 0.
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

const_assert_eq!(core::mem::size_of::<TrapFrame>(), 17 * 4);

impl TrapFrame {
    /// Fresh user-mode frame: zeroed registers, user segments, interrupts enabled.
    pub const fn user() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            oesp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            es: SEGSEL_APP_DATA,
            ds: SEGSEL_APP_DATA,
            intno: 0,
            err: 0,
            eip: 0,
            cs: SEGSEL_APP_CODE,
            eflags: EFLAGS_IF,
            esp: 0,
            ss: SEGSEL_APP_DATA,
        }
    }
}

bitflags! {
    /// Page-fault error code bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// Protection violation (clear: page not present).
        const PRESENT = 1 << 0;
        /// Write access (clear: read).
        const WRITE = 1 << 1;
        /// Fault raised in user mode.
        const USER = 1 << 2;
    }
}

/// Decoded page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: VirtAddr,
    pub code: PageFaultCode,
    pub eip: u32,
}

impl PageFault {
    pub fn new(addr: usize, err: u32, eip: u32) -> Self {
        Self { addr: VirtAddr::new(addr), code: PageFaultCode::from_bits_truncate(err), eip }
    }

    pub fn is_user(&self) -> bool {
        self.code.contains(PageFaultCode::USER)
    }

    pub fn operation(&self) -> &'static str {
        if self.code.contains(PageFaultCode::WRITE) {
            "write"
        } else {
            "read"
        }
    }

    pub fn problem(&self) -> &'static str {
        if self.code.contains(PageFaultCode::PRESENT) {
            "protection problem"
        } else {
            "missing page"
        }
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X} ({} {}, eip={:#x})",
            self.addr.raw(),
            self.operation(),
            self.problem(),
            self.eip
        )
    }
}

/// What the CPU does once a trap has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Resume the given process.
    Resume(Pid),
    /// Nothing is runnable; spin until something changes or the operator aborts.
    Idle,
}

/// Conditions that stop the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fatal {
    /// A process invoked `sys_panic`.
    Panic { pid: Pid, message: String },
    /// The kernel itself faulted.
    KernelPageFault(PageFault),
    /// No handler exists for the vector.
    UnexpectedInterrupt { intno: u32 },
    /// Virtual-memory bookkeeping is inconsistent.
    Invariant(InvariantViolation),
}

impl From<InvariantViolation> for Fatal {
    fn from(value: InvariantViolation) -> Self {
        Self::Invariant(value)
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panic { pid, message } => write!(f, "PANIC (pid {pid}): {message}"),
            Self::KernelPageFault(fault) => write!(f, "Kernel page fault for {fault}!"),
            Self::UnexpectedInterrupt { intno } => write!(f, "Unexpected interrupt {intno}!"),
            Self::Invariant(violation) => write!(f, "virtual memory check failed: {violation}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn page_fault_decodes_error_bits() {
        let fault = PageFault::new(0x20_0000, 0b110, 0x10_0040);
        assert!(fault.is_user());
        assert_eq!(fault.operation(), "write");
        assert_eq!(fault.problem(), "missing page");
        assert_eq!(fault.to_string(), "00200000 (write missing page, eip=0x100040)");

        let kernel = PageFault::new(0x1000, 0b001, 0x4_1000);
        assert!(!kernel.is_user());
        assert_eq!(kernel.operation(), "read");
        assert_eq!(kernel.problem(), "protection problem");
    }

    #[test]
    fn user_frame_targets_ring_three() {
        let frame = TrapFrame::user();
        assert_eq!(frame.cs, SEGSEL_APP_CODE);
        assert_eq!(frame.cs & 3, 3);
        assert_eq!(frame.eflags & EFLAGS_IF, EFLAGS_IF);
        assert_eq!(frame.ss, SEGSEL_APP_DATA);
    }

    #[test]
    fn fatal_messages_match_console_wording() {
        assert_eq!(
            Fatal::UnexpectedInterrupt { intno: 7 }.to_string(),
            "Unexpected interrupt 7!"
        );
        let fault = PageFault::new(0x10, 0, 0x4_0000);
        assert_eq!(
            Fatal::KernelPageFault(fault).to_string(),
            "Kernel page fault for 00000010 (read missing page, eip=0x40000)!"
        );
    }
}
