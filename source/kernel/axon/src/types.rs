// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for addresses and process ids
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, PhysAddr, VirtAddr
//! DEPENDS_ON: mm::PAGE_SIZE
//! INVARIANTS: Pid 0 is never handed to a process; alignment helpers never wrap
//!
//! Physical and virtual addresses are distinct types so a page-table walk can never be fed
//! a user address where a physical one is expected (and vice versa).

use core::fmt;

use crate::mm::PAGE_SIZE;

/// Process identifier; doubles as the index of the process-table slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Slot 0: reserved, never runs.
    pub const RESERVED: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into the process table.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical memory address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Address of the page containing `self`.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Virtual address inside some address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns `Some` only for page-aligned addresses.
    #[inline]
    pub const fn page_aligned(addr: usize) -> Option<Self> {
        if addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_helpers_split_address() {
        let pa = PhysAddr::new(0x12345);
        assert_eq!(pa.page_base(), PhysAddr::new(0x12000));
        assert_eq!(pa.page_offset(), 0x345);
        assert!(!pa.is_page_aligned());
        assert!(VirtAddr::page_aligned(0x1000).is_some());
        assert!(VirtAddr::page_aligned(0x1001).is_none());
    }

    #[test]
    fn checked_add_detects_overflow() {
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
        assert_eq!(PhysAddr::new(0x1000).checked_add(0x1000), Some(PhysAddr::new(0x2000)));
    }
}
