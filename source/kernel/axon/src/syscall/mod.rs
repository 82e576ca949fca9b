// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, encode_result
//! DEPENDS_ON: mm, task, syscall::api
//! INVARIANTS: Argument and result travel in %eax; every error encodes to u32::MAX (-1)
//!
//! Only calls that complete and resume the caller go through the table. `sys_panic` and
//! `sys_yield` never resume the caller and are handled by the trap dispatcher directly.

pub mod api;

use core::fmt;

use crate::hal::PhysMem;
use crate::trap::{INT_SYS_FORK, INT_SYS_GETPID, INT_SYS_PAGE_ALLOC, INT_SYS_PANIC};
use crate::types::VirtAddr;
use crate::{mm, task};

/// First vector of the syscall window.
const SYSCALL_BASE: u32 = INT_SYS_PANIC;
/// Vectors covered by the table, starting at `SYSCALL_BASE`.
const MAX_SYSCALL: usize = 16;

/// Failure sentinel returned to user code.
pub const SYSCALL_FAILED: u32 = u32::MAX;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall argument: the caller's `%eax`.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    eax: u32,
}

impl Args {
    pub const fn new(eax: u32) -> Self {
        Self { eax }
    }

    pub fn get(&self) -> u32 {
        self.eax
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Vector not present in the dispatch table.
    InvalidSyscall,
    /// Caller has no private address space to operate on.
    NoAddressSpace,
    /// Address is unaligned or outside the process range.
    BadAddress(VirtAddr),
    /// Address is already mapped in the caller's space.
    AlreadyMapped(VirtAddr),
    /// No FREE process slot remains.
    ProcessTableFull,
    /// Ledger refused an allocation.
    Alloc(mm::AllocError),
    /// Address-space manager reported an error.
    AddressSpace(mm::AddressSpaceError),
    /// Process creation failed.
    Spawn(task::SpawnError),
}

impl From<mm::AllocError> for Error {
    fn from(value: mm::AllocError) -> Self {
        Self::Alloc(value)
    }
}

impl From<mm::AddressSpaceError> for Error {
    fn from(value: mm::AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<task::SpawnError> for Error {
    fn from(value: task::SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Maps a handler result onto the `%eax` convention.
pub fn encode_result(result: SysResult<u32>) -> u32 {
    result.unwrap_or(SYSCALL_FAILED)
}

/// Type alias for a syscall handler.
pub type Handler<R> = fn(&mut api::Context<'_, R>, &Args) -> SysResult<u32>;

/// Dispatch table storing handlers by interrupt vector.
pub struct SyscallTable<R: PhysMem> {
    handlers: [Option<Handler<R>>; MAX_SYSCALL],
}

impl<R: PhysMem> Default for SyscallTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: PhysMem> SyscallTable<R> {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        Self { handlers: [None; MAX_SYSCALL] }
    }

    /// Table with every resuming syscall installed.
    pub fn with_default_handlers() -> Self {
        let mut table = Self::new();
        table.register(INT_SYS_GETPID, api::sys_getpid);
        table.register(INT_SYS_PAGE_ALLOC, api::sys_page_alloc);
        table.register(INT_SYS_FORK, api::sys_fork);
        table
    }

    /// Registers a handler for `vector`.
    pub fn register(&mut self, vector: u32, handler: Handler<R>) {
        if let Some(slot) = Self::slot(vector).and_then(|i| self.handlers.get_mut(i)) {
            *slot = Some(handler);
        }
    }

    /// Whether `vector` has a handler.
    pub fn handles(&self, vector: u32) -> bool {
        Self::slot(vector).and_then(|i| self.handlers.get(i)).is_some_and(Option::is_some)
    }

    /// Executes the handler registered for `vector`.
    #[must_use]
    pub fn dispatch(
        &self,
        vector: u32,
        ctx: &mut api::Context<'_, R>,
        args: &Args,
    ) -> SysResult<u32> {
        Self::slot(vector)
            .and_then(|i| self.handlers.get(i))
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }

    fn slot(vector: u32) -> Option<usize> {
        vector.checked_sub(SYSCALL_BASE).map(|i| i as usize)
    }
}
