// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! AXON: a uniprocessor kernel core.
//!
//! The crate tracks physical page ownership, builds per-process x86 address spaces,
//! schedules processes round-robin and dispatches traps. Everything above the
//! [`hal::Machine`] and [`hal::PhysMem`] seams is plain Rust and runs on the host; the
//! bare-metal glue lives in `arch` and is only compiled for `x86`/`none` targets.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

mod arch;
pub mod config;
pub mod hal;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod heap;
pub mod kmain;
pub mod loader;
pub mod mm;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod panic;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;
pub mod uart;

pub use diag::log;
pub use kmain::{BootError, Kernel};
pub use trap::{Dispatch, Fatal, TrapFrame};
pub use types::{PhysAddr, Pid, VirtAddr};
