// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture specific support code
//! OWNERS: @kernel-arch-team
//! PUBLIC API: arch backends under `arch::<isa>`
//! DEPENDS_ON: hal (traits implemented here)
//! INVARIANTS: Keep per-arch code isolated behind module boundaries; only bare-metal builds
//!             compile any backend

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;
