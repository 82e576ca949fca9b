// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler over the process table
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/current/set_current/tick/ticks/pick_next), pick_next
//! DEPENDS_ON: task::ProcessTable
//! INVARIANTS: A pick probes at most NPROC slots, starting after the current one;
//!             only RUNNABLE slots are ever picked; ticks only grow

use core::marker::PhantomData;

use crate::config::NPROC;
use crate::task::{ProcState, ProcessTable};
use crate::types::Pid;

/// First RUNNABLE slot after `current`, wrapping around, within `NPROC` probes.
///
/// `current` itself is the last slot probed, so a lone runnable process keeps running.
pub fn pick_next(table: &ProcessTable, current: Pid) -> Option<Pid> {
    let start = current.as_index() % NPROC;
    (1..=NPROC)
        .map(|step| Pid::from_raw(((start + step) % NPROC) as u32))
        .find(|&pid| table.state(pid) == Some(ProcState::Runnable))
}

/// Scheduling state: the running process and the tick counter.
pub struct Scheduler {
    current: Pid,
    ticks: u64,
    // Uniprocessor contract: only the trap path touches scheduling state.
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { current: Pid::RESERVED, ticks: 0, _not_send_sync: PhantomData }
    }

    /// Process that was running when the last trap arrived.
    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    /// Records one timer interrupt and returns the new count.
    pub fn tick(&mut self) -> u64 {
        self.ticks = self.ticks.wrapping_add(1);
        self.ticks
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Next process to run after the current one.
    pub fn pick_next(&self, table: &ProcessTable) -> Option<Pid> {
        let next = pick_next(table, self.current);
        if let Some(pid) = next {
            log_trace!(target: "sched", "pick {} after {}", pid, self.current);
        }
        next
    }
}
