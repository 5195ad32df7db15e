// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! Scheduling happens in three tiers, which each core runs in turn, forever:
//!
//! - The long-term scheduler admits newly created processes to the ready
//!   queue, and bootstraps the system when there are no processes at all.
//! - The medium-term scheduler orders the ready queue by the current
//!   discipline, programs this core's preemption timer to suit, and swaps
//!   processes out of (and back into) memory to hold resident memory within
//!   the memory budget. A swapped-out process keeps its memory as a swap
//!   image in the arena and comes back at the same address.
//! - The short-term scheduler runs each process in the ready queue once.
//!
//! The first two run entirely under the kernel lock. The short-term
//! scheduler lets go of the lock while a process runs, which is what lets two
//! cores make progress at once.

use core::ops::Range;

use abi::{Discipline, ProcessId, ProcessStatus};
use arrayvec::ArrayVec;
use ringbuf::{ringbuf, ringbuf_entry};

use crate::config::{KernelConfig, FILE_LIMIT, PROCESS_LIMIT};
use crate::context::Trap;
use crate::err::AllocError;
use crate::partition::Allocator;
use crate::sync::KernelMutex;
use crate::task::ProcessTable;
use crate::umem::Arena;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Dispatch { id: ProcessId, core: u32 },
    Trapped { id: ProcessId, trap: Trap },
    SwapInFailed(ProcessId),
    Discipline(Discipline),
}

ringbuf!(Trace, 64, Trace::None);

/// All kernel state shared between the cores.
pub struct Kernel<'a> {
    pub config: KernelConfig,
    pub alloc: Allocator<'a>,
    pub table: ProcessTable,
    pub files: filestore::FileStore<FILE_LIMIT>,
    /// First real process, started once the idle process exists.
    boot_entry: Option<u32>,
    /// Print the system state whenever processes are admitted.
    diagnostics: bool,
}

impl<'a> Kernel<'a> {
    pub fn new(config: KernelConfig, arena: Arena<'a>, boot_entry: u32, diagnostics: bool) -> Self {
        Self {
            config,
            alloc: Allocator::new(arena, config.partition_size),
            table: ProcessTable::new(config.process_limit),
            files: filestore::FileStore::new(),
            boot_entry: Some(boot_entry),
            diagnostics,
        }
    }

    /// Creates a process as a child of `parent`, or of the root.
    pub fn spawn(&mut self, entry: u32, args: &[u32], parent: Option<usize>) -> usize {
        self.table.create(&mut self.alloc, self.config.layout, entry, args, parent)
    }

    pub fn set_discipline(&mut self, discipline: Discipline) {
        ringbuf_entry!(Trace::Discipline(discipline));
        self.config.discipline = discipline;
    }

    pub fn long_term(&mut self) {
        match self.table.live_count() {
            0 if self.table.ever_created() => panic!("no processes left"),
            0 => {
                self.spawn(crate::arch::idle_entry(), &[], None);
            }
            1 => {
                if let Some(entry) = self.boot_entry.take() {
                    self.spawn(entry, &[], self.table.root());
                }
            }
            _ => {}
        }

        if self.table.admit_all() != 0 && self.diagnostics {
            klog!("{}", crate::diag::Dump(self));
        }
    }

    pub fn medium_term(&mut self) {
        let policy = policy(self.config.discipline);
        self.order_ready(policy);
        if policy.preemptive() {
            crate::arch::arm_timer(self.config.time_slice);
        } else {
            crate::arch::disarm_timer();
        }

        // Anything evicted below waits at least until the next pass.
        let waiting: ArrayVec<usize, PROCESS_LIMIT> = self
            .table
            .iter()
            .filter(|&s| {
                self.table.get(s).map(|b| b.status()) == Some(ProcessStatus::SwappedReady)
            })
            .collect();

        while self.alloc.resident() > self.config.memory_budget {
            if !self.evict_one(0, None) {
                break;
            }
        }

        let mut restored = 0;
        for slot in waiting {
            let mut attempts = self.table.device().len() + self.table.ready().len();
            loop {
                let in_the_way = match self.swap_in(slot) {
                    Ok(()) => {
                        restored += 1;
                        break;
                    }
                    Err(AllocError::Occupied) => self.table.get(slot).map(|b| b.home()),
                    Err(_) => None,
                };
                if attempts == 0 || !self.evict_one(restored, in_the_way) {
                    if let Some(id) = self.table.id_of(slot) {
                        ringbuf_entry!(Trace::SwapInFailed(id));
                    }
                    break;
                }
                attempts -= 1;
            }
        }

        if restored != 0 {
            self.order_ready(policy);
        }
    }

    fn order_ready(&mut self, policy: &dyn Policy) {
        let mut ready = self.table.take_ready();
        policy.order(&mut ready, &self.table);
        self.table.restore_ready(ready);
    }

    /// Swaps out one process to make room: the most recently blocked one if
    /// any, otherwise the one at the back of the ready queue, skipping the
    /// last `protect` ready entries. With `within` given, only a process
    /// whose memory overlaps that range will do.
    fn evict_one(&mut self, protect: usize, within: Option<Range<u32>>) -> bool {
        let ready = self.table.ready();
        let ready = &ready[..ready.len().saturating_sub(protect)];
        let victim = self
            .table
            .device()
            .iter()
            .rev()
            .chain(ready.iter().rev())
            .copied()
            .find(|&s| match &within {
                None => true,
                Some(r) => self
                    .table
                    .get(s)
                    .and_then(|b| b.space())
                    .is_some_and(|sp| sp.range().start < r.end && r.start < sp.range().end),
            });
        match victim {
            Some(slot) => self.table.evict(slot, &mut self.alloc),
            None => false,
        }
    }

    fn swap_in(&mut self, slot: usize) -> Result<(), AllocError> {
        let footprint = self.alloc.footprint(self.config.layout.total() as usize);
        if self.alloc.resident() + footprint > self.config.memory_budget {
            return Err(AllocError::Exhausted);
        }
        self.table.swap_in(slot, &mut self.alloc)
    }

    /// Finishes a process's turn on `core`: saves where it stopped, serves
    /// its syscall, and returns it to the ready queue unless it blocked or
    /// exited.
    pub fn finish_dispatch(&mut self, slot: usize, id: ProcessId, psp: u32, trap: Trap) {
        ringbuf_entry!(Trace::Trapped { id, trap });
        if !self.table.undispatch(slot, psp, &mut self.alloc) {
            return;
        }
        if trap == Trap::Syscall {
            self.service_syscall(slot);
        }
        self.table.requeue(slot);
    }
}

/// Ordering of the ready queue, and whether the running process gets
/// preempted.
pub trait Policy {
    fn order(&self, ready: &mut [usize], table: &ProcessTable);
    fn preemptive(&self) -> bool;
}

/// Run each process, oldest first, until it gives up the core.
pub struct FirstComeFirstServed;

impl Policy for FirstComeFirstServed {
    fn order(&self, ready: &mut [usize], table: &ProcessTable) {
        ready.sort_unstable_by_key(|&s| table.id_of(s));
    }

    fn preemptive(&self) -> bool {
        false
    }
}

/// Oldest first, one time slice at a time.
pub struct RoundRobin;

impl Policy for RoundRobin {
    fn order(&self, ready: &mut [usize], table: &ProcessTable) {
        FirstComeFirstServed.order(ready, table);
    }

    fn preemptive(&self) -> bool {
        true
    }
}

/// Placeholder for the burst-length disciplines: no burst estimates are
/// kept, so the queue stays in arrival order.
pub struct ArrivalOrder;

impl Policy for ArrivalOrder {
    fn order(&self, _ready: &mut [usize], _table: &ProcessTable) {}

    fn preemptive(&self) -> bool {
        false
    }
}

pub fn policy(discipline: Discipline) -> &'static dyn Policy {
    match discipline {
        Discipline::FirstComeFirstServed => &FirstComeFirstServed,
        Discipline::RoundRobin => &RoundRobin,
        Discipline::ShortestJobNext | Discipline::ShortestRemainingTime => &ArrivalOrder,
    }
}

/// Runs every process that is ready right now, once, on `core`. Returns how
/// many ran.
pub fn short_term(kernel: &KernelMutex<Kernel<'_>>, core: u32) -> usize {
    let snapshot: ArrayVec<(usize, ProcessId), PROCESS_LIMIT> = {
        let k = kernel.lock();
        k.table
            .ready()
            .iter()
            .filter_map(|&s| Some((s, k.table.id_of(s)?)))
            .collect()
    };

    let mut ran = 0;
    for (slot, id) in snapshot {
        // Either core may have taken it, or terminated it, since the
        // snapshot.
        let (psp, memory) = {
            let mut k = kernel.lock();
            match k.table.dispatch(slot, id, core) {
                Some(psp) => {
                    ringbuf_entry!(Trace::Dispatch { id, core });
                    (psp, k.alloc.arena().raw())
                }
                None => continue,
            }
        };

        let (psp, trap) = crate::arch::resume(psp, memory);

        kernel.lock().finish_dispatch(slot, id, psp, trap);
        ran += 1;
    }
    ran
}

/// One pass of all three tiers.
pub fn cycle(kernel: &KernelMutex<Kernel<'_>>, core: u32) -> usize {
    {
        let mut k = kernel.lock();
        k.long_term();
        k.medium_term();
    }
    short_term(kernel, core)
}

/// Schedules on `core` forever.
pub fn run(kernel: &KernelMutex<Kernel<'_>>, core: u32) -> ! {
    loop {
        if cycle(kernel, core) == 0 {
            crate::arch::relax();
        }
    }
}
