// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration.
//!
//! Sizes that determine the layout of statics are fixed at build time, from
//! the RON in `$KERNEL_KCONFIG` (see `build.rs`). Everything else starts out
//! from the same build-time values but lives in a `KernelConfig` that can be
//! adjusted before boot, or by tests.

use abi::Discipline;

use crate::space::Layout;

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelConfig {
    /// Live processes allowed at once, at most `PROCESS_LIMIT`.
    pub process_limit: usize,
    pub partition_size: usize,
    /// Utilization, in bytes, above which the medium-term scheduler evicts.
    pub memory_budget: usize,
    /// Preemption timer reload value.
    pub time_slice: u32,
    pub discipline: Discipline,
    /// Shape of every process address space.
    pub layout: Layout,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            process_limit: PROCESS_LIMIT,
            partition_size: PARTITION_SIZE,
            memory_budget: MEMORY_BUDGET,
            time_slice: TIME_SLICE,
            discipline: DISCIPLINE,
            layout: Layout {
                text: TEXT_SIZE,
                data: DATA_SIZE,
                heap: HEAP_SIZE,
                stack: STACK_SIZE,
            },
        }
    }
}
