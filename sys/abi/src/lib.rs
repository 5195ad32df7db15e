// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and processes.

#![no_std]

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Result word returned by any syscall that fails recoverably.
pub const FAILURE: u32 = !0;

/// Maximum number of argument words a process may pass to a child it spawns.
/// These land in the child's `r0`-`r3`.
pub const MAX_SPAWN_ARGS: usize = 4;

/// Longest single name token in a file-store path, in bytes.
pub const NAME_LEN: usize = 16;

/// Set in the `stat` result word when the node is a directory. The remaining
/// bits hold the node's size.
pub const DIRECTORY_BIT: u32 = 1 << 31;

/// Names a process.
///
/// Ids are handed out in creation order, starting at zero for the idle
/// process, and are never reused during a boot. This means that sorting by
/// `ProcessId` sorts by creation order, which the scheduling disciplines lean
/// on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The first process synthesized by the kernel, which is also the root of
    /// the process tree.
    pub const IDLE: Self = Self(0);
}

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Enumeration of syscall numbers, passed in `r0` at the time of the trap.
///
/// Up to three argument words follow in `r1`-`r3`, and the result comes back
/// in `r0`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    Exit = 1,
    /// `(entry, args ptr, arg count)` -> child id
    Spawn = 2,
    /// `(path ptr, path len)`
    Mkdir = 3,
    /// `(path ptr, path len)`, recursive
    Rmdir = 4,
    /// `(path ptr, path len, size)`
    Create = 5,
    /// `(path ptr, path len)`
    Delete = 6,
    /// `(handle, buf ptr, len)` -> len
    Read = 7,
    /// `(handle, buf ptr, len)` -> len
    Write = 8,
    /// `(path ptr, path len)` -> handle
    Open = 9,
    /// `(child id)` -> child id, once the child has terminated
    Wait = 10,
    /// `(increment)` -> previous heap cursor
    Sbrk = 11,
    /// `(dir handle, index, buf ptr)` -> name len; `buf` holds `NAME_LEN`
    ReadDir = 12,
    /// `(handle)` -> `DIRECTORY_BIT | size`
    Stat = 13,
    Diagnostics = 14,
}

/// State of a process, as tracked by the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessStatus {
    /// Created, sitting in the job queue awaiting admission.
    Created,
    /// Resident and sitting in the ready queue.
    Ready,
    /// Currently running on one of the cores.
    Executing,
    /// Resident and parked in the device queue.
    Blocked,
    /// Would be `Ready`, but its address space has been released.
    SwappedReady,
    /// Would be `Blocked`, but its address space has been released.
    SwappedBlocked,
    Terminated,
}

impl ProcessStatus {
    /// Checks whether a process in this state has given up its address space.
    pub fn is_swapped(self) -> bool {
        matches!(self, Self::SwappedReady | Self::SwappedBlocked)
    }

    /// Returns the state a process moves to when evicted from memory, if it
    /// can be evicted from this state at all.
    pub fn swapped_out(self) -> Option<Self> {
        match self {
            Self::Ready => Some(Self::SwappedReady),
            Self::Blocked => Some(Self::SwappedBlocked),
            _ => None,
        }
    }
}

/// Policy the medium-term scheduler uses to order the ready queue.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
pub enum Discipline {
    #[default]
    FirstComeFirstServed,
    RoundRobin,
    ShortestJobNext,
    ShortestRemainingTime,
}

/// Names an open file-store node.
///
/// Like a task id in other kernels, a `Handle` combines a node index with a
/// generation number. The generation of a node slot is bumped whenever the
/// node is deleted, so a handle to a deleted node goes stale instead of
/// silently referring to whatever is created in the same slot next.
///
/// The index is in the lower `Handle::INDEX_BITS` bits, while the generation
/// is in the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Handle(pub u32);

impl Handle {
    /// Number of bits in a `Handle` used to represent node index, rather than
    /// generation number.
    pub const INDEX_BITS: u32 = 16;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `Handle` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        Handle(
            (index as u32 & Self::INDEX_MASK)
                | (gen.0 as u32) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this handle.
    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    /// Extracts the generation part of this handle.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u16)
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u16);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}
