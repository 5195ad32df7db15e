// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate that
//! concern using `Result`. Syscall implementations return `UserError` with
//! `?`, and the syscall entry point turns every such error into the single
//! `FAILURE` result word processes see.

use filestore::FsError;

/// An error committed by user code when interacting with a syscall.
///
/// All of these are recoverable: the process gets `abi::FAILURE` back and
/// carries on. The few conditions that are not recoverable (a malformed path,
/// an exhausted process table) halt the kernel instead and never get this
/// far.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// `r0` held something that isn't an `abi::Sysnum`.
    BadSysnum(u32),
    /// A buffer argument strays outside the caller's address space.
    BadBuffer,
    /// More spawn arguments than fit in a child's registers.
    BadArgCount,
    /// `wait` named a process that isn't a live child of the caller.
    NoSuchChild,
    /// `sbrk` would collide with the stack region.
    HeapExhausted,
    File(FsError),
}

/// Convenience conversion from `FsError`.
impl From<FsError> for UserError {
    fn from(e: FsError) -> Self {
        Self::File(e)
    }
}

/// Outcome of a syscall that didn't fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Reply {
    /// Write this to the caller's `r0`.
    Now(u32),
    /// The caller has blocked or is gone; nothing to deliver right now.
    Deferred,
}

/// Reasons the partition allocator turns down a request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocError {
    ZeroSize,
    /// No run of free partitions is long enough.
    Exhausted,
    /// Something else already holds the partitions asked for.
    Occupied,
}
