// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-core microkernel for the RP2040.
//!
//! This is the part of the system that runs in privileged mode: process
//! lifecycle, scheduling, memory partitioning with swap, and the context
//! switch. Processes reach it only through syscalls (see `abi::Sysnum`).
//!
//! Code outside the `arch` module is portable. On a development host, `arch`
//! is a simulation in which processes are Rust functions, so the rest of the
//! kernel can be exercised with `cargo test`.
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes and the arena are fixed at build
//!    time; the only dynamic memory is the partition arena itself.
//! 2. One lock. All kernel state sits behind a single `KernelMutex`, held
//!    everywhere except while a process runs.
//! 3. A strong preference for safe code where reasonable. Memory a process
//!    names by address is reached through bounds-checked `Arena` accessors.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    ones.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod config;
pub mod context;
pub mod diag;
pub mod err;
#[cfg(target_os = "none")]
pub mod fail;
pub mod partition;
pub mod sched;
pub mod space;
pub mod startup;
pub mod sync;
pub mod syscalls;
pub mod task;
pub mod umem;
