// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User process support library.
//!
//! This contains syscall stubs and types, and re-exports the contents of the
//! `abi` crate that gets shared with the kernel.
//!
//! # Syscall stub implementation
//!
//! Every syscall is the same instruction sequence: the `Sysnum` in `r0`, up
//! to three arguments in `r1`-`r3`, `svc #0`, and the result back in `r0`.
//! The kernel saves and restores every other register, so unlike a function
//! call there is nothing else to clobber, and a single `asm!` block covers
//! all of them. The public `sys_*` functions wrap it with types.
//!
//! A result of `abi::FAILURE` means the kernel refused the request; the
//! wrappers turn that into `Err(Failed)`.

#![cfg_attr(target_os = "none", no_std)]

pub use abi::*;

/// The kernel refused a syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Failed;

fn check(result: u32) -> Result<u32, Failed> {
    if result == FAILURE {
        Err(Failed)
    } else {
        Ok(result)
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", armv6m))] {
        /// Traps into the kernel.
        #[inline(always)]
        pub fn syscall(op: Sysnum, a0: u32, a1: u32, a2: u32) -> u32 {
            let result: u32;
            // Safety: the kernel preserves everything but `r0`, and only
            // touches memory we pass it pointers to.
            unsafe {
                core::arch::asm!(
                    "svc #0",
                    inout("r0") op as u32 => result,
                    in("r1") a0,
                    in("r2") a1,
                    in("r3") a2,
                );
            }
            result
        }
    } else {
        /// Traps into the kernel. Processes only exist on the RP2040, so
        /// elsewhere this can't go anywhere.
        pub fn syscall(op: Sysnum, _a0: u32, _a1: u32, _a2: u32) -> u32 {
            panic!("{op:?} outside a process");
        }
    }
}

/// Gives up the rest of this turn.
#[inline(always)]
pub fn sys_yield() {
    syscall(Sysnum::Yield, 0, 0, 0);
}

/// Terminates the calling process, along with all of its descendants.
pub fn sys_exit() -> ! {
    syscall(Sysnum::Exit, 0, 0, 0);
    // The kernel never resumes an exited process.
    unreachable()
}

/// Process entry point. Spawn arguments arrive as the parameters, with any
/// not supplied reading as zero.
pub type Entry = extern "C" fn(u32, u32, u32, u32) -> !;

/// Starts a child process at `entry`, with up to `MAX_SPAWN_ARGS` words in
/// its argument registers. Returns the child's id.
pub fn sys_spawn(entry: Entry, args: &[u32]) -> Result<ProcessId, Failed> {
    check(syscall(
        Sysnum::Spawn,
        entry as usize as u32,
        args.as_ptr() as usize as u32,
        args.len() as u32,
    ))
    .map(ProcessId)
}

/// Blocks until `child` terminates. Fails immediately if it isn't a live
/// child of the caller.
pub fn sys_wait(child: ProcessId) -> Result<ProcessId, Failed> {
    check(syscall(Sysnum::Wait, child.0, 0, 0)).map(ProcessId)
}

/// Moves the heap cursor by `increment` bytes, returning where it was.
pub fn sys_sbrk(increment: i32) -> Result<*mut u8, Failed> {
    check(syscall(Sysnum::Sbrk, increment as u32, 0, 0)).map(|a| a as usize as *mut u8)
}

fn path_call(op: Sysnum, path: &str, extra: u32) -> Result<u32, Failed> {
    check(syscall(
        op,
        path.as_ptr() as usize as u32,
        path.len() as u32,
        extra,
    ))
}

pub fn sys_mkdir(path: &str) -> Result<(), Failed> {
    path_call(Sysnum::Mkdir, path, 0).map(drop)
}

/// Removes a directory and everything in it.
pub fn sys_rmdir(path: &str) -> Result<(), Failed> {
    path_call(Sysnum::Rmdir, path, 0).map(drop)
}

/// Creates a file of a fixed `size`. Reads and writes can never go past it.
pub fn sys_create(path: &str, size: u32) -> Result<(), Failed> {
    path_call(Sysnum::Create, path, size).map(drop)
}

pub fn sys_delete(path: &str) -> Result<(), Failed> {
    path_call(Sysnum::Delete, path, 0).map(drop)
}

pub fn sys_open(path: &str) -> Result<Handle, Failed> {
    path_call(Sysnum::Open, path, 0).map(Handle)
}

/// Fills `buf` from the start of a file.
pub fn sys_read(file: Handle, buf: &mut [u8]) -> Result<usize, Failed> {
    check(syscall(
        Sysnum::Read,
        file.0,
        buf.as_mut_ptr() as usize as u32,
        buf.len() as u32,
    ))
    .map(|n| n as usize)
}

/// Overwrites the start of a file with `data`.
pub fn sys_write(file: Handle, data: &[u8]) -> Result<usize, Failed> {
    check(syscall(
        Sysnum::Write,
        file.0,
        data.as_ptr() as usize as u32,
        data.len() as u32,
    ))
    .map(|n| n as usize)
}

/// Looks up the `n`th entry of a directory, newest first, and returns its
/// name, stored in `buf`.
pub fn sys_readdir(
    dir: Handle,
    n: usize,
    buf: &mut [u8; NAME_LEN],
) -> Result<&str, Failed> {
    let len = check(syscall(
        Sysnum::ReadDir,
        dir.0,
        n as u32,
        buf.as_mut_ptr() as usize as u32,
    ))?;
    buf.get(..len as usize)
        .and_then(|name| core::str::from_utf8(name).ok())
        .ok_or(Failed)
}

/// What `sys_stat` knows about a node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stat {
    pub directory: bool,
    pub size: u32,
}

impl From<u32> for Stat {
    fn from(word: u32) -> Self {
        Self {
            directory: word & DIRECTORY_BIT != 0,
            size: word & !DIRECTORY_BIT,
        }
    }
}

pub fn sys_stat(node: Handle) -> Result<Stat, Failed> {
    check(syscall(Sysnum::Stat, node.0, 0, 0)).map(Stat::from)
}

/// Has the kernel log its memory map, queues and process table.
pub fn sys_diagnostics() {
    syscall(Sysnum::Diagnostics, 0, 0, 0);
}

fn unreachable() -> ! {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "arm")] {
            cortex_m::asm::udf()
        } else {
            unreachable!()
        }
    }
}

/// A panicking process exits, taking its descendants with it.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
    sys_exit()
}
