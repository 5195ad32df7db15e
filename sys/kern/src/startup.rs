// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use core::mem::MaybeUninit;
use core::ptr::{addr_of, addr_of_mut};

use crate::config::{KernelConfig, ARENA_SIZE, CORE1_STACK_SIZE};
use crate::partition::Kind;
use crate::sched::{self, Kernel};
use crate::sync::KernelMutex;
use crate::umem::Arena;

#[repr(C, align(8))]
struct ArenaSpace([u8; ARENA_SIZE]);

static mut ARENA: ArenaSpace = ArenaSpace([0; ARENA_SIZE]);

/// Shared kernel state. Written once by core 0 before core 1 is launched, and
/// only read through the lock after that.
static mut KERNEL: MaybeUninit<KernelMutex<Kernel<'static>>> = MaybeUninit::uninit();

/// Address processes use for the start of the arena.
fn arena_base(memory: &[u8]) -> u32 {
    if cfg!(target_os = "none") {
        memory.as_ptr() as usize as u32
    } else {
        // Host pointers don't fit in a process's address space; pretend the
        // arena is in SRAM.
        0x2000_0000
    }
}

/// The main kernel entry point.
///
/// The boot code does basic hardware setup, then calls this on core 0 with
/// the entry point of the first real process. With `diagnostics` set, the
/// kernel dumps its state over `klog!` each time it admits processes.
///
/// # Safety
///
/// This must be called exactly once per boot, from core 0, in privileged
/// thread mode on the main stack, while core 1 is still parked in the boot
/// ROM.
pub unsafe fn start_kernel(boot_entry: u32, diagnostics: bool) -> ! {
    crate::arch::init_core();

    // Safety: being called once per boot makes this the only reference.
    let memory: &'static mut [u8] = unsafe { &mut (*addr_of_mut!(ARENA)).0 };
    let base = arena_base(memory);
    let mut kernel = Kernel::new(
        KernelConfig::default(),
        Arena::new(memory, base),
        boot_entry,
        diagnostics,
    );

    let stack = match kernel.alloc.allocate(CORE1_STACK_SIZE, Kind::Flag) {
        Ok(addr) => addr,
        Err(e) => panic!("no room for core 1's stack: {e:?}"),
    };

    // Safety: core 1 isn't running yet, so nothing else can see `KERNEL`.
    let kernel: &'static KernelMutex<Kernel<'static>> =
        unsafe { (*addr_of_mut!(KERNEL)).write(KernelMutex::new(kernel)) };

    crate::arch::launch_core1(stack + CORE1_STACK_SIZE as u32, core1_main);
    sched::run(kernel, 0)
}

extern "C" fn core1_main() -> ! {
    crate::arch::init_core();
    // Safety: `start_kernel` initialized `KERNEL` before launching this core
    // and never touches the static again.
    let kernel = unsafe { (*addr_of!(KERNEL)).assume_init_ref() };
    sched::run(kernel, 1)
}
