// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv6-M, specifically the dual Cortex-M0+ of the
//! RP2040.
//!
//! # Context switching
//!
//! The kernel runs in thread mode on the main stack (MSP), processes in
//! thread mode on the process stack (PSP). The kernel enters a process by
//! executing `svc` itself with the process's saved stack pointer in `r0`; the
//! process comes back to the kernel by executing `svc` (a syscall) or by
//! being interrupted by SysTick (preemption). All three land in one piece of
//! assembly, which tells them apart by the stack the exception came from:
//!
//! - From the MSP, on `svc`: a resume request. The kernel's callee-saved
//!   registers are pushed on the MSP, the process's are loaded from its saved
//!   frame, and the exception returns into the process.
//!
//! - From the MSP, on SysTick: the timer expired while the kernel was
//!   running. It's ignored; the count restarts at the next resume.
//!
//! - From the PSP, either way: a suspension. The process's callee-saved
//!   registers and `EXC_RETURN` are pushed below the hardware frame on its
//!   own stack, the kernel's registers are popped off the MSP, and the new
//!   process stack pointer and the cause are written into the `r0`/`r1` slots
//!   of the kernel's stacked frame. Returning from the exception then looks,
//!   to the kernel, like its `svc` instruction produced two results.
//!
//! Nothing about this is core-specific: each core has its own MSP, PSP and
//! SysTick, so both can use the handlers at once.
//!
//! # Dual core
//!
//! Core 0 comes out of reset running the kernel; core 1 sits in the boot ROM
//! waiting for a launch sequence over the inter-core FIFO, which
//! `launch_core1` provides. Mutual exclusion between the cores uses one of
//! the SIO hardware spinlocks, since ARMv6-M lacks atomic read-modify-write.

use core::arch::{self, global_asm};
use core::sync::atomic::{compiler_fence, Ordering};

use crate::context::Trap;
use crate::umem::RawArena;

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($($tt:tt)*) => {
        cortex_m_semihosting::hprintln!($($tt)*)
    };
}

#[cfg(not(feature = "klog-semihosting"))]
macro_rules! klog {
    ($($tt:tt)*) => {
        if false {
            let _ = core::format_args!($($tt)*);
        }
    };
}

/// Single-cycle IO block.
const SIO_BASE: usize = 0xd000_0000;
const SIO_CPUID: *const u32 = SIO_BASE as *const u32;
const SIO_FIFO_ST: *const u32 = (SIO_BASE + 0x050) as *const u32;
const SIO_FIFO_WR: *mut u32 = (SIO_BASE + 0x054) as *mut u32;
const SIO_FIFO_RD: *const u32 = (SIO_BASE + 0x058) as *const u32;
const SIO_SPINLOCK0: usize = SIO_BASE + 0x100;

/// FIFO_ST: the incoming FIFO has data.
const FIFO_VLD: u32 = 1 << 0;
/// FIFO_ST: the outgoing FIFO has room.
const FIFO_RDY: u32 = 1 << 1;

/// Hardware spinlock guarding the kernel state.
const KERNEL_SPINLOCK: usize = 31;
/// Hardware spinlock taken by a core on its way to halting.
const FAIL_SPINLOCK: usize = 30;

/// Execute-in-place flash window, where the program image lives.
const XIP_RANGE: core::ops::Range<u32> = 0x1000_0000..0x1100_0000;

pub fn core_id() -> u32 {
    // Safety: reading CPUID has no side effects.
    unsafe { SIO_CPUID.read_volatile() }
}

/// One-time setup of the core we're running on, before it first resumes a
/// process.
pub fn init_core() {
    // Safety: we're purely lowering priorities from their defaults, so it
    // can't cause any surprise preemption or anything. But these operations
    // are `unsafe` in the `cortex_m` crate.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // ARMv6 only has 4 priority levels and no configurable fault
        // priorities. SVCall and SysTick share the lowest configurable level,
        // so neither can interrupt the other.
        scb.shpr[0].modify(|x| x | 0b11 << 30);
        scb.shpr[1].modify(|x| x | 0b11 << 30);
    }
    disarm_timer();
    if core_id() == 0 {
        // The spinlocks survive a core reset; start from a known state.
        RawLock::new().unlock();
        RawLock::new_secondary().unlock();
    }
}

fn syst() -> &'static cortex_m::peripheral::syst::RegisterBlock {
    // Safety: each core has its own SysTick, and only the kernel on that core
    // touches it.
    unsafe { &*cortex_m::peripheral::SYST::PTR }
}

/// Starts the preemption timer, firing every `reload` core clocks.
pub fn arm_timer(reload: u32) {
    let syst = syst();
    if timer_armed() && syst.rvr.read() == reload {
        return;
    }
    // Safety: these writes only affect this core's SysTick.
    unsafe {
        syst.rvr.write(reload);
        syst.cvr.write(0);
        // Enable, interrupt on wrap, core clock.
        syst.csr.write(0b111);
    }
}

pub fn disarm_timer() {
    // Safety: as above.
    unsafe {
        syst().csr.write(0);
    }
    cortex_m::peripheral::SCB::clear_pendst();
}

pub fn timer_armed() -> bool {
    syst().csr.read() & 1 != 0
}

/// Runs the process whose frame is at `psp` until its next trap.
pub fn resume(psp: u32, _memory: RawArena) -> (u32, Trap) {
    if timer_armed() {
        // Each dispatch gets a whole time slice.
        // Safety: only affects this core's SysTick.
        unsafe {
            syst().cvr.write(0);
        }
    }

    let new_psp: u32;
    let cause: u32;
    // Safety: the SVCall handler below preserves every register but r0 and
    // r1, and the process only touches its own memory.
    unsafe {
        arch::asm!(
            "svc #0",
            inout("r0") psp => new_psp,
            out("r1") cause,
        );
    }
    let trap = if cause == 0 { Trap::Syscall } else { Trap::Preempt };
    (new_psp, trap)
}

global_asm! {"
    .section .text.kern_trap
    .globl SVCall
    .type SVCall,function
    .thumb_func
    SVCall:
        movs r1, #0
        b 1f

    .globl SysTick
    .type SysTick,function
    .thumb_func
    SysTick:
        movs r1, #1

    1:  @ Which stack did we come from? EXC_RETURN bit 2 says.
        mov r2, lr
        movs r3, #4
        tst r2, r3
        bne 2f

        @ From the kernel. A tick here is stale; a call is a resume.
        cmp r1, #0
        bne 3f

        @ The process stack pointer is the kernel's stacked r0.
        ldr r0, [sp]

        @ Park the kernel's callee-saved registers on the main stack.
        push {{r4-r7}}
        mov r4, r8
        mov r5, r9
        mov r6, r10
        mov r7, r11
        push {{r4-r7}}

        @ Load the process's r8-r11 and EXC_RETURN, then point the PSP
        @ at its hardware frame.
        movs r1, r0
        adds r1, #16
        ldm r1!, {{r4-r7}}
        mov r8, r4
        mov r9, r5
        mov r10, r6
        mov r11, r7
        ldr r2, [r1]
        adds r1, #4
        msr PSP, r1

        @ r4-r7 last, since they were scratch until now.
        ldm r0!, {{r4-r7}}
        bx r2

    2:  @ From a process. Save its context below the hardware frame.
        mrs r0, PSP
        subs r0, #36
        movs r2, r0
        stm r2!, {{r4-r7}}
        mov r4, r8
        mov r5, r9
        mov r6, r10
        mov r7, r11
        stm r2!, {{r4-r7}}
        mov r3, lr
        str r3, [r2]

        @ Bring back the kernel's registers.
        pop {{r4-r7}}
        mov r8, r4
        mov r9, r5
        mov r10, r6
        mov r11, r7
        pop {{r4-r7}}

        @ Results of the kernel's svc: new stack pointer and cause.
        str r0, [sp]
        str r1, [sp, #4]
        ldr r2, ={exc_return_kernel}
        bx r2

    3:  bx lr
    ",
    exc_return_kernel = const 0xFFFF_FFF9u32,
}

/// The idle process: gives the core straight back.
extern "C" fn idle_main() -> ! {
    loop {
        // Safety: a syscall from process mode; Yield takes no arguments.
        unsafe {
            arch::asm!(
                "svc #0",
                inout("r0") abi::Sysnum::Yield as u32 => _,
                out("r1") _,
                out("r2") _,
                out("r3") _,
            );
        }
    }
}

pub fn idle_entry() -> u32 {
    idle_main as usize as u32
}

pub fn is_readonly_image(addr: u32, len: usize) -> bool {
    let Some(end) = u32::try_from(len).ok().and_then(|l| addr.checked_add(l)) else {
        return false;
    };
    addr >= XIP_RANGE.start && end <= XIP_RANGE.end
}

/// Called by a core with nothing to run.
pub fn relax() {
    cortex_m::asm::nop();
}

/// Mutual exclusion between the two cores, using a SIO hardware spinlock.
///
/// All `RawLock`s made by `new` are the same lock, the kernel lock.
pub struct RawLock(usize);

impl RawLock {
    pub const fn new() -> Self {
        Self(KERNEL_SPINLOCK)
    }

    /// The one other lock, used only by `fail`.
    pub const fn new_secondary() -> Self {
        Self(FAIL_SPINLOCK)
    }

    fn register(&self) -> *mut u32 {
        (SIO_SPINLOCK0 + 4 * self.0) as *mut u32
    }

    pub fn lock(&self) {
        // Safety: reading a spinlock register claims it if it reads nonzero.
        while unsafe { self.register().read_volatile() } == 0 {}
        compiler_fence(Ordering::Acquire);
        cortex_m::asm::dmb();
    }

    pub fn unlock(&self) {
        cortex_m::asm::dmb();
        compiler_fence(Ordering::Release);
        // Safety: any write releases the spinlock.
        unsafe { self.register().write_volatile(0) }
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

fn fifo_status() -> u32 {
    // Safety: reading FIFO_ST has no side effects.
    unsafe { SIO_FIFO_ST.read_volatile() }
}

fn fifo_drain() {
    while fifo_status() & FIFO_VLD != 0 {
        // Safety: popping a word we don't want.
        let _ = unsafe { SIO_FIFO_RD.read_volatile() };
    }
}

fn fifo_push(word: u32) {
    while fifo_status() & FIFO_RDY == 0 {}
    // Safety: there's room, per the loop above.
    unsafe { SIO_FIFO_WR.write_volatile(word) }
    cortex_m::asm::sev();
}

fn fifo_pop() -> u32 {
    while fifo_status() & FIFO_VLD == 0 {
        cortex_m::asm::wfe();
    }
    // Safety: there's data, per the loop above.
    unsafe { SIO_FIFO_RD.read_volatile() }
}

/// Wakes core 1 from the boot ROM and sends it to `entry`, running on the
/// stack ending at `stack_top`.
pub fn launch_core1(stack_top: u32, entry: extern "C" fn() -> !) {
    // Safety: reading VTOR has no side effects.
    let vtor = unsafe { (*cortex_m::peripheral::SCB::PTR).vtor.read() };
    let sequence = [0, 0, 1, vtor, stack_top, entry as usize as u32];

    // The boot ROM echoes each word; any mismatch restarts the sequence.
    let mut i = 0;
    while i < sequence.len() {
        let word = sequence[i];
        if word == 0 {
            fifo_drain();
            cortex_m::asm::sev();
        }
        fifo_push(word);
        i = if fifo_pop() == word { i + 1 } else { 0 };
    }
}
