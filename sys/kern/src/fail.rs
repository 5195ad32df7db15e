// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Halting the kernel, in a way tooling can find after the fact.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`, cleared at reset and set to
//!   true once either core reaches `die` (directly or through a `panic!`).
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The first core to die
//!   writes as much of the failure reason into it (as UTF-8) as fits, and the
//!   rest stays NUL.
//!
//! The other core, if it was running, stalls the next time it wants the
//! kernel lock, or goes on running its current process until that process
//! traps.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

use crate::arch::RawLock;

#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Serializes the two cores on the way down. This is a separate spinlock
/// from the kernel lock, which the dying core may be holding.
static FAIL_LOCK: RawLock = RawLock::new_secondary();

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    FAIL_LOCK.lock();
    // Safety: `FAIL_LOCK` is never released, so only the first core through
    // gets here; the flag catches that core panicking again.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        halt();
    }

    // Safety: as above, we are alone.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();
    klog!("kernel halted: {msg}");
    halt()
}

fn halt() -> ! {
    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = core::mem::take(&mut self.dest).split_at_mut(n);
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
