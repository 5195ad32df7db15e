// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saved process context.
//!
//! A suspended process's registers live on its own stack, at its saved stack
//! pointer, in the layout of `SavedFrame`. The lower nine words are pushed by
//! the kernel's trap entry code; the upper eight are the exception frame the
//! processor itself stacks on exception entry. Resuming a process is
//! therefore a matter of handing its saved stack pointer to `arch::resume`,
//! and creating one is a matter of writing a plausible frame at the top of a
//! fresh stack and pretending it trapped there.

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::space::AddressSpace;
use crate::umem::Arena;

/// `EXC_RETURN` value that returns to thread mode, on the process stack, with
/// no floating point state. Every saved frame must carry this.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Initial program status: just the Thumb bit.
pub const INITIAL_PSR: u32 = 1 << 24;

/// Link register of a freshly primed process. Returning from the entry point
/// branches here and faults.
pub const INITIAL_LR: u32 = 0xFFFF_FFFF;

/// Why a process stopped running.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trap {
    /// The process executed `svc`; the request is in its saved registers.
    Syscall,
    /// The preemption timer went off.
    Preempt,
}

/// Register image at a suspended process's stack pointer.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    Immutable, KnownLayout,
)]
#[repr(C)]
pub struct SavedFrame {
    // Pushed by the trap entry code.
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub exc_return: u32,

    // Pushed by the processor.
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

const_assert_eq!(core::mem::size_of::<SavedFrame>(), 17 * 4);

/// Size of a saved frame, in bytes.
pub const FRAME_SIZE: u32 = core::mem::size_of::<SavedFrame>() as u32;

impl SavedFrame {
    /// Produces the frame of a process that has not yet run: it will start at
    /// `entry` with `args` in `r0` onward.
    pub fn primed(entry: u32, args: &[u32]) -> Self {
        uassert!(args.len() <= abi::MAX_SPAWN_ARGS);

        let mut frame = SavedFrame {
            exc_return: EXC_RETURN_THREAD_PSP,
            lr: INITIAL_LR,
            pc: entry | 1,
            xpsr: INITIAL_PSR,
            ..SavedFrame::default()
        };
        for (i, &arg) in args.iter().enumerate() {
            frame.set_reg(i, arg);
        }
        frame
    }

    /// Reads the frame stored at `psp`, if `psp` is inside the arena.
    pub fn load(arena: &Arena<'_>, psp: u32) -> Option<Self> {
        let bytes = arena.slice(psp, FRAME_SIZE as usize)?;
        SavedFrame::read_from_bytes(bytes).ok()
    }

    /// Writes this frame at `psp`. Returns `false` if it doesn't fit in the
    /// arena.
    pub fn store(&self, arena: &mut Arena<'_>, psp: u32) -> bool {
        match arena.slice_mut(psp, FRAME_SIZE as usize) {
            Some(bytes) => {
                bytes.copy_from_slice(self.as_bytes());
                true
            }
            None => false,
        }
    }

    /// Reads general-purpose register `n`, for `n` in `0..=12`.
    pub fn reg(&self, n: usize) -> u32 {
        match n {
            0 => self.r0,
            1 => self.r1,
            2 => self.r2,
            3 => self.r3,
            4 => self.r4,
            5 => self.r5,
            6 => self.r6,
            7 => self.r7,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            _ => panic!("no register r{n}"),
        }
    }

    pub fn set_reg(&mut self, n: usize, value: u32) {
        let r = match n {
            0 => &mut self.r0,
            1 => &mut self.r1,
            2 => &mut self.r2,
            3 => &mut self.r3,
            4 => &mut self.r4,
            5 => &mut self.r5,
            6 => &mut self.r6,
            7 => &mut self.r7,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            _ => panic!("no register r{n}"),
        };
        *r = value;
    }

    /// Reads the syscall descriptor (number).
    pub fn syscall_descriptor(&self) -> u32 {
        self.r0
    }

    /// Reads syscall argument words 0 through 2.
    pub fn args(&self) -> [u32; 3] {
        [self.r1, self.r2, self.r3]
    }

    /// Writes the syscall result.
    pub fn ret0(&mut self, x: u32) {
        self.r0 = x;
    }
}

/// Builds the initial frame for a process at the top of its stack, and points
/// its saved stack pointer at it.
pub fn prime(
    arena: &mut Arena<'_>,
    space: &mut AddressSpace,
    entry: u32,
    args: &[u32],
) {
    let psp = space.stack_top() - FRAME_SIZE;
    let stored = SavedFrame::primed(entry, args).store(arena, psp);
    uassert!(stored);
    space.set_stack_pointer(psp);
}

/// Delivers a syscall result to a suspended process.
pub fn set_result(arena: &mut Arena<'_>, psp: u32, value: u32) {
    let mut frame = match SavedFrame::load(arena, psp) {
        Some(frame) => frame,
        None => panic!("saved stack pointer {psp:#x} outside the arena"),
    };
    frame.ret0(value);
    frame.store(arena, psp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_frame_looks_like_a_trap() {
        let frame = SavedFrame::primed(0x1000_0100, &[7, 8]);
        assert_eq!(frame.pc, 0x1000_0101);
        assert_eq!(frame.xpsr, INITIAL_PSR);
        assert_eq!(frame.exc_return, EXC_RETURN_THREAD_PSP);
        assert_eq!(frame.lr, INITIAL_LR);
        assert_eq!((frame.r0, frame.r1, frame.r2), (7, 8, 0));

        // The hardware-stacked half starts at word 9.
        let words: [u32; 17] = zerocopy::transmute!(frame);
        assert_eq!(words[8], EXC_RETURN_THREAD_PSP);
        assert_eq!(words[9], 7);
        assert_eq!(words[15], 0x1000_0101);
    }

    #[test]
    fn syscall_registers() {
        let mut frame = SavedFrame::primed(0, &[3, 1, 2, 9]);
        assert_eq!(frame.syscall_descriptor(), 3);
        assert_eq!(frame.args(), [1, 2, 9]);
        frame.ret0(!0);
        assert_eq!(frame.reg(0), !0);
    }
}
