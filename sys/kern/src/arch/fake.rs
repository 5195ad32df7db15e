// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated architecture for running the kernel on a development host.
//!
//! There's no way to branch into process code here, so "processes" are Rust
//! functions registered with `register`, which hands back a fake entry
//! address. Resuming a process looks up the function from the `pc` in its
//! saved frame and calls it once; the function plays one stretch of the
//! process's execution against a `UserContext` and reports how that stretch
//! ended. Register state lives in the saved frame on the process's stack, as
//! it would on hardware, so a process can carry its own state between steps
//! in its callee-saved registers.
//!
//! Each host thread stands in for one core, with its own core number and
//! preemption timer.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use abi::Sysnum;
use zerocopy::{FromBytes, IntoBytes};

use crate::context::{SavedFrame, Trap, EXC_RETURN_THREAD_PSP, FRAME_SIZE, INITIAL_PSR};
use crate::umem::RawArena;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! klog {
    ($($tt:tt)*) => {
        println!($($tt)*)
    };
}

/// One stretch of a simulated process's execution.
pub type Program = fn(&mut UserContext<'_>) -> Trap;

/// Fake entry addresses start here, in what would be flash.
const PROGRAM_BASE: u32 = 0x1000_0000;

static PROGRAMS: Mutex<Vec<Program>> = Mutex::new(Vec::new());

/// Frames currently being run, by arena and stack pointer.
static RUNNING: Mutex<Vec<(usize, u32)>> = Mutex::new(Vec::new());

thread_local! {
    static CORE: Cell<u32> = const { Cell::new(0) };
    static TIMER: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Makes `program` runnable, returning its entry address.
pub fn register(program: Program) -> u32 {
    let mut programs = PROGRAMS.lock().unwrap_or_else(PoisonError::into_inner);
    programs.push(program);
    PROGRAM_BASE + 4 * (programs.len() as u32 - 1)
}

fn program_at(pc: u32) -> Program {
    let programs = PROGRAMS.lock().unwrap_or_else(PoisonError::into_inner);
    let index = (pc & !1).wrapping_sub(PROGRAM_BASE) / 4;
    match programs.get(index as usize) {
        Some(p) => *p,
        None => panic!("no program at {pc:#x}"),
    }
}

pub fn idle_entry() -> u32 {
    static IDLE: OnceLock<u32> = OnceLock::new();
    *IDLE.get_or_init(|| register(|cx| cx.syscall(Sysnum::Yield, [0; 3])))
}

/// Runs the process whose frame is at `psp` until its next trap.
pub fn resume(psp: u32, memory: RawArena) -> (u32, Trap) {
    let _running = Running::claim(memory.id(), psp);

    // Safety: we are standing in for the process, which owns this memory
    // while dispatched.
    let frame_bytes = || match unsafe { memory.slice_mut(psp, FRAME_SIZE as usize) } {
        Some(bytes) => bytes,
        None => panic!("resuming a frame at {psp:#x}, outside the arena"),
    };
    let mut frame = match SavedFrame::read_from_bytes(frame_bytes()) {
        Ok(frame) => frame,
        Err(_) => panic!("frame at {psp:#x} is unreadable"),
    };
    uassert!(frame.exc_return == EXC_RETURN_THREAD_PSP);
    uassert!(frame.xpsr & INITIAL_PSR != 0);

    let program = program_at(frame.pc);
    let trap = {
        let mut cx = UserContext {
            frame: &mut frame,
            memory,
            scratch: psp,
        };
        program(&mut cx)
    };
    if trap == Trap::Preempt && !timer_armed() {
        panic!("process at {psp:#x} never yields and no timer is armed");
    }
    frame_bytes().copy_from_slice(frame.as_bytes());
    (psp, trap)
}

/// Marks a frame as in use for the duration of a `resume`, catching the same
/// process being dispatched on two cores at once.
struct Running((usize, u32));

impl Running {
    fn claim(arena: usize, psp: u32) -> Self {
        let mut running = RUNNING.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains(&(arena, psp)) {
            panic!("frame at {psp:#x} dispatched twice");
        }
        running.push((arena, psp));
        Running((arena, psp))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        let mut running = RUNNING.lock().unwrap_or_else(PoisonError::into_inner);
        running.retain(|r| *r != self.0);
    }
}

/// What a simulated process can do during one step.
pub struct UserContext<'a> {
    frame: &'a mut SavedFrame,
    memory: RawArena,
    /// Bottom of the memory handed out by `push_bytes` this step.
    scratch: u32,
}

impl UserContext<'_> {
    /// Reads `r0` through `r12`. At the first step these hold the spawn
    /// arguments; after a syscall, `r0` holds the result.
    pub fn reg(&self, n: usize) -> u32 {
        self.frame.reg(n)
    }

    pub fn set_reg(&mut self, n: usize, value: u32) {
        self.frame.set_reg(n, value);
    }

    /// Result of the syscall that ended the previous step.
    pub fn result(&self) -> u32 {
        self.frame.r0
    }

    /// Ends this step with a syscall.
    pub fn syscall(&mut self, op: Sysnum, args: [u32; 3]) -> Trap {
        self.frame.r0 = op as u32;
        [self.frame.r1, self.frame.r2, self.frame.r3] = args;
        Trap::Syscall
    }

    /// Ends this step by running until the timer fires.
    pub fn spin(&mut self) -> Trap {
        Trap::Preempt
    }

    /// Copies `bytes` onto the process's stack, below its saved frame, and
    /// returns their address. Successive calls in one step stack downward.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> u32 {
        self.scratch -= (bytes.len() as u32).next_multiple_of(8);
        let addr = self.scratch;
        self.write(addr, bytes);
        addr
    }

    pub fn push_words(&mut self, words: &[u32]) -> u32 {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.push_bytes(&bytes)
    }

    /// Reserves `len` bytes of stack without initializing them.
    pub fn reserve(&mut self, len: usize) -> u32 {
        self.push_bytes(&vec![0; len])
    }

    pub fn read(&self, addr: u32, len: usize) -> Vec<u8> {
        // Safety: a process reading memory it was handed.
        match unsafe { self.memory.slice_mut(addr, len) } {
            Some(bytes) => bytes.to_vec(),
            None => panic!("process read {addr:#x} outside the arena"),
        }
    }

    pub fn write(&mut self, addr: u32, bytes: &[u8]) {
        // Safety: as above.
        match unsafe { self.memory.slice_mut(addr, bytes.len()) } {
            Some(dest) => dest.copy_from_slice(bytes),
            None => panic!("process wrote {addr:#x} outside the arena"),
        }
    }
}

pub fn core_id() -> u32 {
    CORE.with(Cell::get)
}

/// Makes the calling thread act as core `id`.
pub fn set_core_id(id: u32) {
    CORE.with(|c| c.set(id));
}

pub fn arm_timer(reload: u32) {
    TIMER.with(|t| t.set(Some(reload)));
}

pub fn disarm_timer() {
    TIMER.with(|t| t.set(None));
}

pub fn timer_armed() -> bool {
    TIMER.with(|t| t.get().is_some())
}

pub fn init_core() {
    disarm_timer();
}

/// Starts a thread playing core 1. The stack is only used on hardware.
pub fn launch_core1(_stack_top: u32, entry: extern "C" fn() -> !) {
    std::thread::spawn(move || {
        set_core_id(1);
        entry()
    });
}

pub fn relax() {
    std::thread::yield_now();
}

/// Nothing outside the arena is addressable here.
pub fn is_readonly_image(_addr: u32, _len: usize) -> bool {
    false
}

/// Spinlock shared by the simulated cores.
pub struct RawLock(AtomicBool);

impl RawLock {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}
