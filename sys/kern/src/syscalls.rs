// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! A process makes a syscall by putting an `abi::Sysnum` in `r0`, up to three
//! argument words in `r1`-`r3`, and executing `svc`. By the time we get here
//! the trap has been taken and the process's registers are in its saved
//! frame, which is where we read the arguments and write the result.
//!
//! Each syscall is implemented by a function returning
//! `Result<Reply, UserError>`. A common wrapper takes care of the final side
//! effects: delivering the reply, or turning an error into `abi::FAILURE`.

use abi::{Handle, ProcessId, Sysnum, DIRECTORY_BIT, FAILURE, MAX_SPAWN_ARGS, NAME_LEN};
use arrayvec::ArrayVec;
use filestore::{FsError, Mode};
use num_traits::FromPrimitive;

use crate::context::{self, SavedFrame};
use crate::err::{Reply, UserError};
use crate::sched::Kernel;
use crate::space::AddressSpace;
use crate::task::ProcessTable;
use crate::umem::{self, Readable, USlice};

/// Longest path a process may pass in.
const PATH_MAX: usize = 128;

impl Kernel<'_> {
    /// Carries out the syscall that process `slot` just trapped with.
    pub(crate) fn service_syscall(&mut self, slot: usize) {
        let psp = space_of(&self.table, slot).stack_pointer();
        let Some(frame) = SavedFrame::load(self.alloc.arena(), psp) else {
            panic!("saved frame at {psp:#x} outside the arena");
        };
        let id = self.table.id_of(slot);

        let nr = frame.syscall_descriptor();
        let result = match Sysnum::from_u32(nr) {
            Some(op) => self.syscall(slot, op, frame.args()),
            None => Err(UserError::BadSysnum(nr)),
        };
        let reply = match result {
            Ok(reply) => reply,
            Err(UserError::File(FsError::Malformed)) => {
                panic!("malformed path from process {id:?}")
            }
            Err(e) => {
                klog!("syscall {nr} from {id:?} failed: {e:?}");
                Reply::Now(FAILURE)
            }
        };
        if let Reply::Now(value) = reply {
            context::set_result(self.alloc.arena_mut(), psp, value);
        }
    }

    fn syscall(&mut self, slot: usize, op: Sysnum, [a0, a1, a2]: [u32; 3]) -> Result<Reply, UserError> {
        let mut path = [0; PATH_MAX];
        match op {
            Sysnum::Yield => Ok(Reply::Now(0)),
            Sysnum::Exit => {
                self.table.terminate(slot, &mut self.alloc);
                Ok(Reply::Deferred)
            }
            Sysnum::Spawn => self.spawn_child(slot, a0, a1, a2),
            Sysnum::Mkdir => {
                let path = self.read_path(slot, a0, a1, &mut path)?;
                self.files.mkdir(path)?;
                Ok(Reply::Now(0))
            }
            Sysnum::Rmdir => {
                let path = self.read_path(slot, a0, a1, &mut path)?;
                self.files.rmdir(path, &mut self.alloc)?;
                Ok(Reply::Now(0))
            }
            Sysnum::Create => {
                let path = self.read_path(slot, a0, a1, &mut path)?;
                self.files.create(path, a2, &mut self.alloc)?;
                Ok(Reply::Now(0))
            }
            Sysnum::Delete => {
                let path = self.read_path(slot, a0, a1, &mut path)?;
                self.files.delete(path, &mut self.alloc)?;
                Ok(Reply::Now(0))
            }
            Sysnum::Open => {
                let path = self.read_path(slot, a0, a1, &mut path)?;
                Ok(Reply::Now(self.files.open(path)?.0))
            }
            Sysnum::Read => self.read_file(slot, Handle(a0), a1, a2),
            Sysnum::Write => self.write_file(slot, Handle(a0), a1, a2),
            Sysnum::Wait => self.wait(slot, ProcessId(a0)),
            Sysnum::Sbrk => {
                let Some(space) = self.table.space_mut(slot) else {
                    panic!("syscall from a process without memory");
                };
                space
                    .sbrk(a0 as i32)
                    .map(Reply::Now)
                    .ok_or(UserError::HeapExhausted)
            }
            Sysnum::ReadDir => self.read_dir(slot, Handle(a0), a1, a2),
            Sysnum::Stat => {
                let node = self.files.node(Handle(a0))?;
                let dir = match node.mode() {
                    Mode::Directory => DIRECTORY_BIT,
                    Mode::File => 0,
                };
                Ok(Reply::Now(dir | node.size()))
            }
            Sysnum::Diagnostics => {
                klog!("{}", crate::diag::Dump(self));
                Ok(Reply::Now(0))
            }
        }
    }

    /// Copies a path out of the caller's memory into `buf`.
    fn read_path<'b>(
        &self,
        slot: usize,
        ptr: u32,
        len: u32,
        buf: &'b mut [u8; PATH_MAX],
    ) -> Result<&'b str, UserError> {
        let len = len as usize;
        if len > PATH_MAX {
            return Err(FsError::Malformed.into());
        }
        let src = umem::read_user(
            self.alloc.arena(),
            space_of(&self.table, slot),
            USlice::from_raw(ptr, len as u32)?,
        )?;
        buf[..len].copy_from_slice(src);
        core::str::from_utf8(&buf[..len]).map_err(|_| FsError::Malformed.into())
    }

    fn spawn_child(&mut self, slot: usize, entry: u32, argv: u32, argc: u32) -> Result<Reply, UserError> {
        let argc = argc as usize;
        if argc > MAX_SPAWN_ARGS {
            return Err(UserError::BadArgCount);
        }
        let mut args = ArrayVec::<u32, MAX_SPAWN_ARGS>::new();
        if argc != 0 {
            let bytes = umem::read_user(
                self.alloc.arena(),
                space_of(&self.table, slot),
                USlice::from_raw(argv, 4 * argc as u32)?,
            )?;
            for word in bytes.chunks_exact(4) {
                args.push(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
            }
        }
        let child = self.spawn(entry, &args, Some(slot));
        match self.table.id_of(child) {
            Some(id) => Ok(Reply::Now(id.0)),
            None => panic!("spawned process vanished"),
        }
    }

    fn wait(&mut self, slot: usize, child: ProcessId) -> Result<Reply, UserError> {
        let c = self.table.find(child).ok_or(UserError::NoSuchChild)?;
        if self.table.get(c).and_then(|b| b.parent()) != Some(slot) {
            return Err(UserError::NoSuchChild);
        }
        self.table.block_on(slot, child);
        Ok(Reply::Deferred)
    }

    fn read_file(&mut self, slot: usize, handle: Handle, buf: u32, len: u32) -> Result<Reply, UserError> {
        let dst = USlice::from_raw(buf, len)?;
        if !space_of(&self.table, slot).contains(dst.base_addr(), dst.len()) {
            return Err(UserError::BadBuffer);
        }
        if let Some(src) = self.files.extent(handle, dst.len())? {
            self.alloc
                .arena_mut()
                .copy(src, dst.base_addr(), dst.len())
                .ok_or(UserError::BadBuffer)?;
        }
        Ok(Reply::Now(len))
    }

    fn write_file(&mut self, slot: usize, handle: Handle, buf: u32, len: u32) -> Result<Reply, UserError> {
        let src = USlice::from_raw(buf, len)?;
        let readable = umem::locate_readable(space_of(&self.table, slot), src)?;
        let Some(dst) = self.files.extent(handle, src.len())? else {
            return Ok(Reply::Now(len));
        };
        let arena = self.alloc.arena_mut();
        let copied = match readable {
            Readable::Arena => arena.copy(src.base_addr(), dst, src.len()),
            Readable::Image(bytes) => arena
                .slice_mut(dst, bytes.len())
                .map(|d| d.copy_from_slice(bytes)),
        };
        copied.ok_or(UserError::BadBuffer)?;
        Ok(Reply::Now(len))
    }

    fn read_dir(&mut self, slot: usize, handle: Handle, n: u32, buf: u32) -> Result<Reply, UserError> {
        let name = self.files.read_dir(handle, n as usize)?;
        let dst = umem::write_user(
            self.alloc.arena_mut(),
            space_of(&self.table, slot),
            USlice::from_raw(buf, NAME_LEN as u32)?,
        )?;
        let (used, rest) = dst.split_at_mut(name.len());
        used.copy_from_slice(name.as_bytes());
        rest.fill(0);
        Ok(Reply::Now(name.len() as u32))
    }
}

fn space_of(table: &ProcessTable, slot: usize) -> &AddressSpace {
    match table.get(slot).and_then(|b| b.space()) {
        Some(space) => space,
        None => panic!("syscall from a process without memory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, UserContext};
    use crate::config::KernelConfig;
    use crate::context::Trap;
    use crate::sched;
    use crate::space::Layout;
    use crate::sync::KernelMutex;
    use crate::umem::Arena;
    use abi::Discipline;
    use std::sync::OnceLock;

    /// Step counter that simulated processes keep in a callee-saved register.
    const STEP: usize = 4;

    fn config() -> KernelConfig {
        KernelConfig {
            process_limit: 8,
            partition_size: 256,
            memory_budget: 32 * 256,
            time_slice: 1000,
            discipline: Discipline::FirstComeFirstServed,
            layout: Layout {
                text: 64,
                data: 64,
                heap: 128,
                stack: 768,
            },
        }
    }

    /// Boots a kernel with `boot` as the first process and runs it on one
    /// core until only the idle process is left.
    fn run_until_idle(boot: arch::Program) -> usize {
        let mut memory = vec![0u8; 32 * 256];
        let kernel = KernelMutex::new(sched::Kernel::new(
            config(),
            Arena::new(&mut memory, 0x2000_0000),
            arch::register(boot),
            false,
        ));
        for pass in 0..200 {
            sched::cycle(&kernel, 0);
            let k = kernel.lock();
            k.table.check();
            k.alloc.check();
            if pass > 1 && k.table.live_count() == 1 {
                return pass;
            }
        }
        panic!("processes never finished");
    }

    fn step(cx: &mut UserContext<'_>) -> u32 {
        let s = cx.reg(STEP);
        cx.set_reg(STEP, s + 1);
        s
    }

    fn path(cx: &mut UserContext<'_>, op: Sysnum, p: &str, extra: u32) -> Trap {
        let addr = cx.push_bytes(p.as_bytes());
        cx.syscall(op, [addr, p.len() as u32, extra])
    }

    #[test]
    fn hello_world() {
        fn program(cx: &mut UserContext<'_>) -> Trap {
            match step(cx) {
                0 => path(cx, Sysnum::Mkdir, "/docs", 0),
                1 => {
                    assert_eq!(cx.result(), 0);
                    path(cx, Sysnum::Create, "/docs/hello", 12)
                }
                2 => path(cx, Sysnum::Create, "/docs/after", 4),
                3 => path(cx, Sysnum::Open, "/docs/after", 0),
                4 => {
                    cx.set_reg(5, cx.result());
                    let buf = cx.push_bytes(b"wxyz");
                    cx.syscall(Sysnum::Write, [cx.reg(5), buf, 4])
                }
                5 => path(cx, Sysnum::Open, "/docs/hello", 0),
                6 => {
                    cx.set_reg(6, cx.result());
                    let buf = cx.push_bytes(b"Hello World!");
                    cx.syscall(Sysnum::Write, [cx.reg(6), buf, 12])
                }
                7 => {
                    assert_eq!(cx.result(), 12);
                    let buf = cx.push_bytes(b"Hello World!!");
                    cx.syscall(Sysnum::Write, [cx.reg(6), buf, 13])
                }
                8 => {
                    assert_eq!(cx.result(), FAILURE);
                    let buf = cx.reserve(16);
                    cx.set_reg(7, buf);
                    cx.syscall(Sysnum::Read, [cx.reg(6), buf, 12])
                }
                9 => {
                    assert_eq!(cx.result(), 12);
                    assert_eq!(cx.read(cx.reg(7), 12), b"Hello World!");
                    cx.syscall(Sysnum::Read, [cx.reg(6), cx.reg(7), 13])
                }
                10 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.syscall(Sysnum::Read, [cx.reg(5), cx.reg(7), 4])
                }
                11 => {
                    assert_eq!(cx.result(), 4);
                    assert_eq!(cx.read(cx.reg(7), 4), b"wxyz");
                    cx.syscall(Sysnum::Stat, [cx.reg(6), 0, 0])
                }
                12 => {
                    assert_eq!(cx.result(), 12);
                    path(cx, Sysnum::Open, "/docs", 0)
                }
                13 => {
                    cx.syscall(Sysnum::Stat, [cx.result(), 0, 0])
                }
                14 => {
                    assert_eq!(cx.result(), DIRECTORY_BIT);
                    path(cx, Sysnum::Open, "/docs", 0)
                }
                15 => {
                    let buf = cx.reserve(NAME_LEN);
                    cx.set_reg(7, buf);
                    cx.syscall(Sysnum::ReadDir, [cx.result(), 1, buf])
                }
                16 => {
                    assert_eq!(cx.result(), 5);
                    assert_eq!(cx.read(cx.reg(7), 5), b"hello");
                    path(cx, Sysnum::Rmdir, "/docs", 0)
                }
                17 => {
                    assert_eq!(cx.result(), 0);
                    path(cx, Sysnum::Open, "/docs/hello", 0)
                }
                18 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.syscall(Sysnum::Exit, [0; 3])
                }
                s => panic!("ran past exit, step {s}"),
            }
        }
        run_until_idle(program);
    }

    #[test]
    fn spawn_passes_arguments_and_wait_returns_the_child() {
        static CHILD: OnceLock<u32> = OnceLock::new();

        fn child(cx: &mut UserContext<'_>) -> Trap {
            match step(cx) {
                0 => {
                    assert_eq!((cx.reg(0), cx.reg(1)), (7, 9));
                    cx.syscall(Sysnum::Yield, [0; 3])
                }
                _ => cx.syscall(Sysnum::Exit, [0; 3]),
            }
        }

        fn parent(cx: &mut UserContext<'_>) -> Trap {
            match step(cx) {
                0 => {
                    let argv = cx.push_words(&[7, 9]);
                    let entry = *CHILD.get().unwrap();
                    cx.syscall(Sysnum::Spawn, [entry, argv, 2])
                }
                1 => {
                    let child = cx.result();
                    assert_ne!(child, FAILURE);
                    cx.set_reg(5, child);
                    cx.syscall(Sysnum::Wait, [child, 0, 0])
                }
                2 => {
                    assert_eq!(cx.result(), cx.reg(5));
                    // Not a child of ours.
                    cx.syscall(Sysnum::Wait, [0, 0, 0])
                }
                3 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.syscall(Sysnum::Spawn, [0, 0, 5])
                }
                4 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.syscall(Sysnum::Exit, [0; 3])
                }
                s => panic!("ran past exit, step {s}"),
            }
        }

        CHILD.get_or_init(|| arch::register(child));
        run_until_idle(parent);
    }

    #[test]
    fn bad_requests_fail_softly() {
        fn program(cx: &mut UserContext<'_>) -> Trap {
            match step(cx) {
                0 => cx.syscall(Sysnum::Yield, [0; 3]),
                1 => {
                    assert_eq!(cx.result(), 0);
                    // Buffer far outside our address space.
                    cx.syscall(Sysnum::Mkdir, [0x0000_1000, 4, 0])
                }
                2 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.set_reg(0, 99);
                    Trap::Syscall
                }
                3 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.syscall(Sysnum::Sbrk, [64, 0, 0])
                }
                4 => {
                    let heap = cx.result();
                    assert_ne!(heap, FAILURE);
                    cx.set_reg(5, heap);
                    cx.syscall(Sysnum::Sbrk, [4096, 0, 0])
                }
                5 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.syscall(Sysnum::Sbrk, [0, 0, 0])
                }
                6 => {
                    assert_eq!(cx.result(), cx.reg(5) + 64);
                    cx.syscall(Sysnum::Stat, [0xdead_0001, 0, 0])
                }
                7 => {
                    assert_eq!(cx.result(), FAILURE);
                    cx.syscall(Sysnum::Exit, [0; 3])
                }
                s => panic!("ran past exit, step {s}"),
            }
        }
        run_until_idle(program);
    }

    #[test]
    #[should_panic(expected = "malformed path")]
    fn malformed_paths_are_fatal() {
        fn program(cx: &mut UserContext<'_>) -> Trap {
            path(cx, Sysnum::Mkdir, "relative/path", 0)
        }
        run_until_idle(program);
    }
}
