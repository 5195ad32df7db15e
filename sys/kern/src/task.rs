// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process control blocks and the process table.
//!
//! Every process is reachable three ways at once:
//!
//! - The global list, in creation order, which is what diagnostics walk.
//! - The process tree. A block records its parent, its most recently created
//!   child, and its next older sibling. The idle process is the root.
//! - At most one of the three scheduling queues, chosen by status: `Created`
//!   blocks sit in the job queue, `Ready` in the ready queue, `Blocked` in the
//!   device queue. Blocks in any other state are in none of them.
//!
//! All of it lives in a fixed table of slots, and the links are slot
//! indices.

use core::ops::Range;

use abi::{ProcessId, ProcessStatus, MAX_SPAWN_ARGS};
use arrayvec::ArrayVec;
use ringbuf::{ringbuf, ringbuf_entry};

use crate::config::PROCESS_LIMIT;
use crate::context;
use crate::err::AllocError;
use crate::partition::{Allocator, Kind};
use crate::space::{AddressSpace, Layout};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Created(ProcessId),
    Admitted(ProcessId),
    Terminated(ProcessId),
    Reaped(ProcessId),
    Woke(ProcessId),
    Evicted(ProcessId),
    SwappedIn(ProcessId),
}

ringbuf!(Trace, 32, Trace::None);

/// A scheduling queue: slot indices, front first.
pub type Queue = ArrayVec<usize, PROCESS_LIMIT>;

pub struct ControlBlock {
    id: ProcessId,
    status: ProcessStatus,
    space: AddressSpace,
    /// Copy of `space` while swapped out, whose own partitions are then
    /// released.
    image: Option<u32>,

    next: Option<usize>,
    prev: Option<usize>,

    parent: Option<usize>,
    child: Option<usize>,
    sibling: Option<usize>,

    /// Child this process is blocked in `wait` on.
    waiting_on: Option<ProcessId>,
    /// Core currently running this process.
    running_on: Option<u32>,
}

impl ControlBlock {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// The process's address space, if it is resident.
    pub fn space(&self) -> Option<&AddressSpace> {
        self.image.is_none().then_some(&self.space)
    }

    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.image.is_none().then_some(&mut self.space)
    }

    /// Where the address space lives when resident.
    pub fn home(&self) -> Range<u32> {
        self.space.range()
    }

    pub fn image(&self) -> Option<u32> {
        self.image
    }

    /// Current location of the saved frame: in the address space, or in the
    /// swap image.
    fn frame_addr(&self) -> u32 {
        let psp = self.space.stack_pointer();
        match self.image {
            Some(image) => image + (psp - self.space.base()),
            None => psp,
        }
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn child(&self) -> Option<usize> {
        self.child
    }

    pub fn sibling(&self) -> Option<usize> {
        self.sibling
    }

    pub fn waiting_on(&self) -> Option<ProcessId> {
        self.waiting_on
    }

    pub fn running_on(&self) -> Option<u32> {
        self.running_on
    }
}

pub struct ProcessTable {
    blocks: [Option<ControlBlock>; PROCESS_LIMIT],
    head: Option<usize>,
    tail: Option<usize>,
    root: Option<usize>,
    job: Queue,
    ready: Queue,
    device: Queue,
    next_id: u32,
    limit: usize,
}

impl ProcessTable {
    pub fn new(limit: usize) -> Self {
        uassert!(limit <= PROCESS_LIMIT);
        Self {
            blocks: core::array::from_fn(|_| None),
            head: None,
            tail: None,
            root: None,
            job: Queue::new(),
            ready: Queue::new(),
            device: Queue::new(),
            next_id: 0,
            limit,
        }
    }

    pub fn get(&self, slot: usize) -> Option<&ControlBlock> {
        self.blocks.get(slot)?.as_ref()
    }

    fn block(&self, slot: usize) -> &ControlBlock {
        match self.get(slot) {
            Some(b) => b,
            None => panic!("no process in slot {slot}"),
        }
    }

    fn block_mut(&mut self, slot: usize) -> &mut ControlBlock {
        match self.blocks.get_mut(slot).and_then(Option::as_mut) {
            Some(b) => b,
            None => panic!("no process in slot {slot}"),
        }
    }

    pub fn space_mut(&mut self, slot: usize) -> Option<&mut AddressSpace> {
        self.blocks.get_mut(slot)?.as_mut()?.space_mut()
    }

    pub fn id_of(&self, slot: usize) -> Option<ProcessId> {
        self.get(slot).map(ControlBlock::id)
    }

    /// Finds the slot of a live process.
    pub fn find(&self, id: ProcessId) -> Option<usize> {
        self.blocks.iter().position(|b| {
            b.as_ref().is_some_and(|b| {
                b.id == id && b.status != ProcessStatus::Terminated
            })
        })
    }

    pub fn live_count(&self) -> usize {
        self.iter().count()
    }

    /// Checks whether any process has ever been created.
    pub fn ever_created(&self) -> bool {
        self.next_id != 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn root(&self) -> Option<usize> {
        self.root
    }

    /// Live processes, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.head, |&s| self.block(s).next)
    }

    /// Children of `slot`, newest first.
    pub fn children(&self, slot: usize) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.block(slot).child, |&s| self.block(s).sibling)
    }

    pub fn job(&self) -> &[usize] {
        &self.job
    }

    pub fn ready(&self) -> &[usize] {
        &self.ready
    }

    pub fn device(&self) -> &[usize] {
        &self.device
    }

    pub(crate) fn take_ready(&mut self) -> Queue {
        core::mem::take(&mut self.ready)
    }

    pub(crate) fn restore_ready(&mut self, ready: Queue) {
        uassert!(self.ready.is_empty());
        self.ready = ready;
    }

    fn queue_for(&mut self, status: ProcessStatus) -> Option<&mut Queue> {
        match status {
            ProcessStatus::Created => Some(&mut self.job),
            ProcessStatus::Ready => Some(&mut self.ready),
            ProcessStatus::Blocked => Some(&mut self.device),
            _ => None,
        }
    }

    /// Moves `slot` to `status`, and to the back of the matching queue.
    fn set_status(&mut self, slot: usize, status: ProcessStatus) {
        let old = self.block(slot).status;
        if let Some(q) = self.queue_for(old) {
            q.retain(|s| *s != slot);
        }
        self.block_mut(slot).status = status;
        if let Some(q) = self.queue_for(status) {
            q.push(slot);
        }
    }

    /// Creates a process that will start at `entry` with `args` in its
    /// argument registers, and puts it in the job queue.
    ///
    /// The first process created becomes the root of the tree. Later ones
    /// hang off `parent`, or off the root if no parent is given.
    ///
    /// Running out of table slots or memory here is fatal.
    pub fn create(
        &mut self,
        alloc: &mut Allocator<'_>,
        layout: Layout,
        entry: u32,
        args: &[u32],
        parent: Option<usize>,
    ) -> usize {
        if self.live_count() >= self.limit {
            panic!("process table exhausted");
        }
        let Some(slot) = self.blocks.iter().position(Option::is_none) else {
            panic!("process table exhausted");
        };
        if args.len() > MAX_SPAWN_ARGS {
            panic!("too many process arguments");
        }
        let mut space = match AddressSpace::allocate(alloc, layout) {
            Ok(space) => space,
            Err(e) => panic!("no memory for a process: {e:?}"),
        };
        context::prime(alloc.arena_mut(), &mut space, entry, args);

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        let parent = match self.root {
            None => None,
            Some(root) => Some(parent.unwrap_or(root)),
        };
        let sibling = parent.and_then(|p| self.block(p).child);

        self.blocks[slot] = Some(ControlBlock {
            id,
            status: ProcessStatus::Created,
            space,
            image: None,
            next: None,
            prev: self.tail,
            parent,
            child: None,
            sibling,
            waiting_on: None,
            running_on: None,
        });

        match self.tail {
            Some(t) => self.block_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        match parent {
            Some(p) => self.block_mut(p).child = Some(slot),
            None => self.root = Some(slot),
        }
        self.job.push(slot);

        ringbuf_entry!(Trace::Created(id));
        slot
    }

    /// Moves every `Created` process to `Ready`, oldest first. Returns how
    /// many were admitted.
    pub fn admit_all(&mut self) -> usize {
        let admitted = self.job.len();
        while let Some(&slot) = self.job.first() {
            ringbuf_entry!(Trace::Admitted(self.block(slot).id));
            self.set_status(slot, ProcessStatus::Ready);
        }
        admitted
    }

    /// Takes `slot` off the ready queue to run on `core`, returning its saved
    /// stack pointer. Returns `None` if it isn't the process `id`, or is no
    /// longer ready.
    pub fn dispatch(&mut self, slot: usize, id: ProcessId, core: u32) -> Option<u32> {
        let b = self.get(slot)?;
        if b.id != id || b.status != ProcessStatus::Ready {
            return None;
        }
        let psp = b.space()?.stack_pointer();
        self.set_status(slot, ProcessStatus::Executing);
        self.block_mut(slot).running_on = Some(core);
        Some(psp)
    }

    /// Records that `slot` has come back from running, with its context now
    /// saved at `psp`. Returns `false` if it was terminated in the meantime,
    /// in which case it has been reaped.
    pub fn undispatch(&mut self, slot: usize, psp: u32, alloc: &mut Allocator<'_>) -> bool {
        let b = self.block_mut(slot);
        b.running_on = None;
        if b.status == ProcessStatus::Terminated {
            self.reap(slot, alloc);
            return false;
        }
        match b.space_mut() {
            Some(space) => space.set_stack_pointer(psp),
            None => panic!("process {} ran without memory", b.id),
        }
        true
    }

    /// Puts a process that has finished its turn back in line, unless it
    /// blocked along the way.
    pub fn requeue(&mut self, slot: usize) {
        match self.get(slot).map(ControlBlock::status) {
            None | Some(ProcessStatus::Blocked) => {}
            Some(ProcessStatus::Executing) => self.set_status(slot, ProcessStatus::Ready),
            Some(other) => panic!("process in slot {slot} came back {other:?}"),
        }
    }

    /// Parks an executing process in the device queue until `child`
    /// terminates.
    pub fn block_on(&mut self, slot: usize, child: ProcessId) {
        uassert!(self.block(slot).status == ProcessStatus::Executing);
        self.block_mut(slot).waiting_on = Some(child);
        self.set_status(slot, ProcessStatus::Blocked);
    }

    /// Terminates `slot` along with all of its descendants.
    ///
    /// Each terminated process leaves the global list, the tree, and its
    /// queue, and anything waiting on it is woken. Its memory is freed, unless
    /// it is running on some core right now; then it is left in its slot for
    /// that core to reap when the process traps.
    pub fn terminate(&mut self, slot: usize, alloc: &mut Allocator<'_>) {
        let Some(b) = self.get(slot) else {
            return;
        };
        if b.status == ProcessStatus::Terminated {
            return;
        }
        let id = b.id;
        let (prev, next, parent, sibling) = (b.prev, b.next, b.parent, b.sibling);

        self.set_status(slot, ProcessStatus::Terminated);

        match prev {
            Some(p) => self.block_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.block_mut(n).prev = prev,
            None => self.tail = prev,
        }

        match parent {
            Some(p) if self.block(p).child == Some(slot) => {
                self.block_mut(p).child = sibling;
            }
            Some(p) => {
                let mut cursor = self.block(p).child;
                while let Some(c) = cursor {
                    if self.block(c).sibling == Some(slot) {
                        self.block_mut(c).sibling = sibling;
                        break;
                    }
                    cursor = self.block(c).sibling;
                }
            }
            None => self.root = None,
        }
        {
            let b = self.block_mut(slot);
            b.prev = None;
            b.next = None;
            b.parent = None;
            b.sibling = None;
        }

        while let Some(c) = self.block(slot).child {
            self.terminate(c, alloc);
        }

        ringbuf_entry!(Trace::Terminated(id));
        self.wake_waiters(id, alloc);

        if self.block(slot).running_on.is_none() {
            self.reap(slot, alloc);
        }
    }

    /// Frees a terminated process's slot and memory.
    fn reap(&mut self, slot: usize, alloc: &mut Allocator<'_>) {
        let Some(b) = self.blocks[slot].take() else {
            return;
        };
        uassert!(b.status == ProcessStatus::Terminated);
        ringbuf_entry!(Trace::Reaped(b.id));
        match b.image {
            Some(image) => alloc.deallocate(image),
            None => b.space.release(alloc),
        }
    }

    fn wake_waiters(&mut self, id: ProcessId, alloc: &mut Allocator<'_>) {
        for slot in 0..self.blocks.len() {
            let Some(b) = self.blocks[slot].as_mut() else {
                continue;
            };
            if b.waiting_on != Some(id) {
                continue;
            }
            b.waiting_on = None;
            if !matches!(b.status, ProcessStatus::Blocked | ProcessStatus::SwappedBlocked) {
                continue;
            }
            context::set_result(alloc.arena_mut(), b.frame_addr(), id.0);
            ringbuf_entry!(Trace::Woke(b.id));
            if b.status == ProcessStatus::Blocked {
                self.set_status(slot, ProcessStatus::Ready);
            } else {
                b.status = ProcessStatus::SwappedReady;
            }
        }
    }

    /// Copies the address space of a resident `Ready` or `Blocked` process
    /// into a swap image and releases it. Returns `false` if it's in any
    /// other state, or there's no room for the image.
    pub fn evict(&mut self, slot: usize, alloc: &mut Allocator<'_>) -> bool {
        let Some(swapped) = self.get(slot).and_then(|b| b.status.swapped_out()) else {
            return false;
        };
        let b = self.block_mut(slot);
        let Ok(image) = alloc.allocate(b.space.size(), Kind::Swap) else {
            return false;
        };
        let copied = alloc.arena_mut().copy(b.space.base(), image, b.space.size());
        uassert!(copied.is_some());
        b.space.release(alloc);
        b.image = Some(image);
        ringbuf_entry!(Trace::Evicted(b.id));
        self.set_status(slot, swapped);
        true
    }

    /// Brings a `SwappedReady` process back to where it was, with its memory
    /// exactly as it left it.
    pub fn swap_in(&mut self, slot: usize, alloc: &mut Allocator<'_>) -> Result<(), AllocError> {
        let b = self.block_mut(slot);
        uassert!(b.status == ProcessStatus::SwappedReady);
        let Some(image) = b.image else {
            panic!("process {} swapped out without an image", b.id);
        };
        b.space.reclaim(alloc)?;
        let copied = alloc.arena_mut().copy(image, b.space.base(), b.space.size());
        uassert!(copied.is_some());
        alloc.deallocate(image);
        b.image = None;
        ringbuf_entry!(Trace::SwappedIn(b.id));
        self.set_status(slot, ProcessStatus::Ready);
        Ok(())
    }

    /// Cross-checks every link and queue against the blocks' states.
    pub fn check(&self) {
        let live: ArrayVec<usize, PROCESS_LIMIT> = self.iter().collect();

        let mut prev = None;
        for &s in &live {
            let b = self.block(s);
            assert_eq!(b.prev, prev);
            assert_ne!(b.status, ProcessStatus::Terminated);
            prev = Some(s);
        }
        assert_eq!(self.tail, prev);

        for (slot, b) in self.blocks.iter().enumerate() {
            let Some(b) = b else { continue };
            if b.status == ProcessStatus::Terminated {
                assert!(b.running_on.is_some(), "unreaped {}", b.id);
                continue;
            }
            assert!(live.contains(&slot), "{} missing from the list", b.id);
            assert_eq!(b.image.is_some(), b.status.is_swapped(), "{}", b.id);

            for (q, status) in [
                (&self.job, ProcessStatus::Created),
                (&self.ready, ProcessStatus::Ready),
                (&self.device, ProcessStatus::Blocked),
            ] {
                let n = q.iter().filter(|s| **s == slot).count();
                assert_eq!(n, usize::from(b.status == status), "{} in queues", b.id);
            }

            match b.parent {
                None => assert_eq!(self.root, Some(slot)),
                Some(p) => {
                    assert!(live.contains(&p));
                    assert!(self.children(p).any(|c| c == slot));
                }
            }
            for c in self.children(slot) {
                assert_eq!(self.block(c).parent, Some(slot));
            }
        }

        assert_eq!(self.job.len() + self.ready.len() + self.device.len(), {
            live.iter()
                .filter(|s| {
                    matches!(
                        self.block(**s).status,
                        ProcessStatus::Created | ProcessStatus::Ready | ProcessStatus::Blocked
                    )
                })
                .count()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::umem::Arena;
    use abi::ProcessStatus::*;

    const LAYOUT: Layout = Layout {
        text: 64,
        data: 64,
        heap: 128,
        stack: 256,
    };

    fn with_table<R>(body: impl FnOnce(&mut ProcessTable, &mut Allocator<'_>) -> R) -> R {
        let mut memory = vec![0u8; 32 * 256];
        let mut alloc = Allocator::new(Arena::new(&mut memory, 0x2000_0000), 256);
        let mut table = ProcessTable::new(8);
        body(&mut table, &mut alloc)
    }

    #[test]
    fn root_only() {
        with_table(|t, a| {
            let root = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            assert_eq!(t.live_count(), 1);
            assert_eq!(t.job(), &[root]);
            assert_eq!(t.get(root).unwrap().parent(), None);
            assert_eq!(t.root(), Some(root));
            t.check();

            assert_eq!(t.admit_all(), 1);
            assert_eq!(t.get(root).unwrap().status(), Ready);
            assert_eq!(t.ready(), &[root]);
            assert!(t.job().is_empty());
            t.check();
        });
    }

    #[test]
    fn terminating_a_parent_takes_its_children() {
        with_table(|t, a| {
            let idle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let pa = t.create(a, LAYOUT, 0x1000_0004, &[], None);
            let pb = t.create(a, LAYOUT, 0x1000_0008, &[1], Some(pa));
            let pc = t.create(a, LAYOUT, 0x1000_0008, &[2], Some(pa));
            t.admit_all();
            t.check();

            assert_eq!(t.get(pa).unwrap().parent(), Some(idle));
            assert_eq!(t.children(pa).collect::<Vec<_>>(), [pc, pb]);
            assert_eq!(t.get(pc).unwrap().sibling(), Some(pb));
            assert_eq!(a.utilization(), 4 * 512);

            t.terminate(pa, a);
            t.check();
            assert_eq!(t.live_count(), 1);
            assert_eq!(t.iter().collect::<Vec<_>>(), [idle]);
            assert_eq!(t.children(idle).count(), 0);
            assert_eq!(t.ready(), &[idle]);
            assert!(t.get(pb).is_none() && t.get(pc).is_none());
            assert_eq!(a.utilization(), 512);
            a.check();
        });
    }

    #[test]
    fn childless_terminate_unlinks_once() {
        with_table(|t, a| {
            let idle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let older = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let middle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let newer = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            t.terminate(middle, a);
            t.terminate(middle, a);
            t.check();
            assert_eq!(t.children(idle).collect::<Vec<_>>(), [newer, older]);
            assert_eq!(t.iter().collect::<Vec<_>>(), [idle, older, newer]);
            assert_eq!(t.job(), &[idle, older, newer]);
        });
    }

    #[test]
    fn waiters_are_woken_with_the_child_id() {
        with_table(|t, a| {
            let idle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let parent = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let child = t.create(a, LAYOUT, 0x1000_0000, &[], Some(parent));
            t.admit_all();
            let child_id = t.id_of(child).unwrap();

            let psp = t.dispatch(parent, t.id_of(parent).unwrap(), 0).unwrap();
            assert!(t.undispatch(parent, psp, a));
            t.block_on(parent, child_id);
            assert_eq!(t.device(), &[parent]);
            t.check();

            t.terminate(child, a);
            t.check();
            assert_eq!(t.ready(), &[idle, parent]);
            let frame = context::SavedFrame::load(a.arena(), psp).unwrap();
            assert_eq!(frame.r0, child_id.0);
            assert_eq!(t.get(parent).unwrap().waiting_on(), None);
        });
    }

    #[test]
    fn terminating_a_running_process_defers_the_reap() {
        with_table(|t, a| {
            let _idle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let p = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            t.admit_all();
            let id = t.id_of(p).unwrap();
            let psp = t.dispatch(p, id, 1).unwrap();
            assert_eq!(t.get(p).unwrap().status(), Executing);

            t.terminate(p, a);
            t.check();
            assert_eq!(t.find(id), None);
            assert_eq!(t.live_count(), 1);
            // Still holding memory until core 1 hands it back.
            assert_eq!(a.utilization(), 2 * 512);

            assert!(!t.undispatch(p, psp, a));
            assert!(t.get(p).is_none());
            assert_eq!(a.utilization(), 512);
        });
    }

    #[test]
    fn evicted_processes_come_back_unchanged() {
        with_table(|t, a| {
            let _idle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let p = t.create(a, LAYOUT, 0x1000_0010, &[5, 6], None);
            t.admit_all();
            let home = t.get(p).unwrap().home();
            let psp = t.dispatch(p, t.id_of(p).unwrap(), 0).unwrap() - 8;
            a.arena_mut().slice_mut(home.start, 4).unwrap().copy_from_slice(b"heap");
            assert!(t.undispatch(p, psp, a));
            t.requeue(p);

            assert!(t.evict(p, a));
            assert!(!t.evict(p, a));
            assert_eq!(t.get(p).unwrap().status(), SwappedReady);
            assert!(t.get(p).unwrap().space().is_none());
            assert_eq!(a.resident(), 512);
            assert_eq!(a.utilization(), 1024);
            t.check();
            a.check();

            // Scribble over where it used to be.
            a.allocate_at(home.start, 512, Kind::FileData).unwrap();
            a.arena_mut().slice_mut(home.start, 512).unwrap().fill(0xee);
            assert_eq!(t.swap_in(p, a), Err(AllocError::Occupied));
            a.deallocate(home.start);

            t.swap_in(p, a).unwrap();
            t.check();
            a.check();
            assert_eq!(a.utilization(), 1024);
            let space = t.get(p).unwrap().space().unwrap();
            assert_eq!(space.range(), home);
            assert_eq!(space.stack_pointer(), psp);
            assert_eq!(a.arena().slice(home.start, 4).unwrap(), b"heap");
            let frame = context::SavedFrame::load(a.arena(), psp + 8).unwrap();
            assert_eq!((frame.pc, frame.r0, frame.r1), (0x1000_0011, 5, 6));
        });
    }

    #[test]
    fn a_swapped_waiter_still_gets_the_child_id() {
        with_table(|t, a| {
            let _idle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let parent = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let child = t.create(a, LAYOUT, 0x1000_0000, &[], Some(parent));
            t.admit_all();
            let child_id = t.id_of(child).unwrap();

            let psp = t.dispatch(parent, t.id_of(parent).unwrap(), 0).unwrap();
            assert!(t.undispatch(parent, psp, a));
            t.block_on(parent, child_id);
            assert!(t.evict(parent, a));
            assert_eq!(t.get(parent).unwrap().status(), SwappedBlocked);

            t.terminate(child, a);
            t.check();
            assert_eq!(t.get(parent).unwrap().status(), SwappedReady);

            t.swap_in(parent, a).unwrap();
            t.check();
            assert_eq!(t.ready().last(), Some(&parent));
            let frame = context::SavedFrame::load(a.arena(), psp).unwrap();
            assert_eq!(frame.r0, child_id.0);
        });
    }

    #[test]
    fn terminating_a_swapped_process_frees_its_image() {
        with_table(|t, a| {
            let _idle = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            let p = t.create(a, LAYOUT, 0x1000_0000, &[], None);
            t.admit_all();
            assert!(t.evict(p, a));
            assert_eq!(a.utilization(), 1024);
            t.terminate(p, a);
            t.check();
            a.check();
            assert_eq!(a.utilization(), 512);
        });
    }

    #[test]
    #[should_panic(expected = "process table exhausted")]
    fn table_exhaustion_is_fatal() {
        with_table(|t, a| {
            for _ in 0..9 {
                t.create(a, LAYOUT, 0x1000_0000, &[], None);
            }
        });
    }
}
