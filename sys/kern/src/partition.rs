// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partition allocator.
//!
//! The arena is cut into equal partitions. Each partition carries a `Tag`
//! saying what it holds, which is what diagnostics print and what the
//! utilization figure is computed from. How partitions are grouped into
//! allocations is recorded separately, in a side table of `Extent`s, so the
//! tag map stays a plain picture of memory.
//!
//! Requests of at least a partition take a first-fit run of whole
//! partitions. Smaller requests are rounded up to 8 bytes and packed into a
//! partition already holding smaller allocations of the same kind, or into a
//! fresh one. A shared partition is bump-allocated: space is reclaimed only
//! when the most recent allocation in it is freed, or when all of them are.
//!
//! Process spaces and swap images always take whole partitions, so a space
//! can be given back and later reclaimed at the same address. Swap images
//! are placed last-fit from the top of the arena and don't count as
//! resident: the memory budget limits `resident`, not `utilization`.

use arrayvec::ArrayVec;

use crate::config::PARTITION_COUNT;
use crate::err::AllocError;
use crate::umem::Arena;

/// What an allocation is for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    KernelData,
    ProcessSpace,
    FileData,
    /// Anything else the kernel needs, such as a core's stack.
    Flag,
    /// Copy of an evicted process's address space.
    Swap,
}

/// Most small allocations one partition will hold.
pub const SHARED_LIMIT: usize = 8;

/// Per-partition picture of the arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tag {
    Unallocated,
    KernelData,
    ProcessSpace,
    FileData,
    Flag,
    Swap,
    /// Shared by this many small allocations.
    Mixed(u16),
}

impl Kind {
    /// Checks whether requests smaller than a partition may share one.
    fn packs(self) -> bool {
        !matches!(self, Kind::ProcessSpace | Kind::Swap)
    }
}

impl From<Kind> for Tag {
    fn from(k: Kind) -> Self {
        match k {
            Kind::KernelData => Tag::KernelData,
            Kind::ProcessSpace => Tag::ProcessSpace,
            Kind::FileData => Tag::FileData,
            Kind::Flag => Tag::Flag,
            Kind::Swap => Tag::Swap,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Extent {
    Free,
    /// First partition of a run of this many.
    Run(u16),
    /// Later partition of a run.
    Continued,
    /// Partition holding small allocations at `offsets`, in ascending order,
    /// packed into the first `used` bytes.
    Shared {
        kind: Kind,
        used: u16,
        offsets: ArrayVec<u16, SHARED_LIMIT>,
    },
}

pub struct Allocator<'a> {
    arena: Arena<'a>,
    partition_size: usize,
    tags: ArrayVec<Tag, PARTITION_COUNT>,
    extents: ArrayVec<Extent, PARTITION_COUNT>,
    /// Partitions whose tag isn't `Unallocated`.
    occupied: usize,
}

impl<'a> Allocator<'a> {
    pub fn new(arena: Arena<'a>, partition_size: usize) -> Self {
        uassert!(partition_size != 0 && partition_size % 8 == 0);
        uassert!(partition_size <= usize::from(u16::MAX));
        let count = arena.len() / partition_size;
        uassert!(count <= PARTITION_COUNT);
        uassert!(arena.base() % 8 == 0);

        let mut tags = ArrayVec::new();
        let mut extents = ArrayVec::new();
        for _ in 0..count {
            tags.push(Tag::Unallocated);
            extents.push(Extent::Free);
        }
        Self {
            arena,
            partition_size,
            tags,
            extents,
            occupied: 0,
        }
    }

    pub fn arena(&self) -> &Arena<'a> {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena<'a> {
        &mut self.arena
    }

    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Bytes in partitions that are at least partly allocated.
    pub fn utilization(&self) -> usize {
        self.occupied * self.partition_size
    }

    /// Utilization, less the partitions holding swap images.
    pub fn resident(&self) -> usize {
        let swap = self.tags.iter().filter(|t| **t == Tag::Swap).count();
        (self.occupied - swap) * self.partition_size
    }

    /// Bytes the allocator manages.
    pub fn capacity(&self) -> usize {
        self.tags.len() * self.partition_size
    }

    /// Rounds `size` up to what a whole-partition allocation of it would
    /// add to `utilization`.
    pub fn footprint(&self, size: usize) -> usize {
        size.div_ceil(self.partition_size) * self.partition_size
    }

    fn addr_of(&self, partition: usize) -> u32 {
        self.arena.base() + (partition * self.partition_size) as u32
    }

    pub fn allocate(&mut self, size: usize, kind: Kind) -> Result<u32, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if size < self.partition_size && kind.packs() {
            return self.allocate_small(size.next_multiple_of(8), kind);
        }

        let n = size.div_ceil(self.partition_size);
        let first = if kind == Kind::Swap {
            self.find_run_from_top(n)
        } else {
            self.find_run(n)
        };
        let first = first.ok_or(AllocError::Exhausted)?;
        self.claim_run(first, n, kind);
        Ok(self.addr_of(first))
    }

    /// Allocates whole partitions starting exactly at `addr`, which must be
    /// the start of a partition.
    pub fn allocate_at(&mut self, addr: u32, size: usize, kind: Kind) -> Result<u32, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let first = match addr.checked_sub(self.arena.base()) {
            Some(o) if o as usize % self.partition_size == 0 => o as usize / self.partition_size,
            _ => panic!("allocating at {addr:#x}, not a partition boundary"),
        };
        let n = size.div_ceil(self.partition_size);
        let free = self
            .extents
            .get(first..first + n)
            .is_some_and(|run| run.iter().all(|e| *e == Extent::Free));
        if !free {
            return Err(AllocError::Occupied);
        }
        self.claim_run(first, n, kind);
        Ok(addr)
    }

    fn claim_run(&mut self, first: usize, n: usize, kind: Kind) {
        for p in first..first + n {
            self.tags[p] = kind.into();
            self.extents[p] = Extent::Continued;
        }
        self.extents[first] = Extent::Run(n as u16);
        self.occupied += n;
    }

    fn allocate_small(&mut self, size: usize, kind: Kind) -> Result<u32, AllocError> {
        let size = size as u16;
        let limit = self.partition_size as u16;

        for p in 0..self.extents.len() {
            if let Extent::Shared {
                kind: k,
                used,
                offsets,
            } = &mut self.extents[p]
            {
                if *k == kind && limit - *used >= size && !offsets.is_full() {
                    let at = *used;
                    offsets.push(at);
                    *used += size;
                    self.tags[p] = Tag::Mixed(offsets.len() as u16);
                    return Ok(self.addr_of(p) + u32::from(at));
                }
            }
        }

        let p = self.find_run(1).ok_or(AllocError::Exhausted)?;
        let mut offsets = ArrayVec::new();
        offsets.push(0);
        self.extents[p] = Extent::Shared {
            kind,
            used: size,
            offsets,
        };
        self.tags[p] = kind.into();
        self.occupied += 1;
        Ok(self.addr_of(p))
    }

    /// Returns the allocation at `addr`, which must be an address previously
    /// returned by `allocate` and not yet freed.
    pub fn deallocate(&mut self, addr: u32) {
        let offset = match addr.checked_sub(self.arena.base()) {
            Some(o) if (o as usize) < self.capacity() => o as usize,
            _ => panic!("deallocating {addr:#x}, outside the arena"),
        };
        let p = offset / self.partition_size;
        let within = (offset % self.partition_size) as u16;

        match &mut self.extents[p] {
            Extent::Run(n) if within == 0 => {
                let n = usize::from(*n);
                for q in p..p + n {
                    self.tags[q] = Tag::Unallocated;
                    self.extents[q] = Extent::Free;
                }
                self.occupied -= n;
            }
            Extent::Shared {
                kind,
                used,
                offsets,
            } => {
                let Some(i) = offsets.iter().position(|o| *o == within) else {
                    panic!("deallocating {addr:#x}, which is not an allocation");
                };
                offsets.remove(i);
                // Only the newest allocation can be rolled back.
                if i == offsets.len() {
                    *used = within;
                }
                let tag = match offsets.len() {
                    0 => Tag::Unallocated,
                    1 => Tag::from(*kind),
                    n => Tag::Mixed(n as u16),
                };
                self.tags[p] = tag;
                if tag == Tag::Unallocated {
                    self.extents[p] = Extent::Free;
                    self.occupied -= 1;
                }
            }
            _ => panic!("deallocating {addr:#x}, which is not an allocation"),
        }
    }

    fn find_run(&self, n: usize) -> Option<usize> {
        let mut start = 0;
        let mut len = 0;
        for (p, extent) in self.extents.iter().enumerate() {
            if *extent == Extent::Free {
                if len == 0 {
                    start = p;
                }
                len += 1;
                if len == n {
                    return Some(start);
                }
            } else {
                len = 0;
            }
        }
        None
    }

    /// Like `find_run`, but takes the highest run that fits.
    fn find_run_from_top(&self, n: usize) -> Option<usize> {
        let mut len = 0;
        for (p, extent) in self.extents.iter().enumerate().rev() {
            if *extent == Extent::Free {
                len += 1;
                if len == n {
                    return Some(p);
                }
            } else {
                len = 0;
            }
        }
        None
    }

    /// Cross-checks the tag map against the side table.
    pub fn check(&self) {
        let mut occupied = 0;
        let mut run_left = 0;
        for (tag, extent) in self.tags.iter().zip(&self.extents) {
            if *tag != Tag::Unallocated {
                occupied += 1;
            }
            match extent {
                Extent::Free => {
                    assert_eq!(run_left, 0);
                    assert_eq!(*tag, Tag::Unallocated);
                }
                Extent::Run(n) => {
                    assert_eq!(run_left, 0);
                    assert_ne!(*tag, Tag::Unallocated);
                    run_left = n - 1;
                }
                Extent::Continued => {
                    assert!(run_left > 0);
                    run_left -= 1;
                }
                Extent::Shared {
                    kind,
                    used,
                    offsets,
                } => {
                    assert_eq!(run_left, 0);
                    assert!(!offsets.is_empty());
                    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
                    assert!(offsets.iter().all(|o| o < used));
                    assert!(usize::from(*used) <= self.partition_size);
                    let expected = match offsets.len() {
                        1 => Tag::from(*kind),
                        n => Tag::Mixed(n as u16),
                    };
                    assert_eq!(*tag, expected);
                }
            }
        }
        assert_eq!(run_left, 0);
        assert_eq!(occupied, self.occupied);
    }
}

/// File contents are stored in the arena too.
impl filestore::Storage for Allocator<'_> {
    fn allocate(&mut self, size: usize) -> Option<u32> {
        Allocator::allocate(self, size, Kind::FileData).ok()
    }

    fn release(&mut self, addr: u32) {
        self.deallocate(addr);
    }

    fn load(&self, addr: u32, out: &mut [u8]) {
        match self.arena.slice(addr, out.len()) {
            Some(bytes) => out.copy_from_slice(bytes),
            None => panic!("file data at {addr:#x} outside the arena"),
        }
    }

    fn store(&mut self, addr: u32, data: &[u8]) {
        match self.arena.slice_mut(addr, data.len()) {
            Some(bytes) => bytes.copy_from_slice(data),
            None => panic!("file data at {addr:#x} outside the arena"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: u32 = 0x2000_0000;

    fn with_allocator<R>(partitions: usize, body: impl FnOnce(&mut Allocator<'_>) -> R) -> R {
        let mut memory = vec![0u8; partitions * 256];
        let mut alloc = Allocator::new(Arena::new(&mut memory, BASE), 256);
        body(&mut alloc)
    }

    #[test]
    fn first_fit_runs() {
        with_allocator(8, |a| {
            let x = a.allocate(256, Kind::ProcessSpace).unwrap();
            let y = a.allocate(300, Kind::ProcessSpace).unwrap();
            assert_eq!(x, BASE);
            assert_eq!(y, BASE + 256);
            assert_eq!(a.utilization(), 3 * 256);
            a.deallocate(x);
            // A 2-partition hole doesn't fit in the 1-partition gap.
            let z = a.allocate(512, Kind::FileData).unwrap();
            assert_eq!(z, BASE + 3 * 256);
            let w = a.allocate(1, Kind::Flag).unwrap();
            assert_eq!(w, BASE);
            a.check();
            assert_eq!(a.allocate(4 * 256, Kind::Flag), Err(AllocError::Exhausted));
            assert_eq!(a.allocate(0, Kind::Flag), Err(AllocError::ZeroSize));
        });
    }

    #[test]
    fn small_allocations_share_a_partition() {
        with_allocator(4, |a| {
            let f1 = a.allocate(12, Kind::FileData).unwrap();
            let f2 = a.allocate(13, Kind::FileData).unwrap();
            let k = a.allocate(8, Kind::KernelData).unwrap();
            assert_eq!(f1, BASE);
            assert_eq!(f2, BASE + 16);
            assert_eq!(k, BASE + 256);
            assert_eq!(a.tags()[..2], [Tag::Mixed(2), Tag::KernelData]);
            assert_eq!(a.utilization(), 512);

            a.deallocate(f1);
            assert_eq!(a.tags()[0], Tag::FileData);
            // f1's bytes stay stranded until f2 goes as well.
            let f3 = a.allocate(8, Kind::FileData).unwrap();
            assert_eq!(f3, BASE + 32);
            a.deallocate(f3);
            assert_eq!(a.allocate(8, Kind::FileData), Ok(BASE + 32));
            a.check();
        });
    }

    #[test]
    #[should_panic]
    fn freeing_the_middle_of_a_run_is_fatal() {
        with_allocator(4, |a| {
            let x = a.allocate(600, Kind::ProcessSpace).unwrap();
            a.deallocate(x + 256);
        });
    }

    #[test]
    #[should_panic(expected = "not an allocation")]
    fn freeing_inside_a_small_allocation_is_fatal() {
        with_allocator(4, |a| {
            let f1 = a.allocate(12, Kind::FileData).unwrap();
            let _f2 = a.allocate(12, Kind::FileData).unwrap();
            a.deallocate(f1 + 4);
        });
    }

    #[test]
    #[should_panic(expected = "not an allocation")]
    fn freeing_a_small_allocation_twice_is_fatal() {
        with_allocator(4, |a| {
            let f1 = a.allocate(12, Kind::FileData).unwrap();
            let _f2 = a.allocate(12, Kind::FileData).unwrap();
            a.deallocate(f1);
            a.deallocate(f1);
        });
    }

    #[test]
    fn a_shared_partition_outlives_all_but_its_last_allocation() {
        with_allocator(4, |a| {
            let f1 = a.allocate(12, Kind::FileData).unwrap();
            let f2 = a.allocate(12, Kind::FileData).unwrap();
            a.deallocate(f1);
            assert_eq!(a.tags()[0], Tag::FileData);
            // f2 is still there, so nothing new may land on top of it.
            let f3 = a.allocate(12, Kind::FileData).unwrap();
            assert_eq!(f3, f2 + 16);
            a.deallocate(f2);
            a.deallocate(f3);
            assert_eq!(a.tags()[0], Tag::Unallocated);
            a.check();
        });
    }

    #[test]
    fn swap_images_sit_at_the_top_and_are_not_resident() {
        with_allocator(8, |a| {
            let p = a.allocate(512, Kind::ProcessSpace).unwrap();
            let s = a.allocate(300, Kind::Swap).unwrap();
            assert_eq!(s, BASE + 6 * 256);
            let small = a.allocate(8, Kind::Swap).unwrap();
            assert_eq!(small, BASE + 5 * 256);
            assert_eq!(a.utilization(), 5 * 256);
            assert_eq!(a.resident(), 2 * 256);
            a.check();

            a.deallocate(p);
            assert_eq!(a.allocate_at(p + 256, 256, Kind::ProcessSpace), Ok(p + 256));
            assert_eq!(
                a.allocate_at(p, 512, Kind::ProcessSpace),
                Err(AllocError::Occupied)
            );
            assert_eq!(
                a.allocate_at(s - 256, 512, Kind::ProcessSpace),
                Err(AllocError::Occupied)
            );
            assert_eq!(a.allocate_at(p, 256, Kind::ProcessSpace), Ok(p));
            assert_eq!(a.resident(), 2 * 256);
            a.check();
        });
    }

    #[test]
    fn file_storage_lands_in_the_arena() {
        use filestore::Storage;
        with_allocator(2, |a| {
            let addr = Storage::allocate(a, 12).unwrap();
            a.store(addr, b"Hello World!");
            let mut back = [0; 12];
            a.load(addr, &mut back);
            assert_eq!(&back, b"Hello World!");
            assert_eq!(a.arena().slice(addr, 12).unwrap(), b"Hello World!");
            assert_eq!(a.tags()[0], Tag::FileData);
        });
    }

    fn kind() -> impl Strategy<Value = Kind> {
        prop_oneof![
            Just(Kind::KernelData),
            Just(Kind::ProcessSpace),
            Just(Kind::FileData),
            Just(Kind::Flag),
        ]
    }

    proptest! {
        /// Any allocation followed by its deallocation leaves the tag map and
        /// utilization as they were, whatever else is live.
        #[test]
        fn allocate_then_free_restores_the_map(
            setup in proptest::collection::vec((1usize..700, kind()), 0..12),
            size in 1usize..1200,
            k in kind(),
        ) {
            with_allocator(16, |a| {
                for (size, kind) in setup {
                    let _ = a.allocate(size, kind);
                }
                a.check();
                let tags: Vec<Tag> = a.tags().to_vec();
                let before = a.utilization();
                if let Ok(addr) = a.allocate(size, k) {
                    prop_assert!(a.utilization() >= before);
                    a.check();
                    a.deallocate(addr);
                }
                a.check();
                prop_assert_eq!(a.tags(), &tags[..]);
                prop_assert_eq!(a.utilization(), before);
                Ok(())
            })?;
        }

        /// Utilization is always the occupied partition count times the
        /// partition size, and never exceeds capacity.
        #[test]
        fn utilization_matches_tags(
            ops in proptest::collection::vec((1usize..900, kind(), any::<bool>()), 0..40),
        ) {
            with_allocator(16, |a| {
                let mut live = Vec::new();
                for (size, kind, free) in ops {
                    if free && !live.is_empty() {
                        a.deallocate(live.swap_remove(size % live.len()));
                    } else if let Ok(addr) = a.allocate(size, kind) {
                        live.push(addr);
                    }
                    a.check();
                    let occupied = a.tags().iter().filter(|t| **t != Tag::Unallocated).count();
                    prop_assert_eq!(a.utilization(), occupied * 256);
                    prop_assert!(a.utilization() <= a.capacity());
                }
                Ok(())
            })?;
        }
    }
}
