// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process address spaces.
//!
//! An address space is one contiguous arena allocation holding, from low to
//! high, text, data, heap, and stack regions. The heap grows up from the
//! bottom of its region through `sbrk`; the stack grows down from the top of
//! the allocation.
//!
//! Processes hold absolute pointers into their own space, so a space never
//! moves. Swapping one out releases its partitions, and swapping it back in
//! reclaims exactly the same ones.

use core::ops::Range;

use crate::err::AllocError;
use crate::partition::{Allocator, Kind};

/// Region sizes, in bytes, each a multiple of 8.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    pub text: u32,
    pub data: u32,
    pub heap: u32,
    pub stack: u32,
}

impl Layout {
    pub fn total(&self) -> u32 {
        self.text + self.data + self.heap + self.stack
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressSpace {
    base: u32,
    layout: Layout,
    heap_cursor: u32,
    /// Saved stack pointer of the process, valid while it isn't running.
    stack_pointer: u32,
}

impl AddressSpace {
    pub fn allocate(alloc: &mut Allocator<'_>, layout: Layout) -> Result<Self, AllocError> {
        let base = alloc.allocate(layout.total() as usize, Kind::ProcessSpace)?;
        let space = Self {
            base,
            layout,
            heap_cursor: 0,
            stack_pointer: 0,
        };
        Ok(Self {
            heap_cursor: space.heap().start,
            stack_pointer: space.stack_top(),
            ..space
        })
    }

    pub fn release(&self, alloc: &mut Allocator<'_>) {
        alloc.deallocate(self.base);
    }

    /// Takes back the partitions this space occupied before `release`.
    pub fn reclaim(&self, alloc: &mut Allocator<'_>) -> Result<(), AllocError> {
        alloc
            .allocate_at(self.base, self.size(), Kind::ProcessSpace)
            .map(drop)
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.layout.total() as usize
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn range(&self) -> Range<u32> {
        self.base..self.base + self.layout.total()
    }

    pub fn text(&self) -> Range<u32> {
        let start = self.base;
        start..start + self.layout.text
    }

    pub fn data(&self) -> Range<u32> {
        let start = self.text().end;
        start..start + self.layout.data
    }

    pub fn heap(&self) -> Range<u32> {
        let start = self.data().end;
        start..start + self.layout.heap
    }

    pub fn stack(&self) -> Range<u32> {
        let start = self.heap().end;
        start..start + self.layout.stack
    }

    pub fn stack_top(&self) -> u32 {
        self.stack().end
    }

    pub fn stack_pointer(&self) -> u32 {
        self.stack_pointer
    }

    pub fn set_stack_pointer(&mut self, psp: u32) {
        uassert!(self.stack().contains(&psp));
        self.stack_pointer = psp;
    }

    /// Checks whether `addr..addr + len` lies entirely within this space.
    pub fn contains(&self, addr: u32, len: usize) -> bool {
        let range = self.range();
        let Some(end) = u32::try_from(len).ok().and_then(|l| addr.checked_add(l)) else {
            return false;
        };
        addr >= range.start && end <= range.end
    }

    /// Moves the heap cursor by `increment` bytes, returning its previous
    /// position, or `None` if that would leave the heap region.
    pub fn sbrk(&mut self, increment: i32) -> Option<u32> {
        let old = self.heap_cursor;
        let new = old.checked_add_signed(increment)?;
        if !(self.heap().start..=self.heap().end).contains(&new) {
            return None;
        }
        self.heap_cursor = new;
        Some(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::umem::Arena;

    const LAYOUT: Layout = Layout {
        text: 64,
        data: 64,
        heap: 128,
        stack: 256,
    };

    #[test]
    fn regions_stack_up() {
        let mut memory = vec![0u8; 4 * 256];
        let mut alloc = Allocator::new(Arena::new(&mut memory, 0x2000_0000), 256);
        let space = AddressSpace::allocate(&mut alloc, LAYOUT).unwrap();
        assert_eq!(space.text(), 0x2000_0000..0x2000_0040);
        assert_eq!(space.heap(), 0x2000_0080..0x2000_0100);
        assert_eq!(space.stack_top(), 0x2000_0200);
        assert_eq!(space.stack_pointer(), space.stack_top());
        assert_eq!(alloc.utilization(), 512);

        assert!(space.contains(0x2000_01f0, 16));
        assert!(!space.contains(0x2000_01f0, 17));
        assert!(!space.contains(0x1fff_fff0, 4));
        assert!(!space.contains(0xffff_fff0, 0x20));

        space.release(&mut alloc);
        assert_eq!(alloc.utilization(), 0);
        space.reclaim(&mut alloc).unwrap();
        assert_eq!(alloc.utilization(), 512);
        assert_eq!(space.reclaim(&mut alloc), Err(AllocError::Occupied));
    }

    #[test]
    fn sbrk_stays_in_the_heap() {
        let mut memory = vec![0u8; 4 * 256];
        let mut alloc = Allocator::new(Arena::new(&mut memory, 0x2000_0000), 256);
        let mut space = AddressSpace::allocate(&mut alloc, LAYOUT).unwrap();
        let start = space.heap().start;
        assert_eq!(space.sbrk(0), Some(start));
        assert_eq!(space.sbrk(100), Some(start));
        assert_eq!(space.sbrk(29), None);
        assert_eq!(space.sbrk(28), Some(start + 100));
        assert_eq!(space.sbrk(-128), Some(start + 128));
        assert_eq!(space.sbrk(-1), None);
    }
}
