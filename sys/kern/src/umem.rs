// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-managed memory and untrusted user buffers.
//!
//! Everything the kernel hands out (process address spaces, file contents,
//! the second core's stack) comes from one contiguous arena. The kernel
//! always names arena memory by the 32-bit address a process would use for
//! it; `Arena` translates those addresses to bytes with bounds checks, so the
//! same code runs against the real SRAM arena and against a buffer on a
//! development host.

use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;

use crate::err::UserError;
use crate::space::AddressSpace;

/// The kernel's memory arena.
///
/// This holds the arena exclusively for `'a`, the same way `&'a mut [u8]`
/// would, but can also be viewed as a `RawArena` so that memory can be lent
/// to a running process without holding a borrow across the context switch.
pub struct Arena<'a> {
    raw: RawArena,
    _marker: PhantomData<&'a mut [u8]>,
}

// Safety: `Arena` is a `&mut [u8]` in all but name.
unsafe impl Send for Arena<'_> {}

impl<'a> Arena<'a> {
    /// Takes over `memory`, which processes will address starting at `base`.
    pub fn new(memory: &'a mut [u8], base: u32) -> Self {
        let len = memory.len();
        uassert!(u32::try_from(len)
            .ok()
            .and_then(|len| base.checked_add(len))
            .is_some());
        Self {
            raw: RawArena {
                ptr: NonNull::from(memory).cast(),
                len,
                base,
            },
            _marker: PhantomData,
        }
    }

    pub fn base(&self) -> u32 {
        self.raw.base
    }

    pub fn len(&self) -> usize {
        self.raw.len
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len == 0
    }

    /// Address range covered by the arena.
    pub fn range(&self) -> Range<u32> {
        self.raw.base..self.raw.base + self.raw.len as u32
    }

    pub fn slice(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let offset = self.raw.offset(addr, len)?;
        // Safety: `offset` checked the range, and `&self` excludes writers.
        unsafe {
            Some(core::slice::from_raw_parts(
                self.raw.ptr.as_ptr().add(offset),
                len,
            ))
        }
    }

    pub fn slice_mut(&mut self, addr: u32, len: usize) -> Option<&mut [u8]> {
        let offset = self.raw.offset(addr, len)?;
        // Safety: `offset` checked the range, and `&mut self` excludes
        // everyone else.
        unsafe {
            Some(core::slice::from_raw_parts_mut(
                self.raw.ptr.as_ptr().add(offset),
                len,
            ))
        }
    }

    /// Copies `len` bytes from `src` to `dst`, both arena addresses. The
    /// ranges may overlap.
    pub fn copy(&mut self, src: u32, dst: u32, len: usize) -> Option<()> {
        let from = self.raw.offset(src, len)?;
        let to = self.raw.offset(dst, len)?;
        let all = self.slice_mut(self.raw.base, self.raw.len)?;
        all.copy_within(from..from + len, to);
        Some(())
    }

    /// Produces an unchecked view of the arena for `arch::resume`.
    pub fn raw(&self) -> RawArena {
        self.raw
    }
}

/// Lifetime-free view of an `Arena`.
///
/// This is what a running process "sees": while a process runs, the kernel
/// lock is released, and the process is trusted to touch only its own
/// address space.
#[derive(Copy, Clone, Debug)]
pub struct RawArena {
    ptr: NonNull<u8>,
    len: usize,
    base: u32,
}

// Safety: only dereferenced through the unsafe accessors below.
unsafe impl Send for RawArena {}
unsafe impl Sync for RawArena {}

impl RawArena {
    fn offset(&self, addr: u32, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)? as usize;
        (offset.checked_add(len)? <= self.len).then_some(offset)
    }

    /// Identifies this arena among others that may exist in one program.
    pub fn id(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Gets at arena memory from outside the kernel lock.
    ///
    /// # Safety
    ///
    /// The caller must be the process that owns `addr..addr + len`, which must
    /// be currently dispatched, and must not let the slice outlive its
    /// dispatch.
    pub unsafe fn slice_mut<'x>(
        &self,
        addr: u32,
        len: usize,
    ) -> Option<&'x mut [u8]> {
        let offset = self.offset(addr, len)?;
        // Safety: range checked above; exclusivity is on our caller.
        unsafe {
            Some(core::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(offset),
                len,
            ))
        }
    }
}

/// A (user, untrusted) byte slice.
///
/// A `USlice` is an _allegation_ from a process that a section of address
/// space is suitable for a syscall. Having one tells you only that the
/// section does not wrap around the end of the address space; to use the
/// memory, hand it to `read_user` or `write_user`, which check it against the
/// caller's address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct USlice {
    base_address: u32,
    length: u32,
}

impl USlice {
    pub fn from_raw(base_address: u32, length: u32) -> Result<Self, UserError> {
        base_address
            .checked_add(length)
            .ok_or(UserError::BadBuffer)?;
        Ok(Self {
            base_address,
            length,
        })
    }

    pub fn base_addr(&self) -> u32 {
        self.base_address
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Where a readable user buffer lives.
pub enum Readable {
    /// In the process's own address space, at the slice's address.
    Arena,
    /// In the read-only program image, where string constants live.
    Image(&'static [u8]),
}

/// Checks that a process may have the kernel read `slice`.
pub fn locate_readable(
    space: &AddressSpace,
    slice: USlice,
) -> Result<Readable, UserError> {
    if space.contains(slice.base_addr(), slice.len()) {
        return Ok(Readable::Arena);
    }
    if crate::arch::is_readonly_image(slice.base_addr(), slice.len()) {
        // Safety: the image is mapped, immutable, and lives forever.
        return Ok(Readable::Image(unsafe {
            core::slice::from_raw_parts(
                slice.base_addr() as usize as *const u8,
                slice.len(),
            )
        }));
    }
    Err(UserError::BadBuffer)
}

/// Borrows a buffer a process has passed in for the kernel to read.
pub fn read_user<'m>(
    arena: &'m Arena<'_>,
    space: &AddressSpace,
    slice: USlice,
) -> Result<&'m [u8], UserError> {
    match locate_readable(space, slice)? {
        Readable::Arena => arena
            .slice(slice.base_addr(), slice.len())
            .ok_or(UserError::BadBuffer),
        Readable::Image(bytes) => Ok(bytes),
    }
}

/// Borrows a buffer a process has passed in for the kernel to fill. It must
/// lie within the process's address space.
pub fn write_user<'m>(
    arena: &'m mut Arena<'_>,
    space: &AddressSpace,
    slice: USlice,
) -> Result<&'m mut [u8], UserError> {
    if !space.contains(slice.base_addr(), slice.len()) {
        return Err(UserError::BadBuffer);
    }
    arena
        .slice_mut(slice.base_addr(), slice.len())
        .ok_or(UserError::BadBuffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_addresses_are_bounds_checked() {
        let mut memory = [0u8; 64];
        let mut arena = Arena::new(&mut memory, 0x2000_0000);
        assert!(arena.slice(0x1fff_ffff, 1).is_none());
        assert!(arena.slice(0x2000_0000, 64).is_some());
        assert!(arena.slice(0x2000_0001, 64).is_none());
        assert!(arena.slice(0x2000_0040, 0).is_some());

        arena.slice_mut(0x2000_0000, 4).unwrap().copy_from_slice(b"abcd");
        arena.copy(0x2000_0000, 0x2000_0002, 4).unwrap();
        assert_eq!(arena.slice(0x2000_0000, 6).unwrap(), b"ababcd");
        assert!(arena.copy(0x2000_0000, 0x2000_003e, 4).is_none());
    }

    #[test]
    fn uslice_rejects_wraparound() {
        assert_eq!(USlice::from_raw(!0 - 3, 8), Err(UserError::BadBuffer));
        assert!(USlice::from_raw(!0 - 8, 8).is_ok());
    }
}
