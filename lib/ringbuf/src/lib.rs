// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing kernel events
//!
//! This contains an implementation for a static ring buffer designed to be used
//! to instrument the kernel's scheduling and bookkeeping paths. The buffers
//! live in statics so that they can be read back with a debugger (GDB's
//! `print` will do) after the fact, including after the kernel has halted.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! Recording is not a synchronization point. Entries are expected to be
//! recorded while holding whatever lock already serializes the code being
//! traced; a recorder that finds the buffer busy drops its entry rather than
//! waiting.
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! ringbuf!(Trace, 16, Trace::None);
//! // ...
//! ringbuf_entry!(Trace::Evicted(id));
//! ```
//!
//! You can also provide a name for the ring buffer, to distinguish between them
//! if you have more than one:
//!
//! ```ignore
//! ringbuf!(SWAP_RINGBUF, Trace, 16, Trace::None);
//! // ...
//! ringbuf_entry!(SWAP_RINGBUF, Trace::Evicted(id));
//! ```
//!
//! ## Inspecting a ring buffer via GDB
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print kern::sched::__RINGBUF
//! ```
//!
//! `last` is the index of the most recent entry. An entry identical to the
//! previous one (same `line` and `payload`) bumps `count` instead of consuming
//! a new slot.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
///
/// The actual type of `name` will be `TraceCell<Ringbuf<T, N>>`.
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::TraceCell<$crate::Ringbuf<$t, $n>> =
            $crate::TraceCell::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        if let Some(mut rb) = $crate::TraceCell::try_borrow_mut(buf) {
            $crate::Ringbuf::entry(&mut *rb, line!() as u16, p);
        }
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.  In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub fn entry(&mut self, line: u16, payload: T) {
        // If this is the same payload from the same line as last time, just
        // bump the count.
        if let Some(last) = self.last {
            let ent = &mut self.buffer[last];
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = match self.last {
            None => 0,
            Some(last) if last + 1 >= self.buffer.len() => 0,
            Some(last) => last + 1,
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Iterates over the recorded payloads, oldest first.
    pub fn payloads(&self) -> impl Iterator<Item = &T> + '_ {
        let start = self.last.map_or(0, |last| last + 1);
        let (newer, older) = self.buffer.split_at(start.min(N));
        older
            .iter()
            .chain(newer)
            .filter(|ent| ent.count != 0)
            .map(|ent| &ent.payload)
    }
}

/// A static container allowing one borrower at a time.
///
/// Unlike a mutex this never waits: a second borrower is told no.
pub struct TraceCell<T> {
    borrowed: AtomicBool,
    cell: UnsafeCell<T>,
}

impl<T> TraceCell<T> {
    /// Creates a `TraceCell` containing `contents`.
    pub const fn new(contents: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    /// Gets mutable access to the contents of `self`, or `None` if some
    /// `TraceRef` for `self` still exists.
    pub fn try_borrow_mut(&self) -> Option<TraceRef<'_, T>> {
        if claim(&self.borrowed) {
            return None;
        }
        // Safety: the check above ensures that we are not producing an aliasing
        // &mut to our contents.
        unsafe {
            Some(TraceRef {
                contents: &mut *self.cell.get(),
                borrow: &self.borrowed,
            })
        }
    }
}

unsafe impl<T> Sync for TraceCell<T> where for<'a> &'a mut T: Send {}

/// Sets `flag`, returning its previous value.
///
/// ARMv6-M has no atomic read-modify-write, so there this is a plain load and
/// store. That is only sound because every recorder on that target already
/// holds the kernel lock.
#[cfg(armv6m)]
fn claim(flag: &AtomicBool) -> bool {
    let orig = flag.load(Ordering::Acquire);
    flag.store(true, Ordering::Relaxed);
    orig
}

#[cfg(not(armv6m))]
fn claim(flag: &AtomicBool) -> bool {
    flag.swap(true, Ordering::Acquire)
}

pub struct TraceRef<'a, T> {
    contents: &'a mut T,
    borrow: &'a AtomicBool,
}

impl<T> Drop for TraceRef<'_, T> {
    fn drop(&mut self) {
        self.borrow.store(false, Ordering::Release);
    }
}

impl<T> core::ops::Deref for TraceRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &*self.contents
    }
}

impl<T> core::ops::DerefMut for TraceRef<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Ringbuf<u32, 4> {
        Ringbuf {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: 0,
            }; 4],
        }
    }

    #[test]
    fn repeated_entries_are_counted() {
        let mut rb = fresh();
        rb.entry(10, 7);
        rb.entry(10, 7);
        rb.entry(11, 7);
        assert_eq!(rb.last, Some(1));
        assert_eq!(rb.buffer[0].count, 2);
        assert_eq!(rb.buffer[1].count, 1);
    }

    #[test]
    fn wraps_and_reports_oldest_first() {
        let mut rb = fresh();
        for i in 1..=6 {
            rb.entry(1, i);
        }
        let seen: [u32; 4] = {
            let mut out = [0; 4];
            for (slot, p) in out.iter_mut().zip(rb.payloads()) {
                *slot = *p;
            }
            out
        };
        assert_eq!(seen, [3, 4, 5, 6]);
        assert_eq!(rb.buffer[0].generation, 2);
    }

    #[test]
    fn second_borrower_is_turned_away() {
        let cell = TraceCell::new(fresh());
        let first = cell.try_borrow_mut();
        assert!(first.is_some());
        assert!(cell.try_borrow_mut().is_none());
        drop(first);
        assert!(cell.try_borrow_mut().is_some());
    }
}
