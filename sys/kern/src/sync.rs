// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel lock.
//!
//! Both cores run the scheduler over the same state, so that state sits in a
//! `KernelMutex`. The lock is never held while a process runs, and is not
//! reentrant: taking it twice on one core deadlocks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::arch::RawLock;

pub struct KernelMutex<T> {
    lock: RawLock,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `lock`.
unsafe impl<T: Send> Sync for KernelMutex<T> {}
unsafe impl<T: Send> Send for KernelMutex<T> {}

impl<T> KernelMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: RawLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> KernelGuard<'_, T> {
        self.lock.lock();
        KernelGuard { mutex: self }
    }
}

/// Access to the locked data; the lock is released on drop.
pub struct KernelGuard<'a, T> {
    mutex: &'a KernelMutex<T>,
}

impl<T> Deref for KernelGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for KernelGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock, and `&mut self` keeps this unique.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for KernelGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}
