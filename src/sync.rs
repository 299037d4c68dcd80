//! Interrupt-safe locking.
//!
//! A spinlock that disables interrupts while held. Holding a plain
//! spinlock across an interrupt is a deadlock waiting to happen: the
//! handler spins on a lock its own CPU already owns. Every structure
//! that is touched from both task context and interrupt context goes
//! behind one of these.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock whose guard records the interrupt-flag state at acquisition,
/// clears IF, and restores the recorded state on drop.
pub struct InterruptSafeLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for InterruptSafeLock<T> {}
unsafe impl<T: Send> Send for InterruptSafeLock<T> {}

impl<T> InterruptSafeLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning with interrupts disabled.
    pub fn lock(&self) -> InterruptSafeGuard<'_, T> {
        // IF must be clear before the first CAS attempt; an interrupt
        // between the swap and the guard construction could re-enter.
        let were_enabled = interrupts_enabled();
        disable_interrupts();

        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        InterruptSafeGuard {
            lock: self,
            restore_interrupts: were_enabled,
        }
    }

    /// Try to acquire without spinning. Returns `None` if the lock is
    /// already held. Used by the scheduler's dispatch path as its
    /// re-entrance lock.
    pub fn try_lock(&self) -> Option<InterruptSafeGuard<'_, T>> {
        let were_enabled = interrupts_enabled();
        disable_interrupts();

        if self.locked.swap(true, Ordering::Acquire) {
            if were_enabled {
                enable_interrupts();
            }
            return None;
        }

        Some(InterruptSafeGuard {
            lock: self,
            restore_interrupts: were_enabled,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// # Safety
    /// Only meaningful if the caller knows the lock is currently held
    /// and its holder will never run again (panic path).
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct InterruptSafeGuard<'a, T> {
    lock: &'a InterruptSafeLock<T>,
    restore_interrupts: bool,
}

impl<T> Drop for InterruptSafeGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.restore_interrupts {
            enable_interrupts();
        }
    }
}

impl<T> Deref for InterruptSafeGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for InterruptSafeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(target_os = "none")]
#[inline]
fn interrupts_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

#[cfg(target_os = "none")]
#[inline]
fn disable_interrupts() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(target_os = "none")]
#[inline]
fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

// Host builds (unit tests) have no business flipping IF; the lock
// degrades to a plain spinlock there.
#[cfg(not(target_os = "none"))]
#[inline]
fn interrupts_enabled() -> bool {
    false
}

#[cfg(not(target_os = "none"))]
#[inline]
fn disable_interrupts() {}

#[cfg(not(target_os = "none"))]
#[inline]
fn enable_interrupts() {}
