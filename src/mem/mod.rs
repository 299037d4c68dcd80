//! Memory management: buddy heap, secure bump region, signed blocks.
//!
//! Init order matters: the heap region is chosen from the E820 map (or
//! the fallback constants in degraded boots), a 64 KiB secure tail is
//! carved off, and the buddy allocator takes the remainder. Everything
//! downstream (task stacks, message envelopes, queue rings) draws from
//! here.

pub mod buddy;
pub mod heap;
pub mod sblock;
pub mod secure;

use crate::boot::{self, BootInfo};
use crate::sync::InterruptSafeLock;
use buddy::{BuddyHeap, BuddyStats};
use secure::{SecureRegion, SECURE_REGION_SIZE};

static BUDDY: InterruptSafeLock<BuddyHeap> = InterruptSafeLock::new(BuddyHeap::new());
static SECURE: InterruptSafeLock<SecureRegion> = InterruptSafeLock::new(SecureRegion::new());

/// Carve the heap and secure region out of the boot memory map.
/// Returns the secure-region base for the boot log, or `None` when even
/// the fallback region was unusable.
///
/// # Safety
/// The selected region must be identity-mapped and otherwise unused.
/// Call once during init, before any allocation.
pub unsafe fn init(info: &BootInfo) -> Option<usize> {
    let mut map = [boot::MemoryRegion {
        base: 0,
        length: 0,
        kind: 0,
        attrs: 0,
    }; 32];
    let mut count = 0;
    for region in info.regions() {
        if count == map.len() {
            break;
        }
        map[count] = region;
        count += 1;
    }

    let (base, size) = boot::select_heap_region(&map[..count]).unwrap_or((
        boot::FALLBACK_HEAP_BASE,
        boot::FALLBACK_HEAP_SIZE,
    ));

    if (size as usize) <= SECURE_REGION_SIZE + buddy::MIN_BLOCK_SIZE {
        return None;
    }

    let heap_size = size as usize - SECURE_REGION_SIZE;
    let secure_base = base as usize + heap_size;

    BUDDY.lock().init(base as usize, heap_size);
    SECURE.lock().init(secure_base, SECURE_REGION_SIZE);
    Some(secure_base)
}

/// Allocate from the buddy heap. Payload pointer, or `None` on
/// exhaustion or a bad size.
pub fn kalloc(size: usize) -> Option<usize> {
    BUDDY.lock().alloc(size)
}

/// Return a `kalloc` pointer to the heap.
///
/// # Safety
/// `addr` must have come from `kalloc` and be dead.
pub unsafe fn kfree(addr: usize) {
    BUDDY.lock().free(addr);
}

pub fn stats() -> BuddyStats {
    BUDDY.lock().stats()
}

/// Bump-allocate from the secure region.
pub fn secure_alloc(size: usize) -> Option<usize> {
    SECURE.lock().alloc(size)
}

/// No-op: secure allocations live until reboot.
pub fn secure_free(addr: usize) {
    SECURE.lock().free(addr);
}

/// Run a closure with the buddy heap locked. The IPC layer uses this to
/// allocate envelopes and queue rings without re-taking the lock per
/// operation.
pub fn with_heap<R>(f: impl FnOnce(&mut BuddyHeap) -> R) -> R {
    f(&mut BUDDY.lock())
}

/// # Safety
/// Panic-path only: the holder of the lock, if any, must never resume.
pub unsafe fn force_unlock() {
    BUDDY.force_unlock();
    SECURE.force_unlock();
}
