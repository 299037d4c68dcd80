//! Signed memory blocks.
//!
//! Buddy-backed buffers with an integrity signature and access rules,
//! used when a payload outlives the call that produced it (zero-copy
//! handoffs, persisted tables). The owner signs after writing; any later
//! reader can verify that no byte changed in between. Sharing is
//! reference-counted so a block is only returned to the heap when the
//! last holder drops it.

use super::buddy::BuddyHeap;
use crate::sched::Uid;
use bitflags::bitflags;

/// "SBLKSIGN"
const SBLOCK_MAGIC: u64 = 0x5342_4C4B_5349_474E;

/// Largest signed-block payload.
const SBLOCK_MAX_SIZE: usize = 1024 * 1024;

bitflags! {
    /// Access rights carried by a block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SblockPerms: u8 {
        const READ  = 0x01;
        const WRITE = 0x02;
        const EXEC  = 0x04;
        const SHARE = 0x08;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SblockFlags: u8 {
        const VALID  = 0x01;
        const LOCKED = 0x02;
        const KERNEL = 0x04;
    }
}

/// 32-byte header preceding the payload.
#[repr(C)]
pub struct SignedBlock {
    magic: u64,
    signature: u32,
    size: u32,
    owner_uid: u8,
    permissions: u8,
    flags: u8,
    ref_count: u8,
    reserved: u32,
    // payload follows inline
}

const HEADER: usize = core::mem::size_of::<SignedBlock>();

impl SignedBlock {
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn owner(&self) -> u8 {
        self.owner_uid
    }

    fn payload_ptr(&self) -> *const u8 {
        (self as *const SignedBlock as usize + HEADER) as *const u8
    }

    fn payload_mut_ptr(&mut self) -> *mut u8 {
        (self as *mut SignedBlock as usize + HEADER) as *mut u8
    }

    fn payload(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.payload_ptr(), self.size as usize) }
    }
}

/// Bitwise CRC32 (IEEE polynomial), the block signature function.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Allocate a zeroed signed block of `size` payload bytes.
pub fn alloc(
    heap: &mut BuddyHeap,
    size: usize,
    owner: Uid,
    perms: SblockPerms,
) -> Option<*mut SignedBlock> {
    if size == 0 || size > SBLOCK_MAX_SIZE {
        return None;
    }
    let total = HEADER + size;
    let addr = heap.alloc(total)?;
    unsafe {
        core::ptr::write_bytes(addr as *mut u8, 0, total);
        let blk = addr as *mut SignedBlock;
        (*blk).magic = SBLOCK_MAGIC;
        (*blk).signature = 0;
        (*blk).size = size as u32;
        (*blk).owner_uid = owner as u8;
        (*blk).permissions = perms.bits();
        (*blk).flags = SblockFlags::VALID.bits();
        (*blk).ref_count = 1;
        Some(blk)
    }
}

/// Drop one reference; the block goes back to the heap when the count
/// reaches zero (the magic is wiped first so stale pointers fail the
/// header check).
///
/// # Safety
/// `blk` must come from `alloc` on this heap.
pub unsafe fn free(heap: &mut BuddyHeap, blk: *mut SignedBlock) {
    if blk.is_null() || (*blk).magic != SBLOCK_MAGIC {
        return;
    }
    if (*blk).ref_count > 0 {
        (*blk).ref_count -= 1;
    }
    if (*blk).ref_count == 0 {
        (*blk).magic = 0;
        heap.free(blk as usize);
    }
}

/// Add a reference for another holder. Requires the SHARE permission;
/// kernel-flagged blocks may only be shared down to root.
pub fn share(blk: *mut SignedBlock, target_uid: Uid) -> Result<(), ()> {
    unsafe {
        if blk.is_null() || (*blk).magic != SBLOCK_MAGIC {
            return Err(());
        }
        if SblockPerms::from_bits_truncate((*blk).permissions) & SblockPerms::SHARE
            != SblockPerms::SHARE
        {
            return Err(());
        }
        if SblockFlags::from_bits_truncate((*blk).flags).contains(SblockFlags::KERNEL)
            && target_uid as u8 > Uid::Root as u8
        {
            return Err(());
        }
        if (*blk).ref_count == u8::MAX {
            return Err(());
        }
        (*blk).ref_count += 1;
        Ok(())
    }
}

/// Stamp the signature of the current payload contents.
pub fn sign(blk: *mut SignedBlock) {
    unsafe {
        if blk.is_null() || (*blk).magic != SBLOCK_MAGIC {
            return;
        }
        (*blk).signature = crc32((*blk).payload());
    }
}

/// Recompute the payload signature and compare against the stamp.
pub fn verify(blk: *const SignedBlock) -> bool {
    unsafe {
        if blk.is_null() || (*blk).magic != SBLOCK_MAGIC {
            return false;
        }
        if !SblockFlags::from_bits_truncate((*blk).flags).contains(SblockFlags::VALID) {
            return false;
        }
        crc32((*blk).payload()) == (*blk).signature
    }
}

/// Resolve the payload pointer for `uid`, applying the access rules:
/// owner and kernel bypass the permission bits, everyone else needs the
/// requested bit, and kernel-flagged blocks refuse anything below root.
pub fn access(blk: *mut SignedBlock, uid: Uid, perm: SblockPerms) -> Option<*mut u8> {
    unsafe {
        if blk.is_null() || (*blk).magic != SBLOCK_MAGIC {
            return None;
        }
        if !SblockFlags::from_bits_truncate((*blk).flags).contains(SblockFlags::VALID) {
            return None;
        }
        if uid as u8 == (*blk).owner_uid || uid == Uid::Kernel {
            return Some((*blk).payload_mut_ptr());
        }
        if !SblockPerms::from_bits_truncate((*blk).permissions).contains(perm) {
            return None;
        }
        if SblockFlags::from_bits_truncate((*blk).flags).contains(SblockFlags::KERNEL)
            && uid as u8 > Uid::Root as u8
        {
            return None;
        }
        Some((*blk).payload_mut_ptr())
    }
}
