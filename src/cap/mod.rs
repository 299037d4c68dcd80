//! Capability store.
//!
//! Every task owns a 16-bit rights mask in a flat table indexed by task
//! id. Slot 0 is the kernel and holds every bit; it can never be
//! destroyed and its kernel-mode bit can never be revoked. Each mutation
//! bumps a monotonic timestamp, so audits can order grants and revokes
//! after the fact.

use crate::sync::InterruptSafeLock;
use crate::MAX_TASKS;
use bitflags::bitflags;

bitflags! {
    /// The sixteen defined capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u16 {
        const MEMORY_ALLOC = 1 << 0;
        const MEMORY_FREE  = 1 << 1;
        const IO_READ      = 1 << 2;
        const IO_WRITE     = 1 << 3;
        const MSG_SEND     = 1 << 4;
        const MSG_RECEIVE  = 1 << 5;
        const IRQ_INSTALL  = 1 << 6;
        const IRQ_REMOVE   = 1 << 7;
        const TASK_CREATE  = 1 << 8;
        const TASK_DESTROY = 1 << 9;
        const PERM_GRANT   = 1 << 10;
        const PERM_REVOKE  = 1 << 11;
        const KERNEL_MODE  = 1 << 12;
        const SHELL_ACCESS = 1 << 13;
        const DEBUG        = 1 << 14;
        const ADMIN        = 1 << 15;
    }
}

/// Bits a child never inherits automatically: handing out grant/revoke
/// or the kernel-mode bypass must always be an explicit `grant`.
const NON_INHERITABLE: Caps = Caps::PERM_GRANT
    .union(Caps::PERM_REVOKE)
    .union(Caps::KERNEL_MODE);

static NAMES: [&str; 16] = [
    "MEMORY_ALLOC",
    "MEMORY_FREE",
    "IO_READ",
    "IO_WRITE",
    "MSG_SEND",
    "MSG_RECEIVE",
    "IRQ_INSTALL",
    "IRQ_REMOVE",
    "TASK_CREATE",
    "TASK_DESTROY",
    "PERM_GRANT",
    "PERM_REVOKE",
    "KERNEL_MODE",
    "SHELL_ACCESS",
    "DEBUG",
    "ADMIN",
];

/// Human-readable name of a single capability bit.
pub fn bit_name(bit: Caps) -> &'static str {
    for (i, name) in NAMES.iter().enumerate() {
        if bit.bits() == 1 << i {
            return name;
        }
    }
    "UNKNOWN"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// A task id outside the table.
    OutOfRange,
    /// The acting task lacks the bit that authorizes the operation.
    AccessDenied,
    /// The target slot is already active.
    SlotBusy,
    /// The target slot is not active.
    NotActive,
    /// The operation would touch the kernel slot.
    Protected,
}

#[derive(Debug, Clone, Copy)]
struct CapRecord {
    caps: Caps,
    parent_id: u32,
    granted_time: u64,
    active: bool,
}

impl CapRecord {
    const fn empty() -> Self {
        CapRecord {
            caps: Caps::empty(),
            parent_id: 0,
            granted_time: 0,
            active: false,
        }
    }
}

/// The flat rights table plus the mutation clock.
pub struct CapStore {
    records: [CapRecord; MAX_TASKS],
    stamp: u64,
}

impl CapStore {
    pub const fn new() -> Self {
        CapStore {
            records: [CapRecord::empty(); MAX_TASKS],
            stamp: 0,
        }
    }

    /// Reset the table: every slot inactive except slot 0, which gets
    /// the full mask.
    pub fn init(&mut self) {
        self.records = [CapRecord::empty(); MAX_TASKS];
        self.records[0] = CapRecord {
            caps: Caps::all(),
            parent_id: 0,
            granted_time: 0,
            active: true,
        };
        self.stamp = 0;
    }

    /// Register `child` under `parent` with `initial` rights, then fold
    /// in the parent's inheritable bits.
    pub fn create(&mut self, child: u32, parent: u32, initial: Caps) -> Result<(), CapError> {
        let (child_i, parent_i) = (child as usize, parent as usize);
        if child_i >= MAX_TASKS || parent_i >= MAX_TASKS {
            return Err(CapError::OutOfRange);
        }
        if !self.check(parent, Caps::TASK_CREATE) {
            return Err(CapError::AccessDenied);
        }
        if self.records[child_i].active {
            return Err(CapError::SlotBusy);
        }

        self.stamp += 1;
        let inherited = self.records[parent_i].caps & !NON_INHERITABLE;
        self.records[child_i] = CapRecord {
            caps: initial | inherited,
            parent_id: parent,
            granted_time: self.stamp,
            active: true,
        };
        Ok(())
    }

    /// Deactivate a slot. The kernel slot is untouchable.
    pub fn destroy(&mut self, task: u32) -> Result<(), CapError> {
        let i = task as usize;
        if i >= MAX_TASKS {
            return Err(CapError::OutOfRange);
        }
        if task == 0 {
            return Err(CapError::Protected);
        }
        self.records[i].active = false;
        self.records[i].caps = Caps::empty();
        Ok(())
    }

    /// OR `bits` into `target`'s mask. `granter` must hold PERM_GRANT.
    pub fn grant(&mut self, granter: u32, target: u32, bits: Caps) -> Result<(), CapError> {
        let t = target as usize;
        if granter as usize >= MAX_TASKS || t >= MAX_TASKS {
            return Err(CapError::OutOfRange);
        }
        if !self.check(granter, Caps::PERM_GRANT) {
            return Err(CapError::AccessDenied);
        }
        if !self.records[t].active {
            return Err(CapError::NotActive);
        }
        self.stamp += 1;
        self.records[t].caps |= bits;
        self.records[t].granted_time = self.stamp;
        Ok(())
    }

    /// Clear `bits` from `target`'s mask. `revoker` must hold
    /// PERM_REVOKE and the kernel slot is off limits.
    pub fn revoke(&mut self, revoker: u32, target: u32, bits: Caps) -> Result<(), CapError> {
        let t = target as usize;
        if revoker as usize >= MAX_TASKS || t >= MAX_TASKS {
            return Err(CapError::OutOfRange);
        }
        if !self.check(revoker, Caps::PERM_REVOKE) {
            return Err(CapError::AccessDenied);
        }
        if target == 0 {
            return Err(CapError::Protected);
        }
        if !self.records[t].active {
            return Err(CapError::NotActive);
        }
        self.stamp += 1;
        self.records[t].caps &= !bits;
        self.records[t].granted_time = self.stamp;
        Ok(())
    }

    /// True when `task` is active and either holds the kernel-mode
    /// bypass or every bit in `wanted`.
    pub fn check(&self, task: u32, wanted: Caps) -> bool {
        let i = task as usize;
        if i >= MAX_TASKS || !self.records[i].active {
            return false;
        }
        if self.records[i].caps.contains(Caps::KERNEL_MODE) {
            return true;
        }
        self.records[i].caps.contains(wanted)
    }

    /// The raw mask, or empty for an inactive slot.
    pub fn mask(&self, task: u32) -> Caps {
        let i = task as usize;
        if i >= MAX_TASKS || !self.records[i].active {
            return Caps::empty();
        }
        self.records[i].caps
    }

    pub fn timestamp(&self) -> u64 {
        self.stamp
    }

    pub fn parent_of(&self, task: u32) -> Option<u32> {
        let i = task as usize;
        if i >= MAX_TASKS || !self.records[i].active {
            return None;
        }
        Some(self.records[i].parent_id)
    }
}

static STORE: InterruptSafeLock<CapStore> = InterruptSafeLock::new(CapStore::new());

pub fn init() {
    STORE.lock().init();
}

pub fn create(child: u32, parent: u32, initial: Caps) -> Result<(), CapError> {
    STORE.lock().create(child, parent, initial)
}

pub fn destroy(task: u32) -> Result<(), CapError> {
    STORE.lock().destroy(task)
}

pub fn grant(granter: u32, target: u32, bits: Caps) -> Result<(), CapError> {
    STORE.lock().grant(granter, target, bits)
}

pub fn revoke(revoker: u32, target: u32, bits: Caps) -> Result<(), CapError> {
    STORE.lock().revoke(revoker, target, bits)
}

pub fn check(task: u32, wanted: Caps) -> bool {
    STORE.lock().check(task, wanted)
}

/// # Safety
/// Panic-path only: the holder of the lock, if any, must never resume.
pub unsafe fn force_unlock() {
    STORE.force_unlock();
}

pub fn mask(task: u32) -> Caps {
    STORE.lock().mask(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CapStore {
        let mut s = CapStore::new();
        s.init();
        s
    }

    #[test]
    fn kernel_slot_holds_everything() {
        let s = store();
        assert!(s.check(0, Caps::all()));
        assert!(s.check(0, Caps::KERNEL_MODE));
        assert_eq!(s.mask(0), Caps::all());
    }

    #[test]
    fn inheritance_masks_admin_bits() {
        let mut s = store();
        s.create(1, 0, Caps::MSG_SEND | Caps::MSG_RECEIVE).unwrap();

        // Inherited from the kernel: everything except grant, revoke and
        // kernel-mode.
        assert!(s.check(1, Caps::MSG_SEND));
        assert!(!s.check(1, Caps::KERNEL_MODE));
        assert!(!s.mask(1).contains(Caps::PERM_GRANT));
        assert!(!s.mask(1).contains(Caps::PERM_REVOKE));
        assert!(s.mask(1).contains(Caps::TASK_CREATE));
    }

    #[test]
    fn create_requires_task_create_bit() {
        let mut s = store();
        s.create(1, 0, Caps::MSG_SEND).unwrap();
        // Task 1 inherited TASK_CREATE from the kernel, so it can spawn.
        s.create(2, 1, Caps::empty()).unwrap();
        s.revoke(0, 2, Caps::TASK_CREATE).unwrap();
        assert_eq!(s.create(3, 2, Caps::empty()), Err(CapError::AccessDenied));
    }

    #[test]
    fn busy_slot_and_range_checks() {
        let mut s = store();
        s.create(1, 0, Caps::empty()).unwrap();
        assert_eq!(s.create(1, 0, Caps::empty()), Err(CapError::SlotBusy));
        assert_eq!(
            s.create(MAX_TASKS as u32, 0, Caps::empty()),
            Err(CapError::OutOfRange)
        );
        // Creating "the kernel" from a non-kernel parent collides with
        // the live slot 0.
        s.create(2, 0, Caps::empty()).unwrap();
        assert_eq!(s.create(0, 2, Caps::empty()), Err(CapError::SlotBusy));
    }

    #[test]
    fn grant_revoke_round_trip_restores_mask() {
        let mut s = store();
        s.create(1, 0, Caps::MSG_SEND).unwrap();
        let before = s.mask(1);
        s.grant(0, 1, Caps::DEBUG).unwrap();
        assert!(s.check(1, Caps::DEBUG));
        s.revoke(0, 1, Caps::DEBUG).unwrap();
        assert_eq!(s.mask(1), before);
    }

    #[test]
    fn kernel_slot_is_protected() {
        let mut s = store();
        assert_eq!(s.destroy(0), Err(CapError::Protected));
        assert_eq!(s.revoke(0, 0, Caps::KERNEL_MODE), Err(CapError::Protected));
        assert!(s.check(0, Caps::KERNEL_MODE));
    }

    #[test]
    fn timestamp_strictly_increases() {
        let mut s = store();
        let mut last = s.timestamp();
        s.create(1, 0, Caps::MSG_SEND).unwrap();
        assert!(s.timestamp() > last);
        last = s.timestamp();
        s.grant(0, 1, Caps::DEBUG).unwrap();
        assert!(s.timestamp() > last);
        last = s.timestamp();
        s.revoke(0, 1, Caps::DEBUG).unwrap();
        assert!(s.timestamp() > last);
    }

    #[test]
    fn kernel_mode_bypasses_bit_checks() {
        let mut s = store();
        s.create(1, 0, Caps::empty()).unwrap();
        s.grant(0, 1, Caps::KERNEL_MODE).unwrap();
        assert!(s.check(1, Caps::ADMIN | Caps::IRQ_INSTALL));
    }

    #[test]
    fn inactive_slots_fail_checks() {
        let mut s = store();
        assert!(!s.check(5, Caps::MSG_SEND));
        s.create(5, 0, Caps::MSG_SEND).unwrap();
        assert!(s.check(5, Caps::MSG_SEND));
        s.destroy(5).unwrap();
        assert!(!s.check(5, Caps::MSG_SEND));
        assert_eq!(s.mask(5), Caps::empty());
    }

    #[test]
    fn bit_names() {
        assert_eq!(bit_name(Caps::MSG_SEND), "MSG_SEND");
        assert_eq!(bit_name(Caps::ADMIN), "ADMIN");
        assert_eq!(bit_name(Caps::MSG_SEND | Caps::ADMIN), "UNKNOWN");
    }
}
