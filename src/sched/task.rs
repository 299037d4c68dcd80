//! Task control blocks.
//!
//! Tasks live in a flat arena indexed by pid; the circular run list is
//! expressed through the `next` pid rather than owning pointers, so the
//! arena is the single owner of every task and its stack.

use crate::arch::stubs::{INITIAL_RFLAGS, KERNEL_CS, KERNEL_DS};
use crate::cap::Caps;

/// Per-task stack size, canary included.
pub const TASK_STACK_SIZE: usize = 4096;

/// Canary word stamped at the base of every task stack. Checked on each
/// dispatch; a mismatch is always fatal.
pub const STACK_MAGIC: u64 = 0xDEAD_CAFE_BABE_BEEF;

/// Named priority levels. Lower value wins selection.
pub const PRIORITY_REALTIME: u8 = 0;
pub const PRIORITY_SYSTEM: u8 = 31;
pub const PRIORITY_HIGH: u8 = 63;
pub const PRIORITY_NORMAL: u8 = 127;
pub const PRIORITY_LOW: u8 = 191;
pub const PRIORITY_IDLE: u8 = 255;

/// Millisecond quantum per priority tier (top three priority bits).
/// Real-time tasks get 1 ms slices, the idle tier coasts at 200 ms.
const QUANTUM_TABLE: [u16; 8] = [1, 5, 10, 20, 50, 75, 100, 200];

/// Quantum budget for a priority, from the tier table.
pub fn quantum_for(priority: u8) -> u16 {
    QUANTUM_TABLE[(priority >> 5) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Sleeping,
    WaitingMsg,
    Terminated,
}

/// User levels. Kernel and root both run in ring 0; the distinction is
/// purely capability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Uid {
    Kernel = 0,
    Root = 1,
    User = 2,
}

/// Default permission mask by user level.
pub fn default_perm_mask(uid: Uid) -> Caps {
    match uid {
        Uid::Kernel => Caps::all(),
        Uid::Root => Caps::all() & !Caps::KERNEL_MODE,
        Uid::User => {
            Caps::MEMORY_ALLOC
                | Caps::MEMORY_FREE
                | Caps::IO_READ
                | Caps::IO_WRITE
                | Caps::MSG_SEND
                | Caps::MSG_RECEIVE
                | Caps::SHELL_ACCESS
        }
    }
}

/// One task control block.
#[derive(Debug, Clone)]
pub struct Task {
    pub pid: u32,
    pub state: TaskState,
    /// Saved stack pointer; points at a full `TrapFrame` whenever the
    /// task is not running.
    pub rsp: u64,
    pub uid: Uid,
    pub priority: u8,
    pub quantum: u16,
    pub base_quantum: u16,
    /// Absolute wake time in milliseconds, valid while Sleeping.
    pub sleep_deadline: u64,
    /// Dispatch ticks this task has consumed.
    pub cpu_time: u64,
    pub start_time: u64,
    /// Base address of the owned stack; zero for the idle task, which
    /// runs on the boot stack.
    pub stack_base: usize,
    pub perm_mask: Caps,
    /// Pid of the next task on the circular list.
    pub next: u32,
}

impl Task {
    /// True when the canary word at the stack base is intact. Tasks
    /// without an owned stack (idle) always pass.
    pub fn canary_intact(&self) -> bool {
        if self.stack_base == 0 {
            return true;
        }
        unsafe { core::ptr::read_volatile(self.stack_base as *const u64) == STACK_MAGIC }
    }
}

/// Stamp the canary and lay out the initial interrupt-return frame on a
/// fresh stack. Returns the saved stack pointer to store in the TCB; the
/// first dispatch to this task unwinds the frame and lands at `entry`
/// with interrupts enabled.
///
/// # Safety
/// `stack_base` must point at `TASK_STACK_SIZE` writable bytes owned by
/// this task alone.
pub unsafe fn prepare_stack(stack_base: usize, entry: u64) -> u64 {
    core::ptr::write_volatile(stack_base as *mut u64, STACK_MAGIC);

    let top = (stack_base + TASK_STACK_SIZE) as *mut u64;
    let mut sp = top;
    let mut push = |value: u64| unsafe {
        sp = sp.sub(1);
        core::ptr::write_volatile(sp, value);
    };

    // CPU-pushed portion, as iretq expects it.
    push(KERNEL_DS); // ss
    push(stack_base as u64 + TASK_STACK_SIZE as u64 - 8); // rsp
    push(INITIAL_RFLAGS); // rflags
    push(KERNEL_CS); // cs
    push(entry); // rip

    // Stub-pushed portion: error code, vector, then the registers.
    push(0); // err_code
    push(0); // int_no
    for _ in 0..15 {
        push(0); // rax..r15
    }
    for _ in 0..4 {
        push(KERNEL_DS); // ds, es, fs, gs
    }

    sp as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TrapFrame;

    #[test]
    fn quantum_table_mapping() {
        assert_eq!(quantum_for(PRIORITY_REALTIME), 1);
        assert_eq!(quantum_for(PRIORITY_SYSTEM), 1); // 31 >> 5 == 0
        assert_eq!(quantum_for(PRIORITY_HIGH), 5); // 63 >> 5 == 1
        assert_eq!(quantum_for(64), 10);
        assert_eq!(quantum_for(PRIORITY_NORMAL), 20);
        assert_eq!(quantum_for(PRIORITY_LOW), 75);
        assert_eq!(quantum_for(PRIORITY_IDLE), 200);
    }

    #[test]
    fn perm_masks_by_uid() {
        assert_eq!(default_perm_mask(Uid::Kernel), Caps::all());
        assert!(!default_perm_mask(Uid::Root).contains(Caps::KERNEL_MODE));
        assert!(default_perm_mask(Uid::Root).contains(Caps::ADMIN));
        let user = default_perm_mask(Uid::User);
        assert!(user.contains(Caps::MSG_SEND));
        assert!(!user.contains(Caps::TASK_CREATE));
        assert!(!user.contains(Caps::KERNEL_MODE));
    }

    #[test]
    fn prepared_stack_is_a_valid_trap_frame() {
        let mut stack = vec![0u8; TASK_STACK_SIZE];
        let base = stack.as_mut_ptr() as usize;
        let entry = 0xFFFF_8000_1234_5678u64;

        let rsp = unsafe { prepare_stack(base, entry) };

        // Canary sits at the very base.
        assert_eq!(unsafe { *(base as *const u64) }, STACK_MAGIC);

        let frame = unsafe { &*(rsp as *const TrapFrame) };
        assert_eq!(frame.rip, entry);
        assert_eq!(frame.cs, KERNEL_CS);
        assert_eq!(frame.rflags, INITIAL_RFLAGS);
        assert_eq!(frame.ss, KERNEL_DS);
        assert_eq!(frame.ds, KERNEL_DS);
        assert_eq!(frame.gs, KERNEL_DS);
        assert_eq!(frame.rsp, base as u64 + TASK_STACK_SIZE as u64 - 8);
        assert_eq!(frame.rax, 0);
        assert_eq!(frame.r15, 0);
        assert_eq!(frame.int_no, 0);
        assert_eq!(frame.err_code, 0);

        // The frame occupies the top of the stack and nothing below it.
        let frame_bytes = core::mem::size_of::<TrapFrame>();
        assert_eq!(rsp as usize + frame_bytes, base + TASK_STACK_SIZE);
    }

    #[test]
    fn canary_detects_overflow() {
        let mut stack = vec![0u8; TASK_STACK_SIZE];
        let base = stack.as_mut_ptr() as usize;
        let task = Task {
            pid: 1,
            state: TaskState::Ready,
            rsp: 0,
            uid: Uid::User,
            priority: PRIORITY_NORMAL,
            quantum: 20,
            base_quantum: 20,
            sleep_deadline: 0,
            cpu_time: 0,
            start_time: 0,
            stack_base: base,
            perm_mask: default_perm_mask(Uid::User),
            next: 0,
        };
        unsafe { prepare_stack(base, 0x1000) };
        assert!(task.canary_intact());
        // A descending write that runs past the stack's low end hits the
        // canary word first.
        unsafe { *(base as *mut u64) = 0 };
        assert!(!task.canary_intact());
    }
}
