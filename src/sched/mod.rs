//! Preemptive priority scheduler.
//!
//! One circular list of tasks in a pid-indexed arena, dispatched from
//! the timer interrupt. Selection is strict priority (lower value wins,
//! traversal order breaks ties) with per-tier millisecond quanta; the
//! running task keeps the CPU while it has quantum left and no
//! higher-priority task is ready. Sleeping tasks are woken in the same
//! sweep that picks the winner, and terminated tasks are reaped the
//! next time the sweep passes them.

pub mod task;

pub use task::{Task, TaskState, Uid};
pub use task::{
    PRIORITY_HIGH, PRIORITY_IDLE, PRIORITY_LOW, PRIORITY_NORMAL, PRIORITY_REALTIME,
    PRIORITY_SYSTEM,
};

use crate::cap;
use crate::mem::{self, buddy::BuddyHeap};
use crate::sync::InterruptSafeLock;
use crate::MAX_TASKS;
use task::{default_perm_mask, prepare_stack, quantum_for, TASK_STACK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Zero entry point.
    NullEntry,
    /// Arena is full.
    NoFreeSlot,
    /// Stack allocation failed.
    OutOfMemory,
    /// Pid does not name a live task.
    NoSuchTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchError {
    /// The canary at the named task's stack base was clobbered.
    StackCorruption(u32),
}

/// The task arena plus the current-task cursor. Pid 0 is the idle task,
/// created at init; it anchors the circular list and never terminates.
pub struct Scheduler {
    slots: [Option<Task>; MAX_TASKS],
    current: u32,
    started: bool,
}

const NONE_TASK: Option<Task> = None;

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            slots: [NONE_TASK; MAX_TASKS],
            current: 0,
            started: false,
        }
    }

    /// Install the idle task in slot 0 and make it current. The idle
    /// task runs on the boot stack, so it owns no stack allocation and
    /// skips the canary check.
    pub fn init(&mut self, now: u64) {
        self.slots = [NONE_TASK; MAX_TASKS];
        self.slots[0] = Some(Task {
            pid: 0,
            state: TaskState::Running,
            rsp: 0,
            uid: Uid::Kernel,
            priority: PRIORITY_IDLE,
            quantum: quantum_for(PRIORITY_IDLE),
            base_quantum: quantum_for(PRIORITY_IDLE),
            sleep_deadline: 0,
            cpu_time: 0,
            start_time: now,
            stack_base: 0,
            perm_mask: default_perm_mask(Uid::Kernel),
            next: 0,
        });
        self.current = 0;
        self.started = true;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn current_pid(&self) -> u32 {
        self.current
    }

    /// Create a task: allocate and prepare its stack, then append it to
    /// the circular list. Returns the new pid.
    pub fn spawn(
        &mut self,
        heap: &mut BuddyHeap,
        entry: u64,
        priority: u8,
        uid: Uid,
        now: u64,
    ) -> Result<u32, SchedError> {
        if entry == 0 {
            return Err(SchedError::NullEntry);
        }
        let pid = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(SchedError::NoFreeSlot)? as u32;

        let stack_base = heap.alloc(TASK_STACK_SIZE).ok_or(SchedError::OutOfMemory)?;
        let rsp = unsafe { prepare_stack(stack_base, entry) };

        let quantum = quantum_for(priority);
        let task = Task {
            pid,
            state: TaskState::Ready,
            rsp,
            uid,
            priority,
            quantum,
            base_quantum: quantum,
            sleep_deadline: 0,
            cpu_time: 0,
            start_time: now,
            stack_base,
            perm_mask: default_perm_mask(uid),
            next: 0,
        };

        // Append at the tail: the slot whose next wraps to the idle task.
        let mut tail = 0usize;
        while let Some(t) = &self.slots[tail] {
            if t.next == 0 {
                break;
            }
            tail = t.next as usize;
        }
        if let Some(t) = &mut self.slots[tail] {
            t.next = pid;
        }
        self.slots[pid as usize] = Some(task);
        Ok(pid)
    }

    /// The dispatch step, called with the interrupted task's saved stack
    /// pointer. Returns the stack pointer to resume from.
    ///
    /// One pass over the circular list does all the bookkeeping: wake
    /// expired sleepers, pick the best Ready/Running task, and note
    /// terminated tasks for reaping. `on_reap` fires once per reclaimed
    /// pid so the caller can drop capability records and queues.
    pub fn switch_step(
        &mut self,
        rsp: u64,
        now: u64,
        heap: &mut BuddyHeap,
        mut on_reap: impl FnMut(u32),
    ) -> Result<u64, SwitchError> {
        if !self.started {
            return Ok(rsp);
        }
        let cur = self.current as usize;

        let start = {
            let task = match self.slots[cur].as_mut() {
                Some(t) => t,
                None => return Ok(rsp),
            };
            task.rsp = rsp;
            task.cpu_time += 1;
            if !task.canary_intact() {
                return Err(SwitchError::StackCorruption(task.pid));
            }
            if task.quantum > 0 {
                task.quantum -= 1;
            }
            task.next
        };

        // Single sweep: wake, select, collect the dead.
        let mut best: Option<(u32, u8)> = None;
        let mut dead = [0u32; MAX_TASKS];
        let mut dead_count = 0;
        let mut t = start;
        loop {
            let task = self.slots[t as usize]
                .as_mut()
                .expect("circular list references an empty slot");

            if task.state == TaskState::Sleeping && now >= task.sleep_deadline {
                task.state = TaskState::Ready;
                task.quantum = task.base_quantum;
            }

            if matches!(task.state, TaskState::Ready | TaskState::Running) {
                let better = match best {
                    None => true,
                    Some((_, bp)) => task.priority < bp,
                };
                if better {
                    best = Some((t, task.priority));
                }
            }

            if task.state == TaskState::Terminated && t != self.current && t != 0 {
                dead[dead_count] = t;
                dead_count += 1;
            }

            let next = task.next;
            t = next;
            if t == start {
                break;
            }
        }

        // Keep the current task while it is running, has quantum left,
        // and no strictly better candidate exists.
        let keep = {
            let task = self.slots[cur].as_ref().expect("current task vanished");
            task.state == TaskState::Running
                && task.quantum > 0
                && best.map_or(true, |(_, bp)| task.priority <= bp)
        };

        if !keep {
            let winner = best.map(|(pid, _)| pid).unwrap_or(self.current);
            if winner != self.current {
                if let Some(task) = self.slots[cur].as_mut() {
                    if task.state == TaskState::Running {
                        task.state = TaskState::Ready;
                    }
                }
            }
            self.current = winner;
            let task = self.slots[winner as usize]
                .as_mut()
                .expect("winner vanished");
            task.state = TaskState::Running;
            task.quantum = task.base_quantum;
        }

        for &pid in &dead[..dead_count] {
            self.reap(pid, heap);
            on_reap(pid);
        }

        let task = self.slots[self.current as usize]
            .as_ref()
            .expect("current task vanished");
        Ok(task.rsp)
    }

    /// Unlink a terminated task and return its stack to the heap.
    fn reap(&mut self, pid: u32, heap: &mut BuddyHeap) {
        // Find the predecessor on the ring.
        let mut prev = 0usize;
        loop {
            let next = match &self.slots[prev] {
                Some(t) => t.next,
                None => return,
            };
            if next == pid {
                break;
            }
            prev = next as usize;
            if prev == 0 {
                return; // not on the ring
            }
        }
        let successor = match &self.slots[pid as usize] {
            Some(t) => t.next,
            None => return,
        };
        if let Some(t) = &mut self.slots[prev] {
            t.next = successor;
        }
        if let Some(task) = self.slots[pid as usize].take() {
            if task.stack_base != 0 {
                unsafe { heap.free(task.stack_base) };
            }
        }
    }

    /// Put the current task to sleep until `now + ms`. The caller must
    /// yield afterwards.
    pub fn sleep_current(&mut self, now: u64, ms: u64) {
        let cur = self.current as usize;
        if let Some(task) = self.slots[cur].as_mut() {
            task.state = TaskState::Sleeping;
            task.sleep_deadline = now.saturating_add(ms);
        }
    }

    /// Mark the current task terminated. It keeps running until the next
    /// dispatch, and its slot is reclaimed on the pass after that.
    pub fn terminate_current(&mut self) {
        let cur = self.current as usize;
        if cur != 0 {
            if let Some(task) = self.slots[cur].as_mut() {
                task.state = TaskState::Terminated;
            }
        }
    }

    pub fn task_info(&self, pid: u32) -> Option<(TaskState, u8)> {
        self.slots
            .get(pid as usize)?
            .as_ref()
            .map(|t| (t.state, t.priority))
    }

    pub fn task_uid(&self, pid: u32) -> Option<Uid> {
        self.slots.get(pid as usize)?.as_ref().map(|t| t.uid)
    }

    pub fn cpu_time(&self, pid: u32) -> Option<u64> {
        self.slots.get(pid as usize)?.as_ref().map(|t| t.cpu_time)
    }

    /// Change a task's priority; the quantum budget follows the new
    /// tier on the next dispatch.
    pub fn set_priority(&mut self, pid: u32, priority: u8) -> Result<(), SchedError> {
        let task = self
            .slots
            .get_mut(pid as usize)
            .and_then(|s| s.as_mut())
            .ok_or(SchedError::NoSuchTask)?;
        task.priority = priority;
        task.base_quantum = quantum_for(priority);
        Ok(())
    }

    pub fn set_uid(&mut self, pid: u32, uid: Uid) -> Result<(), SchedError> {
        let task = self
            .slots
            .get_mut(pid as usize)
            .and_then(|s| s.as_mut())
            .ok_or(SchedError::NoSuchTask)?;
        task.uid = uid;
        Ok(())
    }

    #[cfg(test)]
    fn task(&self, pid: u32) -> Option<&Task> {
        self.slots.get(pid as usize)?.as_ref()
    }
}

static SCHEDULER: InterruptSafeLock<Scheduler> = InterruptSafeLock::new(Scheduler::new());

/// Install the idle task. Called once, after the heap is up.
pub fn init() {
    SCHEDULER.lock().init(crate::time::now_ms());
}

/// Create a task and seed its capability record from the creating
/// task's slot. The half-built task is torn down if any step fails.
pub fn spawn(entry: fn() -> !, priority: u8, uid: Uid) -> Result<u32, SchedError> {
    let now = crate::time::now_ms();
    let (pid, parent) = {
        let mut sched = SCHEDULER.lock();
        let parent = sched.current_pid();
        let pid = mem::with_heap(|heap| {
            sched.spawn(heap, entry as usize as u64, priority, uid, now)
        })?;
        (pid, parent)
    };
    // Capability slot may be stale if a previous task with this pid
    // leaked it; destroy-then-create keeps the table in step.
    let _ = cap::destroy(pid);
    let _ = cap::create(pid, parent, default_perm_mask(uid));
    Ok(pid)
}

/// The timer-IRQ dispatch hook. Takes the saved stack pointer, returns
/// the one to resume from. The `try_lock` is the re-entrance lock: a
/// nested tick returns the frame unchanged.
pub fn scheduler_switch(rsp: u64) -> u64 {
    let mut reaped = [0u32; MAX_TASKS];
    let mut reap_count = 0;

    let new_rsp = {
        let mut sched = match SCHEDULER.try_lock() {
            Some(guard) => guard,
            None => return rsp,
        };
        let now = crate::time::now_ms();
        let result = mem::with_heap(|heap| {
            sched.switch_step(rsp, now, heap, |pid| {
                reaped[reap_count] = pid;
                reap_count += 1;
            })
        });
        match result {
            Ok(new_rsp) => new_rsp,
            Err(SwitchError::StackCorruption(_)) => {
                drop(sched);
                crate::panic::kernel_panic("Stack overflow!", file!(), line!() as usize);
            }
        }
    };

    for &pid in &reaped[..reap_count] {
        let _ = cap::destroy(pid);
        crate::ipc::release_queue(pid);
    }

    new_rsp
}

/// Give up the CPU immediately by raising the scheduler's vector.
#[cfg(target_os = "none")]
pub fn yield_now() {
    unsafe {
        core::arch::asm!("int 0x20", options(nomem, nostack));
    }
}

#[cfg(not(target_os = "none"))]
pub fn yield_now() {}

/// Sleep for at least `ms` milliseconds of TSC-derived time.
pub fn sleep(ms: u64) {
    {
        let mut sched = SCHEDULER.lock();
        let now = crate::time::now_ms();
        sched.sleep_current(now, ms);
    }
    yield_now();
}

/// Terminate the calling task. Never returns; the slot is reclaimed by
/// a later dispatch pass.
pub fn exit_task() -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
    SCHEDULER.lock().terminate_current();
    yield_now();
    loop {
        crate::arch::halt();
    }
}

/// # Safety
/// Panic-path only: the holder of the lock, if any, must never resume.
pub unsafe fn force_unlock() {
    SCHEDULER.force_unlock();
}

pub fn current_pid() -> u32 {
    SCHEDULER.lock().current_pid()
}

pub fn task_info(pid: u32) -> Option<(TaskState, u8)> {
    SCHEDULER.lock().task_info(pid)
}

pub fn set_priority(pid: u32, priority: u8) -> Result<(), SchedError> {
    SCHEDULER.lock().set_priority(pid, priority)
}
