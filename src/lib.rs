//! Cinder kernel library.
//!
//! Everything the kernel binary runs is defined here so the subsystems
//! stay testable on the host: the core logic (buddy heap, slab/queue
//! layer, capability table, scheduler selection) operates on
//! caller-supplied memory and is exercised by `cargo test`, while the
//! hardware-facing paths only compile into real behavior for bare-metal
//! targets.

#![cfg_attr(not(test), no_std)]

/// Size of the task arena and of every per-task table (capabilities,
/// message queues).
pub const MAX_TASKS: usize = 64;

#[macro_use]
pub mod console;

pub mod arch;
pub mod boot;
pub mod cap;
pub mod ipc;
pub mod mem;
pub mod panic;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod time;

/// The buddy heap backs `alloc` for kernel code. Host builds (and the
/// test harness) keep the platform allocator.
#[cfg(target_os = "none")]
#[global_allocator]
static GLOBAL_ALLOCATOR: mem::heap::KernelHeap = mem::heap::KernelHeap;
