//! Message IPC: slab-classed envelopes and per-task bounded queues.
//!
//! Each receiver owns a lazily-created ring of up to 64 envelope
//! pointers. Envelopes are single buddy allocations (header plus inline
//! payload) recycled through per-size-class free lists instead of going
//! back to the heap, so steady-state messaging never pays for
//! coalescing. Senders never block: a full queue drops the message and
//! reports the failure. Delivery to one receiver is FIFO in send order.

use crate::mem::{self, buddy::BuddyHeap};
use crate::sync::InterruptSafeLock;
use crate::MAX_TASKS;

/// Queue depth per receiver.
pub const MSG_QUEUE_SIZE: usize = 64;

/// Payload size classes for the envelope slab.
pub const SLAB_CLASSES: [usize; 5] = [16, 64, 256, 1024, 4096];

/// Largest payload `send` accepts.
pub const MSG_MAX_SIZE: usize = 4096;

// Message type tags.
pub const MSG_TYPE_DATA: u32 = 1;
pub const MSG_TYPE_SIGNAL: u32 = 2;
pub const MSG_TYPE_REQUEST: u32 = 3;
pub const MSG_TYPE_RESPONSE: u32 = 4;
/// Zero-copy buffer handoff; payload is the raw pointer.
pub const MSG_TYPE_POINTER: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Payload exceeds the largest slab class.
    PayloadTooLarge,
    /// Receiver's ring is at capacity; the message was dropped.
    QueueFull,
    /// Envelope or queue allocation failed.
    OutOfMemory,
    /// Broadcast found no receiver that accepted.
    NoReceiver,
    /// Receiver id out of range, or a pointer send aimed at the
    /// broadcast id.
    InvalidReceiver,
    /// Nothing queued (non-blocking receive path).
    Empty,
}

/// Envelope header; the payload follows inline in the same allocation.
#[repr(C)]
pub struct Envelope {
    sender: u32,
    receiver: u32,
    msg_type: u32,
    size: u32,
    slab_class: u32,
    _pad: u32,
    timestamp: u64,
}

const ENVELOPE_HEADER: usize = core::mem::size_of::<Envelope>();

/// Header fields copied out to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageInfo {
    pub sender: u32,
    pub receiver: u32,
    pub msg_type: u32,
    pub size: u32,
    pub timestamp: u64,
}

/// Per-receiver bounded ring of envelope pointers.
#[repr(C)]
struct Queue {
    slots: [*mut Envelope; MSG_QUEUE_SIZE],
    read_pos: u32,
    write_pos: u32,
    count: u32,
}

/// Freed envelopes are relinked through their own storage.
#[repr(C)]
struct SlabBlock {
    next: *mut SlabBlock,
}

/// The whole message broker: queue table plus slab free lists.
pub struct MessageSystem {
    queues: [*mut Queue; MAX_TASKS],
    slab_heads: [*mut SlabBlock; SLAB_CLASSES.len()],
    /// Envelopes fetched from the buddy heap per class (diagnostic).
    slab_refills: [u32; SLAB_CLASSES.len()],
}

unsafe impl Send for MessageSystem {}

/// Smallest class that holds `size` payload bytes.
fn class_for(size: usize) -> Option<usize> {
    SLAB_CLASSES.iter().position(|&c| size <= c)
}

impl MessageSystem {
    pub const fn new() -> Self {
        MessageSystem {
            queues: [core::ptr::null_mut(); MAX_TASKS],
            slab_heads: [core::ptr::null_mut(); SLAB_CLASSES.len()],
            slab_refills: [0; SLAB_CLASSES.len()],
        }
    }

    pub fn init(&mut self) {
        self.queues = [core::ptr::null_mut(); MAX_TASKS];
        self.slab_heads = [core::ptr::null_mut(); SLAB_CLASSES.len()];
        self.slab_refills = [0; SLAB_CLASSES.len()];
    }

    /// Pop an envelope from the class free list, or fetch a fresh one
    /// from the heap.
    fn alloc_envelope(&mut self, heap: &mut BuddyHeap, payload: usize) -> Option<*mut Envelope> {
        let class = class_for(payload)?;
        let total = ENVELOPE_HEADER + SLAB_CLASSES[class];

        let env = if !self.slab_heads[class].is_null() {
            let head = self.slab_heads[class];
            unsafe {
                self.slab_heads[class] = (*head).next;
            }
            head as *mut Envelope
        } else {
            let addr = heap.alloc(total)?;
            self.slab_refills[class] += 1;
            addr as *mut Envelope
        };

        unsafe {
            core::ptr::write_bytes(env as *mut u8, 0, total);
            (*env).slab_class = class as u32;
            (*env).size = payload as u32;
        }
        Some(env)
    }

    /// Return an envelope to its class free list. Deliberately never
    /// released to the buddy heap: slab reuse amortizes coalescing.
    fn free_envelope(&mut self, env: *mut Envelope) {
        if env.is_null() {
            return;
        }
        unsafe {
            let class = (*env).slab_class as usize;
            let block = env as *mut SlabBlock;
            (*block).next = self.slab_heads[class];
            self.slab_heads[class] = block;
        }
    }

    /// The receiver's queue, created on first use.
    fn queue_for(&mut self, heap: &mut BuddyHeap, receiver: u32) -> Option<*mut Queue> {
        let idx = receiver as usize;
        if idx >= MAX_TASKS {
            return None;
        }
        if self.queues[idx].is_null() {
            let addr = heap.alloc(core::mem::size_of::<Queue>())?;
            unsafe {
                core::ptr::write_bytes(addr as *mut u8, 0, core::mem::size_of::<Queue>());
            }
            self.queues[idx] = addr as *mut Queue;
        }
        Some(self.queues[idx])
    }

    /// Copy `data` into a fresh envelope and enqueue it. Receiver 0 is
    /// the broadcast address: the message is re-sent to every task that
    /// already has a queue, excluding the sender and the kernel task
    /// itself; success means at least one receiver accepted.
    pub fn send(
        &mut self,
        heap: &mut BuddyHeap,
        now: u64,
        sender: u32,
        receiver: u32,
        msg_type: u32,
        data: &[u8],
    ) -> Result<(), IpcError> {
        if data.len() > MSG_MAX_SIZE {
            return Err(IpcError::PayloadTooLarge);
        }

        if receiver == 0 {
            let mut delivered = 0;
            for target in 1..MAX_TASKS as u32 {
                if target == sender || self.queues[target as usize].is_null() {
                    continue;
                }
                if self
                    .send_to(heap, now, sender, target, msg_type, data)
                    .is_ok()
                {
                    delivered += 1;
                }
            }
            return if delivered > 0 {
                Ok(())
            } else {
                Err(IpcError::NoReceiver)
            };
        }

        self.send_to(heap, now, sender, receiver, msg_type, data)
    }

    fn send_to(
        &mut self,
        heap: &mut BuddyHeap,
        now: u64,
        sender: u32,
        receiver: u32,
        msg_type: u32,
        data: &[u8],
    ) -> Result<(), IpcError> {
        let queue = self
            .queue_for(heap, receiver)
            .ok_or(IpcError::InvalidReceiver)?;
        unsafe {
            if (*queue).count as usize >= MSG_QUEUE_SIZE {
                return Err(IpcError::QueueFull);
            }
            let env = self
                .alloc_envelope(heap, data.len())
                .ok_or(IpcError::OutOfMemory)?;
            (*env).sender = sender;
            (*env).receiver = receiver;
            (*env).msg_type = msg_type;
            (*env).timestamp = now;
            if !data.is_empty() {
                let payload = (env as usize + ENVELOPE_HEADER) as *mut u8;
                core::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
            }
            self.enqueue(queue, env);
        }
        Ok(())
    }

    /// Zero-copy handoff of a buddy-allocated buffer. Only the pointer
    /// travels; ownership of the buffer transfers to the receiver at
    /// enqueue time, so the sender must not free it once this returns
    /// `Ok`. Broadcast is not allowed here: a buffer cannot be owned by
    /// several receivers.
    pub fn send_pointer(
        &mut self,
        heap: &mut BuddyHeap,
        now: u64,
        sender: u32,
        receiver: u32,
        ptr: usize,
        size: usize,
    ) -> Result<(), IpcError> {
        if receiver == 0 {
            return Err(IpcError::InvalidReceiver);
        }
        let queue = self
            .queue_for(heap, receiver)
            .ok_or(IpcError::InvalidReceiver)?;
        unsafe {
            if (*queue).count as usize >= MSG_QUEUE_SIZE {
                return Err(IpcError::QueueFull);
            }
            let env = self
                .alloc_envelope(heap, core::mem::size_of::<usize>())
                .ok_or(IpcError::OutOfMemory)?;
            (*env).sender = sender;
            (*env).receiver = receiver;
            (*env).msg_type = MSG_TYPE_POINTER;
            (*env).size = size as u32;
            (*env).timestamp = now;
            let payload = (env as usize + ENVELOPE_HEADER) as *mut usize;
            *payload = ptr;
            self.enqueue(queue, env);
        }
        Ok(())
    }

    unsafe fn enqueue(&mut self, queue: *mut Queue, env: *mut Envelope) {
        let write = (*queue).write_pos as usize;
        (*queue).slots[write] = env;
        (*queue).write_pos = ((write + 1) % MSG_QUEUE_SIZE) as u32;
        (*queue).count += 1;
    }

    /// Non-blocking receive: copy the oldest envelope's header and as
    /// much payload as `buf` holds, recycle the envelope, and return the
    /// copied payload length.
    pub fn receive_into(
        &mut self,
        receiver: u32,
        info: &mut MessageInfo,
        buf: &mut [u8],
    ) -> Result<usize, IpcError> {
        let idx = receiver as usize;
        if idx >= MAX_TASKS {
            return Err(IpcError::InvalidReceiver);
        }
        let queue = self.queues[idx];
        if queue.is_null() {
            return Err(IpcError::Empty);
        }
        unsafe {
            if (*queue).count == 0 {
                return Err(IpcError::Empty);
            }
            let read = (*queue).read_pos as usize;
            let env = (*queue).slots[read];
            (*queue).read_pos = ((read + 1) % MSG_QUEUE_SIZE) as u32;
            (*queue).count -= 1;

            *info = MessageInfo {
                sender: (*env).sender,
                receiver: (*env).receiver,
                msg_type: (*env).msg_type,
                size: (*env).size,
                timestamp: (*env).timestamp,
            };
            let declared = (*env).size as usize;
            // A pointer envelope's declared size describes the handed-off
            // buffer, not the inline payload.
            let inline = if (*env).msg_type == MSG_TYPE_POINTER {
                core::mem::size_of::<usize>()
            } else {
                declared
            };
            let n = inline.min(buf.len());
            if n > 0 {
                let payload = (env as usize + ENVELOPE_HEADER) as *const u8;
                core::ptr::copy_nonoverlapping(payload, buf.as_mut_ptr(), n);
            }
            self.free_envelope(env);
            Ok(n)
        }
    }

    pub fn available(&self, receiver: u32) -> bool {
        self.count(receiver) > 0
    }

    pub fn count(&self, receiver: u32) -> u32 {
        let idx = receiver as usize;
        if idx >= MAX_TASKS {
            return 0;
        }
        let queue = self.queues[idx];
        if queue.is_null() {
            return 0;
        }
        unsafe { (*queue).count }
    }

    /// Drain the queue, recycling every envelope.
    pub fn clear(&mut self, receiver: u32) {
        let idx = receiver as usize;
        if idx >= MAX_TASKS {
            return;
        }
        let queue = self.queues[idx];
        if queue.is_null() {
            return;
        }
        unsafe {
            while (*queue).count > 0 {
                let read = (*queue).read_pos as usize;
                let env = (*queue).slots[read];
                (*queue).read_pos = ((read + 1) % MSG_QUEUE_SIZE) as u32;
                (*queue).count -= 1;
                self.free_envelope(env);
            }
        }
    }

    /// Drop a task's queue entirely: drain it, then hand the ring back
    /// to the heap. Used when the task is reaped.
    pub fn release_queue(&mut self, heap: &mut BuddyHeap, receiver: u32) {
        let idx = receiver as usize;
        if idx >= MAX_TASKS {
            return;
        }
        self.clear(receiver);
        let queue = self.queues[idx];
        if !queue.is_null() {
            unsafe { heap.free(queue as usize) };
            self.queues[idx] = core::ptr::null_mut();
        }
    }

    #[cfg(test)]
    fn slab_refills(&self) -> &[u32] {
        &self.slab_refills
    }
}

static SYSTEM: InterruptSafeLock<MessageSystem> = InterruptSafeLock::new(MessageSystem::new());

pub fn init() {
    SYSTEM.lock().init();
}

pub fn send(sender: u32, receiver: u32, msg_type: u32, data: &[u8]) -> Result<(), IpcError> {
    let now = crate::time::ticks();
    let mut system = SYSTEM.lock();
    mem::with_heap(|heap| system.send(heap, now, sender, receiver, msg_type, data))
}

/// See [`MessageSystem::send_pointer`]: the buffer's ownership moves to
/// the receiver on `Ok`; the sender must not `kfree` it afterwards.
pub fn send_pointer(sender: u32, receiver: u32, ptr: usize, size: usize) -> Result<(), IpcError> {
    let now = crate::time::ticks();
    let mut system = SYSTEM.lock();
    mem::with_heap(|heap| system.send_pointer(heap, now, sender, receiver, ptr, size))
}

/// Blocking receive: halts the CPU between polls until a message lands.
pub fn receive(receiver: u32, info: &mut MessageInfo, buf: &mut [u8]) -> Result<usize, IpcError> {
    loop {
        match SYSTEM.lock().receive_into(receiver, info, buf) {
            Err(IpcError::Empty) => crate::arch::halt(),
            other => return other,
        }
    }
}

/// Non-blocking receive for callers that polled `available` first.
pub fn try_receive(receiver: u32, info: &mut MessageInfo, buf: &mut [u8]) -> Result<usize, IpcError> {
    SYSTEM.lock().receive_into(receiver, info, buf)
}

pub fn available(receiver: u32) -> bool {
    SYSTEM.lock().available(receiver)
}

pub fn count(receiver: u32) -> u32 {
    SYSTEM.lock().count(receiver)
}

pub fn clear(receiver: u32) {
    SYSTEM.lock().clear(receiver)
}

pub fn release_queue(receiver: u32) {
    let mut system = SYSTEM.lock();
    mem::with_heap(|heap| system.release_queue(heap, receiver));
}

/// # Safety
/// Panic-path only: the holder of the lock, if any, must never resume.
pub unsafe fn force_unlock() {
    SYSTEM.force_unlock();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> (Vec<u64>, BuddyHeap) {
        let mut buf = vec![0u64; (1 << 20) / 8];
        let mut heap = BuddyHeap::new();
        unsafe { heap.init(buf.as_mut_ptr() as usize, buf.len() * 8) };
        (buf, heap)
    }

    #[test]
    fn class_selection() {
        assert_eq!(class_for(0), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(1024), Some(3));
        assert_eq!(class_for(4096), Some(4));
        assert_eq!(class_for(4097), None);
    }

    #[test]
    fn fifo_order_and_backpressure() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();

        // 64 one-byte messages fit; the 65th is refused.
        for i in 0..64u8 {
            sys.send(&mut h, i as u64, 1, 2, MSG_TYPE_DATA, &[i]).unwrap();
        }
        assert_eq!(
            sys.send(&mut h, 64, 1, 2, MSG_TYPE_DATA, &[64]),
            Err(IpcError::QueueFull)
        );
        assert_eq!(sys.count(2), 64);

        // Drain and observe bytes in send order.
        let mut info = MessageInfo::default();
        let mut buf = [0u8; 16];
        for i in 0..64u8 {
            let n = sys.receive_into(2, &mut info, &mut buf).unwrap();
            assert_eq!(n, 1);
            assert_eq!(buf[0], i);
            assert_eq!(info.sender, 1);
            assert_eq!(info.msg_type, MSG_TYPE_DATA);
            assert_eq!(info.timestamp, i as u64);
        }
        assert_eq!(sys.receive_into(2, &mut info, &mut buf), Err(IpcError::Empty));
        assert_eq!(sys.count(2), 0);
    }

    #[test]
    fn receive_restores_count() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        sys.send(&mut h, 0, 1, 3, MSG_TYPE_DATA, b"ping").unwrap();
        let before = sys.count(3);
        sys.send(&mut h, 0, 1, 3, MSG_TYPE_DATA, b"pong").unwrap();
        let mut info = MessageInfo::default();
        let mut buf = [0u8; 8];
        sys.receive_into(3, &mut info, &mut buf).unwrap();
        assert_eq!(sys.count(3), before);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        let big = vec![0u8; MSG_MAX_SIZE + 1];
        assert_eq!(
            sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &big),
            Err(IpcError::PayloadTooLarge)
        );
        let exact = vec![0xABu8; MSG_MAX_SIZE];
        sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &exact).unwrap();
    }

    #[test]
    fn slab_recycles_envelopes() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        let mut info = MessageInfo::default();
        let mut buf = [0u8; 16];

        for _ in 0..100 {
            sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &[1, 2, 3]).unwrap();
            sys.receive_into(2, &mut info, &mut buf).unwrap();
        }
        // One refill from the heap, then pure reuse.
        assert_eq!(sys.slab_refills()[0], 1);
    }

    #[test]
    fn broadcast_skips_sender_and_kernel() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();

        // Materialize queues for tasks 2, 3 and the sender 4; the
        // kernel task 0 has one too.
        for target in [0u32, 2, 3, 4] {
            sys.queue_for(&mut h, target).unwrap();
        }

        sys.send(&mut h, 0, 4, 0, MSG_TYPE_SIGNAL, b"hi").unwrap();
        assert_eq!(sys.count(2), 1);
        assert_eq!(sys.count(3), 1);
        assert_eq!(sys.count(4), 0, "sender must not hear its own broadcast");
        assert_eq!(sys.count(0), 0, "broadcast never targets the kernel task");
    }

    #[test]
    fn broadcast_with_no_receivers_fails() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        assert_eq!(
            sys.send(&mut h, 0, 1, 0, MSG_TYPE_SIGNAL, b"x"),
            Err(IpcError::NoReceiver)
        );
    }

    #[test]
    fn broadcast_partial_delivery_counts_as_success() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        sys.queue_for(&mut h, 2).unwrap();
        sys.queue_for(&mut h, 3).unwrap();
        // Fill 2's queue so only 3 accepts.
        for _ in 0..MSG_QUEUE_SIZE {
            sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &[0]).unwrap();
        }
        sys.send(&mut h, 0, 1, 0, MSG_TYPE_SIGNAL, b"y").unwrap();
        assert_eq!(sys.count(2), 64);
        assert_eq!(sys.count(3), 1);
    }

    #[test]
    fn pointer_send_carries_the_address() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();

        let buffer = h.alloc(100).unwrap();
        sys.send_pointer(&mut h, 9, 1, 2, buffer, 100).unwrap();

        let mut info = MessageInfo::default();
        let mut out = [0u8; 8];
        let n = sys.receive_into(2, &mut info, &mut out).unwrap();
        assert_eq!(n, 8);
        assert_eq!(info.msg_type, MSG_TYPE_POINTER);
        assert_eq!(info.size, 100);
        assert_eq!(info.timestamp, 9);
        assert_eq!(usize::from_ne_bytes(out), buffer);

        // The receiver now owns the buffer and frees it.
        unsafe { h.free(buffer) };
    }

    #[test]
    fn pointer_broadcast_is_refused() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        assert_eq!(
            sys.send_pointer(&mut h, 1, 0, 0xDEAD, 8, 8),
            Err(IpcError::InvalidReceiver)
        );
    }

    #[test]
    fn clear_drains_everything() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        for _ in 0..10 {
            sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &[7]).unwrap();
        }
        sys.clear(2);
        assert_eq!(sys.count(2), 0);
        // Cleared envelopes are back on the free list: no new refills.
        let refills = sys.slab_refills()[0];
        sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &[8]).unwrap();
        assert_eq!(sys.slab_refills()[0], refills);
    }

    #[test]
    fn release_queue_returns_ring_to_heap() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &[7]).unwrap();
        let used = h.stats().used;
        sys.release_queue(&mut h, 2);
        assert!(h.stats().used < used);
        assert_eq!(sys.count(2), 0);
        // A later send re-creates the queue lazily.
        sys.send(&mut h, 0, 1, 2, MSG_TYPE_DATA, &[7]).unwrap();
        assert_eq!(sys.count(2), 1);
    }

    #[test]
    fn out_of_range_receiver() {
        let (_buf, mut h) = heap();
        let mut sys = MessageSystem::new();
        sys.init();
        assert_eq!(
            sys.send(&mut h, 0, 1, MAX_TASKS as u32, MSG_TYPE_DATA, &[1]),
            Err(IpcError::InvalidReceiver)
        );
        assert!(!sys.available(MAX_TASKS as u32));
    }
}
