//! End-to-end scenarios over the public subsystem APIs, run against
//! host-backed arenas: heap lifecycle, IPC FIFO with backpressure,
//! capability inheritance, and the signed-block round trip.

use cinder_kernel::cap::{CapStore, Caps};
use cinder_kernel::ipc::{IpcError, MessageInfo, MessageSystem, MSG_TYPE_DATA};
use cinder_kernel::mem::buddy::{BuddyHeap, HEADER_SIZE};
use cinder_kernel::mem::sblock;
use cinder_kernel::mem::sblock::SblockPerms;
use cinder_kernel::sched::{Scheduler, TaskState, Uid, PRIORITY_HIGH, PRIORITY_NORMAL};

const MIB: usize = 1 << 20;

fn heap_arena() -> (Vec<u64>, BuddyHeap) {
    let mut buf = vec![0u64; MIB / 8];
    let mut heap = BuddyHeap::new();
    unsafe { heap.init(buf.as_mut_ptr() as usize, buf.len() * 8) };
    (buf, heap)
}

#[test]
fn heap_lifecycle() {
    // Init with 1 MiB, allocate three blocks, free in mixed order:
    // the heap must end exactly where it started.
    let (_buf, mut heap) = heap_arena();
    let total = heap.stats().total;
    assert_eq!(total, MIB);

    let a = heap.alloc(100).expect("alloc a");
    let b = heap.alloc(5000).expect("alloc b");
    let c = heap.alloc(100).expect("alloc c");
    let stats = heap.stats();
    assert_eq!(stats.used + stats.free, stats.total);

    unsafe {
        heap.free(a);
        heap.free(c);
        heap.free(b);
    }
    let stats = heap.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.free, total);
    assert!(heap.check_integrity());
}

#[test]
fn heap_boundary_allocations() {
    let (_buf, mut heap) = heap_arena();
    assert!(heap.alloc(MIB - HEADER_SIZE + 1).is_none());
    let p = heap.alloc(MIB - HEADER_SIZE).expect("whole-heap alloc");
    assert_eq!(heap.stats().free, 0);
    unsafe { heap.free(p) };
    assert_eq!(heap.stats().used, 0);
}

#[test]
fn ipc_fifo_and_backpressure() {
    // 64 one-byte messages in, the 65th refused, all 64 drained in
    // send order.
    let (_buf, mut heap) = heap_arena();
    let mut sys = MessageSystem::new();
    sys.init();

    for i in 0..64u8 {
        sys.send(&mut heap, i as u64, 1, 7, MSG_TYPE_DATA, &[i])
            .expect("queue should accept 64 messages");
    }
    assert_eq!(
        sys.send(&mut heap, 64, 1, 7, MSG_TYPE_DATA, &[64]),
        Err(IpcError::QueueFull)
    );

    let mut info = MessageInfo::default();
    let mut byte = [0u8; 1];
    for expected in 0..64u8 {
        let n = sys.receive_into(7, &mut info, &mut byte).expect("drain");
        assert_eq!(n, 1);
        assert_eq!(byte[0], expected);
    }
    assert_eq!(sys.count(7), 0);
}

#[test]
fn capability_inheritance_scenario() {
    // Kernel creates task 1 with MSG_SEND | MSG_RECEIVE; the child
    // inherits everything except grant, revoke and kernel-mode.
    let mut store = CapStore::new();
    store.init();
    store
        .create(1, 0, Caps::MSG_SEND | Caps::MSG_RECEIVE)
        .expect("create task 1");

    assert!(store.check(1, Caps::MSG_SEND));
    assert!(store.check(1, Caps::MSG_RECEIVE));
    assert!(!store.check(1, Caps::KERNEL_MODE));
    assert!(!store.mask(1).contains(Caps::PERM_GRANT));
    assert!(!store.mask(1).contains(Caps::PERM_REVOKE));
}

#[test]
fn grant_revoke_round_trip() {
    let mut store = CapStore::new();
    store.init();
    store.create(1, 0, Caps::MSG_SEND).unwrap();

    let before = store.mask(1);
    store.grant(0, 1, Caps::IRQ_INSTALL | Caps::DEBUG).unwrap();
    store.revoke(0, 1, Caps::IRQ_INSTALL | Caps::DEBUG).unwrap();
    assert_eq!(store.mask(1), before);
}

#[test]
fn signed_block_round_trip_and_tamper() {
    let (_buf, mut heap) = heap_arena();
    let blk = sblock::alloc(&mut heap, 128, Uid::Kernel, SblockPerms::READ)
        .expect("sblock alloc");

    unsafe {
        let data = sblock::access(blk, Uid::Kernel, SblockPerms::WRITE).unwrap();
        for i in 0..128 {
            *data.add(i) = (i * 7) as u8;
        }
    }
    sblock::sign(blk);
    assert!(sblock::verify(blk));

    unsafe {
        let data = sblock::access(blk, Uid::Kernel, SblockPerms::WRITE).unwrap();
        *data.add(77) ^= 0x10;
        assert!(!sblock::verify(blk));
        *data.add(77) ^= 0x10;
    }
    assert!(sblock::verify(blk));
    unsafe { sblock::free(&mut heap, blk) };
}

#[test]
fn scheduler_full_rotation() {
    // Two runnable tasks plus idle: the high-priority one runs first,
    // sleeps, the normal one takes over, and the sleeper comes back at
    // its deadline.
    let (_buf, mut heap) = heap_arena();
    let mut sched = Scheduler::new();
    sched.init(0);

    let high = sched
        .spawn(&mut heap, 0x4000_0000, PRIORITY_HIGH, Uid::Root, 0)
        .unwrap();
    let normal = sched
        .spawn(&mut heap, 0x4000_1000, PRIORITY_NORMAL, Uid::User, 0)
        .unwrap();

    sched.switch_step(0x100, 0, &mut heap, |_| {}).unwrap();
    assert_eq!(sched.current_pid(), high);

    sched.sleep_current(0, 50);
    sched.switch_step(0x200, 0, &mut heap, |_| {}).unwrap();
    assert_eq!(sched.current_pid(), normal);
    assert_eq!(sched.task_info(high).unwrap().0, TaskState::Sleeping);

    // Before the deadline the sleeper stays down.
    sched.switch_step(0x300, 49, &mut heap, |_| {}).unwrap();
    assert_eq!(sched.current_pid(), normal);

    // At the deadline it wakes and outranks the normal task.
    sched.switch_step(0x300, 50, &mut heap, |_| {}).unwrap();
    assert_eq!(sched.current_pid(), high);
    assert_eq!(sched.task_info(high).unwrap().0, TaskState::Running);
}

#[test]
fn terminated_task_slot_is_recycled() {
    let (_buf, mut heap) = heap_arena();
    let mut sched = Scheduler::new();
    sched.init(0);

    let pid = sched
        .spawn(&mut heap, 0x5000_0000, PRIORITY_NORMAL, Uid::User, 0)
        .unwrap();
    sched.switch_step(0x100, 0, &mut heap, |_| {}).unwrap();
    assert_eq!(sched.current_pid(), pid);

    sched.terminate_current();
    sched.switch_step(0x200, 0, &mut heap, |_| {}).unwrap();
    let mut reaped = Vec::new();
    sched.switch_step(0x300, 0, &mut heap, |p| reaped.push(p)).unwrap();
    assert_eq!(reaped, vec![pid]);

    // The freed slot is handed out again.
    let reused = sched
        .spawn(&mut heap, 0x5000_1000, PRIORITY_NORMAL, Uid::User, 0)
        .unwrap();
    assert_eq!(reused, pid);
}
