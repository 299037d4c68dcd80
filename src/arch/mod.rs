//! x86_64 trap layer: IDT, PIC, stubs and the common dispatcher.
//!
//! Vector map: 0-31 CPU exceptions, 32-47 the remapped legacy PIC
//! lines (timer on 32, keyboard on 33), 0x80 the system-call gate.

pub mod idt;
pub mod irq;
pub mod keyboard;
pub mod stubs;

pub use irq::{install_irq, uninstall_irq, IrqError};
pub use stubs::TrapFrame;

use crate::console::{self, Color};
use crate::sync::InterruptSafeLock;
use pic8259::ChainedPics;

/// Remap offsets: master PIC at 32, slave at 40, clear of the exception
/// range.
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The chained 8259 pair. Touched from interrupt handlers for EOI, so it
/// sits behind the interrupt-safe lock.
pub static PICS: InterruptSafeLock<ChainedPics> =
    InterruptSafeLock::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Bring up the trap layer: remap the PICs, load the IDT, unmask the
/// timer and keyboard lines. Interrupts stay disabled until the kernel's
/// init sequence finishes.
///
/// # Safety
/// Call once during init.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    PICS.lock().initialize();
    idt::init();

    // Unmask IRQ 0 (timer), IRQ 1 (keyboard) and the cascade line; all
    // slave lines stay masked until a driver installs a handler.
    PICS.lock().write_masks(0xF8, 0xFF);
}

#[cfg(target_os = "none")]
fn end_of_interrupt(vector: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}

#[cfg(not(target_os = "none"))]
fn end_of_interrupt(_vector: u8) {}

/// Unmask one IRQ line at the PIC pair.
#[cfg(target_os = "none")]
pub(crate) fn unmask_line(line: u8) {
    unsafe {
        let mut pics = PICS.lock();
        let [mut master, mut slave] = pics.read_masks();
        if line < 8 {
            master &= !(1 << line);
        } else {
            slave &= !(1 << (line - 8));
            // The cascade line must be open for any slave IRQ.
            master &= !(1 << 2);
        }
        pics.write_masks(master, slave);
    }
}

/// Mask one IRQ line at the PIC pair.
#[cfg(target_os = "none")]
pub(crate) fn mask_line(line: u8) {
    unsafe {
        let mut pics = PICS.lock();
        let [mut master, mut slave] = pics.read_masks();
        if line < 8 {
            master |= 1 << line;
        } else {
            slave |= 1 << (line - 8);
        }
        pics.write_masks(master, slave);
    }
}

#[cfg(not(target_os = "none"))]
pub(crate) fn unmask_line(_line: u8) {}

#[cfg(not(target_os = "none"))]
pub(crate) fn mask_line(_line: u8) {}

/// The common trap dispatcher. Receives the stack pointer of the saved
/// frame and returns the stack pointer to resume from; the two differ
/// exactly when the scheduler switched tasks.
///
/// The frame reference never outlives this call: exception dumps read it
/// once and the syscall path writes the return value back into it.
pub extern "C" fn trap_dispatch(rsp: u64) -> u64 {
    let frame = unsafe { &mut *(rsp as *mut TrapFrame) };

    match frame.int_no {
        vec @ 0..=31 => handle_exception(frame, vec as usize),
        32 => {
            // Timer tick: advance the clock, acknowledge, then give the
            // scheduler a chance to switch. A software `int 32` (yield)
            // arrives here as well.
            crate::time::tick();
            end_of_interrupt(TIMER_VECTOR);
            crate::sched::scheduler_switch(rsp)
        }
        33 => {
            keyboard::on_interrupt();
            end_of_interrupt(KEYBOARD_VECTOR);
            rsp
        }
        vec @ 34..=47 => {
            let line = (vec - 32) as u8;
            irq::handle(line);
            end_of_interrupt(vec as u8);
            rsp
        }
        0x80 => {
            crate::syscall::dispatch(frame);
            rsp
        }
        _ => rsp,
    }
}

#[cfg(not(target_os = "none"))]
fn read_cr2() -> u64 {
    0
}

#[cfg(target_os = "none")]
fn read_cr2() -> u64 {
    x86_64::registers::control::Cr2::read_raw()
}

/// Dump the faulting CPU state and route to the panic path. Interrupts
/// are masked first so the dump cannot be preempted mid-line.
fn handle_exception(frame: &TrapFrame, vector: usize) -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();

    // The faulting context may have been mid-print; reclaim the console
    // before dumping.
    unsafe { console::force_unlock() };

    console::set_color(Color::White, Color::Red);
    println!("\n\n*** KERNEL EXCEPTION ***");
    println!("Exception: {}", idt::EXCEPTION_NAMES[vector]);
    println!("Error Code: {:#018x}  CR2: {:#018x}", frame.err_code, read_cr2());
    println!(
        "RIP: {:#018x}  CS: {:#06x}  RFLAGS: {:#010x}",
        frame.rip, frame.cs, frame.rflags
    );
    println!("RSP: {:#018x}  SS: {:#06x}", frame.rsp, frame.ss);
    println!();
    println!("Registers:");
    println!(
        "RAX: {:#018x}  RBX: {:#018x}  RCX: {:#018x}",
        frame.rax, frame.rbx, frame.rcx
    );
    println!(
        "RDX: {:#018x}  RSI: {:#018x}  RDI: {:#018x}",
        frame.rdx, frame.rsi, frame.rdi
    );
    println!(
        "RBP: {:#018x}  R8:  {:#018x}  R9:  {:#018x}",
        frame.rbp, frame.r8, frame.r9
    );
    println!(
        "R10: {:#018x}  R11: {:#018x}  R12: {:#018x}",
        frame.r10, frame.r11, frame.r12
    );
    println!(
        "R13: {:#018x}  R14: {:#018x}  R15: {:#018x}",
        frame.r13, frame.r14, frame.r15
    );

    crate::panic::kernel_panic(idt::EXCEPTION_NAMES[vector], file!(), line!() as usize)
}

/// Enable interrupts. The final step of kernel init.
#[cfg(target_os = "none")]
pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

/// Halt until the next interrupt.
#[cfg(target_os = "none")]
#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}

#[cfg(not(target_os = "none"))]
pub fn enable_interrupts() {}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn halt() {
    core::hint::spin_loop();
}
