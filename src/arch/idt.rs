//! Interrupt descriptor table.
//!
//! All 256 gates live in one statically-placed table. Exception vectors
//! 0-31 and the sixteen remapped IRQ vectors point at the uniform-frame
//! stubs; gate 0x80 is the system-call entry. The handlers are raw stub
//! addresses rather than `extern "x86-interrupt"` functions because the
//! scheduler needs to swap RSP inside the return path, which the typed
//! handler ABI cannot express.

use super::stubs;
use core::mem::MaybeUninit;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

static mut IDT: MaybeUninit<InterruptDescriptorTable> = MaybeUninit::uninit();

/// Human-readable CPU exception names, indexed by vector.
pub static EXCEPTION_NAMES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

/// Build and load the table.
///
/// # Safety
/// Call once during init, before interrupts are enabled.
pub unsafe fn init() {
    let mut idt = InterruptDescriptorTable::new();

    let addr = |f: unsafe extern "C" fn()| VirtAddr::new(f as usize as u64);

    idt.divide_error.set_handler_addr(addr(stubs::isr0));
    idt.debug.set_handler_addr(addr(stubs::isr1));
    idt.non_maskable_interrupt.set_handler_addr(addr(stubs::isr2));
    idt.breakpoint.set_handler_addr(addr(stubs::isr3));
    idt.overflow.set_handler_addr(addr(stubs::isr4));
    idt.bound_range_exceeded.set_handler_addr(addr(stubs::isr5));
    idt.invalid_opcode.set_handler_addr(addr(stubs::isr6));
    idt.device_not_available.set_handler_addr(addr(stubs::isr7));
    idt.double_fault.set_handler_addr(addr(stubs::isr8));
    // Vector 9 (coprocessor segment overrun) is permanently reserved in
    // long mode; the table keeps its default entry.
    idt.invalid_tss.set_handler_addr(addr(stubs::isr10));
    idt.segment_not_present.set_handler_addr(addr(stubs::isr11));
    idt.stack_segment_fault.set_handler_addr(addr(stubs::isr12));
    idt.general_protection_fault
        .set_handler_addr(addr(stubs::isr13));
    idt.page_fault.set_handler_addr(addr(stubs::isr14));
    idt.x87_floating_point.set_handler_addr(addr(stubs::isr16));
    idt.alignment_check.set_handler_addr(addr(stubs::isr17));
    idt.machine_check.set_handler_addr(addr(stubs::isr18));
    idt.simd_floating_point.set_handler_addr(addr(stubs::isr19));
    idt.virtualization.set_handler_addr(addr(stubs::isr20));
    idt.cp_protection_exception.set_handler_addr(addr(stubs::isr21));
    idt.vmm_communication_exception
        .set_handler_addr(addr(stubs::isr29));
    idt.security_exception.set_handler_addr(addr(stubs::isr30));

    idt[32].set_handler_addr(addr(stubs::irq0));
    idt[33].set_handler_addr(addr(stubs::irq1));
    idt[34].set_handler_addr(addr(stubs::irq2));
    idt[35].set_handler_addr(addr(stubs::irq3));
    idt[36].set_handler_addr(addr(stubs::irq4));
    idt[37].set_handler_addr(addr(stubs::irq5));
    idt[38].set_handler_addr(addr(stubs::irq6));
    idt[39].set_handler_addr(addr(stubs::irq7));
    idt[40].set_handler_addr(addr(stubs::irq8));
    idt[41].set_handler_addr(addr(stubs::irq9));
    idt[42].set_handler_addr(addr(stubs::irq10));
    idt[43].set_handler_addr(addr(stubs::irq11));
    idt[44].set_handler_addr(addr(stubs::irq12));
    idt[45].set_handler_addr(addr(stubs::irq13));
    idt[46].set_handler_addr(addr(stubs::irq14));
    idt[47].set_handler_addr(addr(stubs::irq15));

    idt[0x80].set_handler_addr(addr(stubs::isr_syscall));

    let table = &mut *core::ptr::addr_of_mut!(IDT);
    table.write(idt);
    table.assume_init_ref().load_unsafe();
}
