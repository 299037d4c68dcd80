//! Trap and interrupt entry stubs.
//!
//! Every vector funnels through one common naked body so the saved frame
//! layout is identical no matter how we got here. Exceptions without a
//! CPU-pushed error code push a zero placeholder first; every stub then
//! pushes its vector number, and the common body saves the fifteen
//! general-purpose registers plus the data segments, loads kernel
//! selectors, and hands RSP to the dispatcher. The dispatcher returns
//! the RSP to resume from, which is how the scheduler switches tasks
//! inside the interrupt-return path.

use core::arch::naked_asm;

/// The saved CPU state, exactly as the stubs lay it out on the stack.
/// Field order is ascending memory (last push first). Handlers receive
/// an exclusive borrow valid only for the duration of the trap; storing
/// it is never allowed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub err_code: u64,
    // Pushed by the CPU.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Number of 8-byte words a stub stores below the CPU-pushed portion:
/// 4 segment values, 15 GPRs, vector and error code.
pub const FRAME_WORDS: usize = core::mem::size_of::<TrapFrame>() / 8;

/// Kernel code/data selectors from the boot GDT.
pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_DS: u64 = 0x10;

/// RFLAGS for a freshly created task: reserved bit 1 plus IF.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Common save/dispatch/restore body shared by every stub.
///
/// On entry the stack holds `[.., ss, rsp, rflags, cs, rip, err, vec]`.
#[unsafe(naked)]
pub unsafe extern "C" fn trap_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rax, ds",
        "push rax",
        "mov rax, es",
        "push rax",
        "mov rax, fs",
        "push rax",
        "mov rax, gs",
        "push rax",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov rdi, rsp",
        "call {dispatch}",
        // The dispatcher hands back the RSP to resume from; on a context
        // switch this is another task's saved frame.
        "mov rsp, rax",
        "pop rax",
        "mov gs, ax",
        "pop rax",
        "mov fs, ax",
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Drop vector and error code.
        "add rsp, 16",
        "iretq",
        dispatch = sym crate::arch::trap_dispatch,
    )
}

/// Stub for a vector where the CPU pushes no error code: push the zero
/// placeholder so the frame stays uniform.
macro_rules! trap_stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                concat!("push ", stringify!($vec)),
                "jmp {common}",
                common = sym trap_common,
            )
        }
    };
}

/// Stub for a vector where the CPU already pushed an error code.
macro_rules! trap_stub_err {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                concat!("push ", stringify!($vec)),
                "jmp {common}",
                common = sym trap_common,
            )
        }
    };
}

// CPU exceptions 0-31. Vectors 8, 10-14 and 17 carry a CPU-pushed
// error code; the rest get the placeholder. Vector 9 is reserved in
// long mode and gets no stub.
trap_stub!(isr0, 0);
trap_stub!(isr1, 1);
trap_stub!(isr2, 2);
trap_stub!(isr3, 3);
trap_stub!(isr4, 4);
trap_stub!(isr5, 5);
trap_stub!(isr6, 6);
trap_stub!(isr7, 7);
trap_stub_err!(isr8, 8);
trap_stub_err!(isr10, 10);
trap_stub_err!(isr11, 11);
trap_stub_err!(isr12, 12);
trap_stub_err!(isr13, 13);
trap_stub_err!(isr14, 14);
trap_stub!(isr16, 16);
trap_stub_err!(isr17, 17);
trap_stub!(isr18, 18);
trap_stub!(isr19, 19);
trap_stub!(isr20, 20);
trap_stub_err!(isr21, 21);
trap_stub_err!(isr29, 29);
trap_stub_err!(isr30, 30);

// Hardware IRQ lines 0-15 remapped to vectors 32-47.
trap_stub!(irq0, 32);
trap_stub!(irq1, 33);
trap_stub!(irq2, 34);
trap_stub!(irq3, 35);
trap_stub!(irq4, 36);
trap_stub!(irq5, 37);
trap_stub!(irq6, 38);
trap_stub!(irq7, 39);
trap_stub!(irq8, 40);
trap_stub!(irq9, 41);
trap_stub!(irq10, 42);
trap_stub!(irq11, 43);
trap_stub!(irq12, 44);
trap_stub!(irq13, 45);
trap_stub!(irq14, 46);
trap_stub!(irq15, 47);

// Software interrupt gate for system calls.
trap_stub!(isr_syscall, 128);
