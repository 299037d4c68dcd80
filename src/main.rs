//! Kernel entry point and init ordering.
//!
//! The loader lands here in long mode with interrupts off and the boot
//! descriptor's address in RDI. Bring-up is strictly bottom-up: console,
//! traps, timing, memory, IPC, capabilities, scheduler; interrupts are
//! the very last switch to flip. After that the boot task becomes the
//! idle loop and everything else happens in interrupt context.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use cinder_kernel::boot::{BootDescriptor, BootInfo};
    use cinder_kernel::console::{self, report_init, Color};
    use cinder_kernel::sched::{self, Uid, PRIORITY_HIGH};
    use cinder_kernel::syscall::sys;
    use cinder_kernel::{arch, cap, ipc, mem, panic as kpanic, print, println, time};

    const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

    fn print_banner() {
        console::set_color(Color::LightCyan, Color::Black);
        println!();
        println!("  ========================================");
        println!("   Cinder Kernel {}", KERNEL_VERSION);
        println!("  ========================================");
        println!();
        console::set_color(Color::White, Color::Black);
    }

    /// A stand-in for the interactive shell: echo keyboard input back
    /// through the syscall surface. Runs as an ordinary task and only
    /// ever talks to the kernel through `int 0x80`.
    fn user_task() -> ! {
        sys::write("cinder> ");
        loop {
            match sys::read_char() {
                Some(byte) => {
                    let buf = [byte];
                    if let Ok(s) = core::str::from_utf8(&buf) {
                        sys::write(s);
                    }
                    if byte == b'\n' {
                        sys::write("cinder> ");
                    }
                }
                None => sys::sleep_ms(10),
            }
        }
    }

    /// The C-level entry point. RDI carries the boot-descriptor address.
    #[no_mangle]
    pub extern "C" fn _start(info: *const BootDescriptor) -> ! {
        console::init();
        print_banner();

        let info = unsafe { BootInfo::from_ptr(info) };
        if info.degraded {
            console::set_color(Color::Red, Color::Black);
            println!("ERROR: Invalid boot info magic, continuing degraded");
            console::set_color(Color::White, Color::Black);
        } else {
            println!(
                "  E820 entries: {}, total memory: {} MB",
                info.e820_count, info.total_memory_mb
            );
        }

        console::set_color(Color::Yellow, Color::Black);
        println!("Initializing kernel subsystems...\n");
        console::set_color(Color::White, Color::Black);

        unsafe { arch::init() };
        report_init("Interrupt Descriptor Table", true);

        unsafe { time::init() };
        let mhz = time::tsc_hz() / 1_000_000;
        report_init("Timer (PIT + TSC)", time::tsc_hz() != 0);
        println!("      TSC: {} MHz", mhz);

        let secure_base = unsafe { mem::init(&info) };
        report_init("Memory Allocator (Buddy)", secure_base.is_some());
        let stats = mem::stats();
        print!("      Heap: {} KB", stats.total / 1024);
        if secure_base.is_some() {
            print!(" | Secure: 64 KB");
        }
        println!();

        ipc::init();
        report_init("IPC Message System", true);

        cap::init();
        report_init("Capability Store", true);
        println!("      Task 0 (kernel): all capabilities");

        sched::init();
        report_init("Priority Scheduler", true);

        report_init("Syscall Gate (INT 0x80)", true);

        let shell = sched::spawn(user_task, PRIORITY_HIGH, Uid::Root);
        match shell {
            Ok(pid) => println!("      Shell task: PID {} at priority HIGH", pid),
            Err(_) => println!("      Shell task failed to start"),
        }
        kpanic::set_recovery_task(user_task);

        console::set_color(Color::Green, Color::Black);
        println!("\n==> Kernel initialization complete\n");
        console::set_color(Color::White, Color::Black);

        arch::enable_interrupts();

        // Task 0 is now the idle task: lowest priority, runs only when
        // nothing else is ready.
        loop {
            arch::halt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        let (file, line) = info
            .location()
            .map(|l| (l.file(), l.line() as usize))
            .unwrap_or(("<unknown>", 0));
        println!("\nrust panic: {}", info.message());
        kpanic::kernel_panic("Rust panic", file, line)
    }
}

// Host builds only exist so `cargo build` and `cargo test` work without
// a bare-metal target; the kernel proper lives behind target_os = "none".
#[cfg(not(target_os = "none"))]
fn main() {}
