//! Panic path.
//!
//! Invariant violations land here: mask interrupts, print the framed
//! banner, then either halt for good or, with the `soft-recovery`
//! feature, make a single attempt to respawn the registered user-facing
//! task before giving up. Production builds halt; the recovery path is
//! a debugging convenience and never runs twice.

use crate::console::{self, Color};
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "soft-recovery")]
use core::sync::atomic::AtomicBool;

/// Entry point of the task to respawn on soft recovery (the shell, in a
/// full system). Zero until registered.
static RECOVERY_ENTRY: AtomicUsize = AtomicUsize::new(0);

#[cfg(feature = "soft-recovery")]
static RECOVERY_ATTEMPTED: AtomicBool = AtomicBool::new(false);

/// Register the task the kernel should bring back after a panic when
/// soft recovery is enabled.
pub fn set_recovery_task(entry: fn() -> !) {
    RECOVERY_ENTRY.store(entry as usize, Ordering::Relaxed);
}

fn banner(reason: &str, file: &str, line: usize) {
    console::set_color(Color::White, Color::Red);
    println!("\n\n!! KERNEL PANIC !!");
    println!("Reason: {}", reason);
    println!("File:   {}", file);
    println!("Line:   {}", line);
    println!();
    console::set_color(Color::White, Color::Black);
}

/// The kernel's terminal error path.
pub fn kernel_panic(reason: &str, file: &str, line: usize) -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();

    // The panicking context may have died holding the console; break
    // that lock or the banner below never appears.
    unsafe { console::force_unlock() };

    banner(reason, file, line);

    // Hold the banner on screen before anything else happens.
    for _ in 0..10_000_000u32 {
        core::hint::spin_loop();
    }

    #[cfg(feature = "soft-recovery")]
    {
        if !RECOVERY_ATTEMPTED.swap(true, Ordering::SeqCst) {
            let entry = RECOVERY_ENTRY.load(Ordering::Relaxed);
            if entry != 0 {
                console::set_color(Color::LightGreen, Color::Black);
                println!("Attempting soft recovery...");
                console::set_color(Color::White, Color::Black);

                // Whatever the panicking path held will never be
                // released by its owner; break the locks so the respawn
                // can go through.
                unsafe {
                    crate::sched::force_unlock();
                    crate::mem::force_unlock();
                    crate::cap::force_unlock();
                    crate::ipc::force_unlock();
                    crate::console::force_unlock();
                }
                let task: fn() -> ! = unsafe { core::mem::transmute(entry) };
                #[cfg(target_os = "none")]
                x86_64::instructions::interrupts::enable();
                if crate::sched::spawn(
                    task,
                    crate::sched::PRIORITY_HIGH,
                    crate::sched::Uid::Root,
                )
                .is_ok()
                {
                    // Become the idle loop; the respawned task takes
                    // over at the next tick.
                    loop {
                        crate::arch::halt();
                    }
                }
                println!("System Halted (Recovery Failed).");
            }
        }
    }

    halt_forever();
}

/// The irrecoverable halt loop.
pub fn halt_forever() -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
    loop {
        crate::arch::halt();
    }
}
