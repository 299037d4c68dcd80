//! Timekeeping: PIT-driven ticks and a TSC-derived monotonic clock.
//!
//! At init the CPU timestamp counter is calibrated against PIT channel 2
//! over a gated ~10 ms window, then channel 0 is programmed to 1 kHz to
//! drive preemption. All wall-clock style queries (`now_ns`..`now_s`)
//! come from the TSC relative to a boot reference; the PIT tick counter
//! only feeds the scheduler quantum and diagnostics.

use core::sync::atomic::{AtomicU64, Ordering};

/// PIT input clock, in Hz.
pub const PIT_FREQUENCY: u64 = 1_193_182;

/// Preemption tick rate for channel 0.
pub const TICK_HZ: u64 = 1000;

/// Calibration window on channel 2: 11932 PIT cycles is ~10 ms, i.e.
/// 1/100 of a second.
#[cfg(target_os = "none")]
const CALIBRATION_COUNT: u16 = 11932;
#[cfg(target_os = "none")]
const CALIBRATION_PERIODS_PER_SEC: u64 = 100;

/// Upper bound on the calibration wait. If the speaker gate never
/// flips (broken emulation), calibration reports zero instead of
/// hanging the boot.
#[cfg(target_os = "none")]
const CALIBRATION_SPIN_LIMIT: u32 = 50_000_000;

static PIT_TICKS: AtomicU64 = AtomicU64::new(0);
static TSC_HZ: AtomicU64 = AtomicU64::new(0);
static TSC_KHZ: AtomicU64 = AtomicU64::new(0);
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

#[inline]
fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}

/// Calibrate the TSC and start the 1 kHz preemption timer.
///
/// # Safety
/// Programs the PIT and speaker-gate ports; call once during init with
/// interrupts still disabled.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    use x86_64::instructions::port::Port;

    let mut port_43: Port<u8> = Port::new(0x43);
    let mut port_42: Port<u8> = Port::new(0x42);
    let mut port_40: Port<u8> = Port::new(0x40);
    let mut port_61: Port<u8> = Port::new(0x61);

    // Let the bus settle before sampling.
    for _ in 0..10_000 {
        core::hint::spin_loop();
    }

    let tsc_start = rdtsc();

    // Channel 2, lobyte/hibyte, mode 0, binary; gate it through the
    // speaker-control port with the speaker output itself kept off.
    let gate = port_61.read();
    port_61.write((gate & 0xFD) | 0x01);
    port_43.write(0xB0u8);
    port_42.write((CALIBRATION_COUNT & 0xFF) as u8);
    port_42.write((CALIBRATION_COUNT >> 8) as u8);

    let mut spins: u32 = 0;
    let mut timed_out = false;
    while port_61.read() & 0x20 == 0 {
        spins += 1;
        if spins >= CALIBRATION_SPIN_LIMIT {
            timed_out = true;
            break;
        }
        core::hint::spin_loop();
    }

    let tsc_end = rdtsc();
    port_61.write(port_61.read() & 0xFC);

    if !timed_out {
        let hz = (tsc_end - tsc_start) * CALIBRATION_PERIODS_PER_SEC;
        TSC_HZ.store(hz, Ordering::Relaxed);
        TSC_KHZ.store(hz / 1000, Ordering::Relaxed);
    }
    BOOT_TSC.store(rdtsc(), Ordering::Relaxed);

    // Channel 0, lobyte/hibyte, mode 3 (square wave), binary: the
    // preemption heartbeat on IRQ 0.
    let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;
    port_43.write(0x36u8);
    port_40.write((divisor & 0xFF) as u8);
    port_40.write((divisor >> 8) as u8);
}

/// Record one PIT tick. Called from the IRQ 0 path only.
pub fn tick() {
    PIT_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// PIT ticks since boot (1 per ms at the configured rate).
pub fn ticks() -> u64 {
    PIT_TICKS.load(Ordering::Relaxed)
}

/// Calibrated TSC frequency in Hz; zero when calibration failed.
pub fn tsc_hz() -> u64 {
    TSC_HZ.load(Ordering::Relaxed)
}

/// Convert a TSC delta to nanoseconds given a kHz frequency.
/// Zero frequency means "unknown clock": everything reads as zero.
#[inline]
fn tsc_to_ns(delta: u64, khz: u64) -> u64 {
    if khz == 0 {
        return 0;
    }
    delta.wrapping_mul(1_000_000) / khz
}

#[inline]
fn tsc_to_us(delta: u64, khz: u64) -> u64 {
    if khz == 0 {
        return 0;
    }
    delta.wrapping_mul(1000) / khz
}

#[inline]
fn tsc_to_ms(delta: u64, khz: u64) -> u64 {
    if khz == 0 {
        return 0;
    }
    delta / khz
}

fn elapsed_tsc() -> u64 {
    rdtsc().wrapping_sub(BOOT_TSC.load(Ordering::Relaxed))
}

/// Monotonic nanoseconds since boot (zero if calibration failed).
pub fn now_ns() -> u64 {
    tsc_to_ns(elapsed_tsc(), TSC_KHZ.load(Ordering::Relaxed))
}

pub fn now_us() -> u64 {
    tsc_to_us(elapsed_tsc(), TSC_KHZ.load(Ordering::Relaxed))
}

pub fn now_ms() -> u64 {
    tsc_to_ms(elapsed_tsc(), TSC_KHZ.load(Ordering::Relaxed))
}

pub fn now_s() -> u64 {
    now_ms() / 1000
}

/// Busy-wait for `ns` nanoseconds. Returns immediately when the clock is
/// uncalibrated. For sub-millisecond device pacing only; tasks that can
/// sleep should call the scheduler's `sleep` instead.
pub fn delay_ns(ns: u64) {
    let khz = TSC_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return;
    }
    let target = rdtsc().wrapping_add(ns.wrapping_mul(khz) / 1_000_000);
    while rdtsc() < target {
        core::hint::spin_loop();
    }
}

pub fn delay_us(us: u64) {
    let khz = TSC_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return;
    }
    let target = rdtsc().wrapping_add(us.wrapping_mul(khz) / 1000);
    while rdtsc() < target {
        core::hint::spin_loop();
    }
}

pub fn delay_ms(ms: u64) {
    let khz = TSC_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return;
    }
    let target = rdtsc().wrapping_add(ms.wrapping_mul(khz));
    while rdtsc() < target {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_at_known_frequency() {
        // 3 GHz CPU: 3_000_000 cycles per ms.
        let khz = 3_000_000;
        assert_eq!(tsc_to_ms(3_000_000, khz), 1);
        assert_eq!(tsc_to_us(3_000, khz), 1);
        assert_eq!(tsc_to_ns(3, khz), 1);
        assert_eq!(tsc_to_ms(9_000_000_000, khz), 3000);
    }

    #[test]
    fn zero_frequency_reads_zero() {
        assert_eq!(tsc_to_ns(123_456, 0), 0);
        assert_eq!(tsc_to_us(123_456, 0), 0);
        assert_eq!(tsc_to_ms(123_456, 0), 0);
    }

    #[test]
    fn tick_counter_accumulates() {
        let before = ticks();
        tick();
        tick();
        assert_eq!(ticks(), before + 2);
    }
}
