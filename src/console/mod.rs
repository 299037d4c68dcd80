//! Text console: VGA writer with a serial mirror.
//!
//! The kernel treats the console as a `ConsoleSink`; the default sink is
//! the VGA text buffer at `0xB8000` mirrored byte-for-byte to COM1 so
//! headless runs still get the log. Everything else in the kernel goes
//! through the `print!`/`println!` macros defined here.

use crate::sync::InterruptSafeLock;
use core::fmt;
use lazy_static::lazy_static;
use uart_16550::SerialPort;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const VGA_BUFFER: usize = 0xB8000;
const COM1: u16 = 0x3F8;

/// The text surface the kernel logs to. The VGA/serial pair below is the
/// only in-tree implementation; the trait is the seam a different display
/// driver would plug into.
pub trait ConsoleSink {
    fn put_string(&mut self, s: &str);
    fn put_char(&mut self, c: char);
    fn set_color(&mut self, fg: Color, bg: Color);
    fn clear(&mut self);
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode((background as u8) << 4 | (foreground as u8))
    }
}

/// VGA text-mode writer with a COM1 mirror.
pub struct Writer {
    column: usize,
    color_code: ColorCode,
    serial: SerialPort,
    serial_ready: bool,
}

impl Writer {
    const fn new() -> Self {
        Writer {
            column: 0,
            color_code: ColorCode::new(Color::White, Color::Black),
            serial: unsafe { SerialPort::new(COM1) },
            serial_ready: false,
        }
    }

    fn init_serial(&mut self) {
        self.serial.init();
        self.serial_ready = true;
    }

    fn write_byte(&mut self, byte: u8) {
        if self.serial_ready {
            self.serial.send(byte);
        }
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = BUFFER_HEIGHT - 1;
                self.put_at(row, self.column, byte);
                self.column += 1;
            }
        }
    }

    fn put_at(&self, row: usize, col: usize, byte: u8) {
        let cell = (self.color_code.0 as u16) << 8 | byte as u16;
        let offset = row * BUFFER_WIDTH + col;
        unsafe {
            let base = VGA_BUFFER as *mut u16;
            core::ptr::write_volatile(base.add(offset), cell);
        }
    }

    fn read_at(&self, row: usize, col: usize) -> u16 {
        let offset = row * BUFFER_WIDTH + col;
        unsafe {
            let base = VGA_BUFFER as *const u16;
            core::ptr::read_volatile(base.add(offset))
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let cell = self.read_at(row, col);
                let offset = (row - 1) * BUFFER_WIDTH + col;
                unsafe {
                    let base = VGA_BUFFER as *mut u16;
                    core::ptr::write_volatile(base.add(offset), cell);
                }
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.column = 0;
    }

    fn clear_row(&self, row: usize) {
        for col in 0..BUFFER_WIDTH {
            self.put_at(row, col, b' ');
        }
    }
}

impl ConsoleSink for Writer {
    fn put_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                // Printable ASCII and newline go through as-is, anything
                // else becomes the VGA block character.
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    fn put_char(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.put_string(c.encode_utf8(&mut buf));
    }

    fn set_color(&mut self, fg: Color, bg: Color) {
        self.color_code = ColorCode::new(fg, bg);
    }

    fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.column = 0;
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.put_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: InterruptSafeLock<Writer> = InterruptSafeLock::new(Writer::new());
}

/// Bring up the serial mirror. Called once, before any logging.
pub fn init() {
    WRITER.lock().init_serial();
}

/// # Safety
/// Panic-path only: the holder of the lock, if any, must never resume.
pub unsafe fn force_unlock() {
    WRITER.force_unlock();
}

pub fn set_color(fg: Color, bg: Color) {
    WRITER.lock().set_color(fg, bg);
}

pub fn clear() {
    WRITER.lock().clear();
}

/// Write raw bytes under a single lock acquisition. The syscall write
/// path uses this so task output cannot interleave mid-buffer.
pub fn write_bytes(bytes: &[u8]) {
    let mut writer = WRITER.lock();
    for &byte in bytes {
        match byte {
            0x20..=0x7e | b'\n' => writer.write_byte(byte),
            _ => writer.write_byte(0xfe),
        }
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // The guard disables interrupts, so a timer IRQ cannot interleave
    // half-written lines.
    WRITER.lock().write_fmt(args).ok();
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Print an `[ OK ]` / `[FAIL]` init-progress line.
pub fn report_init(component: &str, success: bool) {
    print!("  [");
    if success {
        set_color(Color::Green, Color::Black);
        print!(" OK ");
    } else {
        set_color(Color::Red, Color::Black);
        print!("FAIL");
    }
    set_color(Color::White, Color::Black);
    println!("] {}", component);
}
