//! Installable IRQ handlers.
//!
//! Lines 2-15 are claimable by drivers; line 0 (timer) and line 1
//! (keyboard) are wired into the kernel and refuse installation.
//! Installing a handler unmasks its line at the PIC, uninstalling masks
//! it again.

use crate::sync::InterruptSafeLock;

pub const IRQ_LINES: usize = 16;

/// Lines the kernel owns outright.
const TIMER_LINE: u8 = 0;
const KEYBOARD_LINE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Line number outside 0-15.
    InvalidLine,
    /// Line 0 or 1, which the kernel keeps for itself.
    ReservedLine,
}

type IrqHandler = fn();

static HANDLERS: InterruptSafeLock<[Option<IrqHandler>; IRQ_LINES]> =
    InterruptSafeLock::new([None; IRQ_LINES]);

/// Claim an IRQ line. The handler runs in interrupt context: it must not
/// block and must not take locks a task can hold with interrupts on.
pub fn install_irq(line: u8, handler: IrqHandler) -> Result<(), IrqError> {
    if line as usize >= IRQ_LINES {
        return Err(IrqError::InvalidLine);
    }
    if line == TIMER_LINE || line == KEYBOARD_LINE {
        return Err(IrqError::ReservedLine);
    }
    HANDLERS.lock()[line as usize] = Some(handler);
    super::unmask_line(line);
    Ok(())
}

/// Release an IRQ line and mask it at the PIC.
pub fn uninstall_irq(line: u8) -> Result<(), IrqError> {
    if line as usize >= IRQ_LINES {
        return Err(IrqError::InvalidLine);
    }
    if line == TIMER_LINE || line == KEYBOARD_LINE {
        return Err(IrqError::ReservedLine);
    }
    HANDLERS.lock()[line as usize] = None;
    super::mask_line(line);
    Ok(())
}

/// Run the installed handler for `line`, if any. Called from the trap
/// dispatcher for lines 2-15.
pub fn handle(line: u8) {
    if (line as usize) < IRQ_LINES {
        let handler = HANDLERS.lock()[line as usize];
        if let Some(handler) = handler {
            handler();
        }
    }
}
