//! # Kestrel
//!
//! Hardware bring-up core for x86_64: segment and interrupt tables, the
//! legacy and local interrupt controllers, a page bitmap over physical
//! memory, a bump heap, and start-up of every other core.
//!
//! The binary in `main.rs` drives [`init_kernel`]; everything else lives
//! here so it can be unit tested on the host.

#![cfg_attr(not(test), no_std)]

pub mod boot_info;
pub mod config;
pub mod core;
pub mod logger;
pub mod memory;
pub mod smp;
pub mod sync;

use spin::Mutex;
use uart_16550::SerialPort;

pub use crate::core::kernel::init_kernel;

pub static SERIAL: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(0x3F8) });

#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let mut serial = $crate::SERIAL.lock();
        let _ = writeln!(serial, $($arg)*);
    }};
}

/// Bring up the serial port and the logger. Call before anything else.
pub fn init_early() {
    SERIAL.lock().init();
    logger::init();
}

/// Logical index of the calling core.
pub fn current_core_id() -> usize {
    smp::current_core_id()
}

/// Park the calling core for good.
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
