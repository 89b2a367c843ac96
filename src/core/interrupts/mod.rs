//! # Interrupt Handling Module
//!
//! - **GDT**: the five flat segments every core loads
//! - **IDT**: 256 gates, entry stubs and the saved register frame
//! - **PIC**: 8259 pair remapped to vectors 32-47
//! - **APIC**: per-core local controller
//! - **Controller**: legacy/local mode and the unified acknowledgment
//! - **Timer**: PIT tick and the monotonic delay
//!
//! ## Interrupt Vector Layout
//!
//! | Vector | Type                   | Handler                         |
//! |--------|------------------------|---------------------------------|
//! | 0-31   | CPU exceptions         | fatal, except breakpoint        |
//! | 32     | Timer                  | tick counter                    |
//! | 33     | Keyboard (IRQ1)        | drain scancode                  |
//! | 34-47  | Remaining legacy lines | acknowledged only               |
//! | 0xFF   | APIC spurious          | ignored, never acknowledged     |

pub mod apic;
pub mod controller;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod timer;

pub const BREAKPOINT_VECTOR: u8 = 3;
pub const TIMER_VECTOR: u8 = pic::PIC_1_OFFSET;
pub const KEYBOARD_VECTOR: u8 = pic::PIC_1_OFFSET + 1;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Load the shared interrupt table on the boot core.
pub fn init_idt() -> Result<(), &'static str> {
    idt::init();
    controller::mark_table_loaded()
}

/// Load the shared tables on a core that is already running.
pub fn init_secondary() {
    gdt::init();
    idt::init();
}
