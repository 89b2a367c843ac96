//! # Core Kernel Module
//!
//! - `interrupts`: segment and interrupt tables, legacy and local controllers, timer
//! - `kernel`: initialization sequence and status tracking
//!
//! ## Initialization Order
//!
//! 1. GDT: five flat segments, no task state segment
//! 2. IDT: 256 gates routed into one dispatcher
//! 3. PIC: remapped to 32-47, periodic PIT tick
//! 4. Local APIC, once multicore bring-up found one

pub mod interrupts;
pub mod kernel;
