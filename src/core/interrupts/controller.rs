//! # Interrupt Controller Mode and Dispatch
//!
//! ```text
//! Uninitialized ──▶ TableLoaded ──▶ Legacy ──▶ Controller
//!                         └────────────────────────▲
//! ```
//!
//! `Legacy` acknowledges through the 8259 pair; `Controller` through the
//! calling core's local APIC. The switch to `Controller` only happens when
//! bring-up activated a local APIC, otherwise the kernel stays in `Legacy`.
//!
//! Every entry stub ends up in [`interrupt_dispatch`], which runs the fixed
//! handler for the vector and then issues exactly one acknowledgment.

use core::sync::atomic::{AtomicU8, Ordering};

use x86_64::instructions::port::Port;

use super::apic::{self, LocalInterruptController};
use super::idt::SavedRegisters;
use super::{pic, timer, BREAKPOINT_VECTOR, KEYBOARD_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR};

const KEYBOARD_DATA_PORT: u16 = 0x60;
const PAGE_FAULT_VECTOR: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerMode {
    Uninitialized = 0,
    TableLoaded = 1,
    Legacy = 2,
    Controller = 3,
}

impl ControllerMode {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ControllerMode::TableLoaded,
            2 => ControllerMode::Legacy,
            3 => ControllerMode::Controller,
            _ => ControllerMode::Uninitialized,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_enter(self, next: ControllerMode) -> bool {
        use ControllerMode::*;
        matches!(
            (self, next),
            (Uninitialized, TableLoaded)
                | (TableLoaded, Legacy)
                | (TableLoaded, Controller)
                | (Legacy, Controller)
        )
    }
}

static MODE: AtomicU8 = AtomicU8::new(ControllerMode::Uninitialized as u8);

pub fn mode() -> ControllerMode {
    ControllerMode::from_raw(MODE.load(Ordering::Acquire))
}

fn transition(next: ControllerMode) -> Result<(), &'static str> {
    let current = mode();
    if !current.can_enter(next) {
        return Err("invalid interrupt controller transition");
    }
    MODE.store(next as u8, Ordering::Release);
    log::debug!("interrupts: {:?} -> {:?}", current, next);
    Ok(())
}

/// The boot core loaded the interrupt table.
pub fn mark_table_loaded() -> Result<(), &'static str> {
    transition(ControllerMode::TableLoaded)
}

/// Remap the 8259 pair and start the PIT tick.
pub fn enter_legacy_mode(frequency_hz: u32) -> Result<(), &'static str> {
    transition(ControllerMode::Legacy)?;
    pic::init();
    timer::init(frequency_hz);
    Ok(())
}

/// Hand interrupt delivery to the boot core's local APIC: silence the 8259
/// pair and drive the tick from the local timer instead.
pub fn enter_controller_mode(
    local: &mut apic::LocalApic,
    delay: &mut impl timer::Delay,
    frequency_hz: u32,
) -> Result<(), &'static str> {
    const CALIBRATION_WINDOW_US: u64 = 10_000;

    transition(ControllerMode::Controller)?;
    pic::disable();
    let counts = local.calibrate_timer(delay, CALIBRATION_WINDOW_US);
    let initial = apic::periodic_count(counts, CALIBRATION_WINDOW_US, frequency_hz);
    local.start_periodic_timer(TIMER_VECTOR, initial);
    log::info!(
        "interrupts: local APIC mode, {} timer counts per {} us, reload {}",
        counts,
        CALIBRATION_WINDOW_US,
        initial
    );
    Ok(())
}

/// Who has to be told that `vector` was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgment {
    None,
    Legacy(u8),
    Local,
}

pub fn acknowledgment_for(mode: ControllerMode, vector: u8) -> Acknowledgment {
    if vector < 32 || vector == SPURIOUS_VECTOR {
        return Acknowledgment::None;
    }
    match mode {
        ControllerMode::Legacy if pic::handles(vector) => Acknowledgment::Legacy(vector),
        ControllerMode::Controller => Acknowledgment::Local,
        _ => Acknowledgment::None,
    }
}

/// Signal end of interrupt to whichever controller is active.
pub fn acknowledge(vector: u8) {
    match acknowledgment_for(mode(), vector) {
        Acknowledgment::None => {}
        Acknowledgment::Legacy(vector) => pic::end_of_interrupt(vector),
        Acknowledgment::Local => {
            if let Some(mut local) = apic::active() {
                local.end_of_interrupt();
            }
        }
    }
}

const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point error",
    "virtualization exception",
    "control protection exception",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security exception",
    "reserved",
];

pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES.get(vector as usize).copied().unwrap_or("interrupt")
}

fn fatal_exception(frame: &SavedRegisters) -> ! {
    // The interrupted code may hold the port; nothing runs after this.
    unsafe { crate::SERIAL.force_unlock() };
    log::error!(
        "EXCEPTION: {} (vector {}, error code {:#x}) at {:#x}",
        exception_name(frame.vector as u8),
        frame.vector,
        frame.error_code,
        frame.rip
    );
    if frame.vector as u8 == PAGE_FAULT_VECTOR {
        if let Ok(address) = x86_64::registers::control::Cr2::read() {
            log::error!("faulting address {:#x}", address.as_u64());
        }
    }
    log::error!("{:#x?}", frame);
    crate::halt_loop()
}

pub(crate) extern "C" fn interrupt_dispatch(frame: &mut SavedRegisters) {
    let vector = frame.vector as u8;
    match vector {
        BREAKPOINT_VECTOR => log::warn!("breakpoint at {:#x}", frame.rip),
        0..=31 => fatal_exception(frame),
        TIMER_VECTOR => timer::tick(),
        KEYBOARD_VECTOR => {
            let mut data = Port::<u8>::new(KEYBOARD_DATA_PORT);
            // Safety: reading the PS/2 data port clears the pending byte.
            let scancode = unsafe { data.read() };
            log::trace!("keyboard: scancode {:#04x}", scancode);
        }
        _ => {}
    }
    acknowledge(vector);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_state_machine() {
        use ControllerMode::*;
        assert!(Uninitialized.can_enter(TableLoaded));
        assert!(TableLoaded.can_enter(Legacy));
        assert!(TableLoaded.can_enter(Controller));
        assert!(Legacy.can_enter(Controller));

        assert!(!Uninitialized.can_enter(Legacy));
        assert!(!Controller.can_enter(Legacy));
        assert!(!Legacy.can_enter(TableLoaded));
    }

    #[test]
    fn exceptions_and_spurious_are_never_acknowledged() {
        for mode in [ControllerMode::Legacy, ControllerMode::Controller] {
            assert_eq!(acknowledgment_for(mode, 0), Acknowledgment::None);
            assert_eq!(acknowledgment_for(mode, 14), Acknowledgment::None);
            assert_eq!(acknowledgment_for(mode, SPURIOUS_VECTOR), Acknowledgment::None);
        }
    }

    #[test]
    fn legacy_mode_acknowledges_through_the_pair() {
        assert_eq!(
            acknowledgment_for(ControllerMode::Legacy, TIMER_VECTOR),
            Acknowledgment::Legacy(32)
        );
        assert_eq!(
            acknowledgment_for(ControllerMode::Legacy, 44),
            Acknowledgment::Legacy(44)
        );
        assert_eq!(acknowledgment_for(ControllerMode::Legacy, 100), Acknowledgment::None);
    }

    #[test]
    fn controller_mode_acknowledges_locally() {
        assert_eq!(
            acknowledgment_for(ControllerMode::Controller, TIMER_VECTOR),
            Acknowledgment::Local
        );
        assert_eq!(
            acknowledgment_for(ControllerMode::Controller, KEYBOARD_VECTOR),
            Acknowledgment::Local
        );
    }

    #[test]
    fn nothing_is_acknowledged_before_a_mode_is_chosen() {
        assert_eq!(
            acknowledgment_for(ControllerMode::TableLoaded, TIMER_VECTOR),
            Acknowledgment::None
        );
        assert_eq!(
            acknowledgment_for(ControllerMode::Uninitialized, TIMER_VECTOR),
            Acknowledgment::None
        );
    }

    #[test]
    fn timer_vector_counts_ticks() {
        let before = timer::ticks();
        let mut frame = SavedRegisters {
            vector: TIMER_VECTOR as u64,
            ..SavedRegisters::default()
        };
        interrupt_dispatch(&mut frame);
        assert!(timer::ticks() > before);
    }

    #[test]
    fn exception_names() {
        assert_eq!(exception_name(13), "general protection fault");
        assert_eq!(exception_name(14), "page fault");
        assert_eq!(exception_name(40), "interrupt");
    }
}
