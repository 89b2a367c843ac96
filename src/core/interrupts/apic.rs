//! # Local APIC
//!
//! Each core owns one local controller, reached through the same physical
//! register page on every core. The page address comes from MSR 0x1B.
//!
//! Only what bring-up and the unified acknowledgment need is programmed:
//! enable and priority, identifier, end of interrupt, INIT and STARTUP
//! inter-processor interrupts, and the local timer.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::registers::model_specific::Msr;
use x86_64::{PhysAddr, VirtAddr};

use super::timer::Delay;
use super::SPURIOUS_VECTOR;

pub const APIC_BASE_MSR: u32 = 0x1B;
const APIC_BASE_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

const CPUID_FEATURE_APIC: u32 = 1 << 9;

const REG_ID: usize = 0x020;
const REG_VERSION: usize = 0x030;
const REG_TPR: usize = 0x080;
const REG_EOI: usize = 0x0B0;
const REG_SPURIOUS: usize = 0x0F0;
const REG_ESR: usize = 0x280;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_CURRENT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

const SPURIOUS_ENABLE: u32 = 1 << 8;
const LVT_MASKED: u32 = 1 << 16;
const TIMER_PERIODIC: u32 = 1 << 17;
const TIMER_DIVIDE_16: u32 = 0x3;

const ICR_DELIVERY_STATUS: u32 = 1 << 12;
/// INIT, level assert.
pub const ICR_INIT: u32 = 0x4500;
/// STARTUP, level assert; the low byte carries the start page.
pub const ICR_STARTUP: u32 = 0x4600;

/// Per-core interrupt controller as seen by bring-up and the dispatcher.
pub trait LocalInterruptController {
    /// Hardware identifier of the calling core.
    fn id(&self) -> u8;

    /// Software-enable the controller and accept every priority.
    fn enable(&mut self);

    fn end_of_interrupt(&mut self);

    fn send_init(&mut self, target: u8);

    /// STARTUP signal; the target begins executing at `page * 4096` in real mode.
    fn send_startup(&mut self, target: u8, page: u8);
}

/// CPUID leaf 1, EDX bit 9.
pub fn is_supported() -> bool {
    #[allow(unused_unsafe)]
    let features = unsafe { core::arch::x86_64::__cpuid(1) };
    features.edx & CPUID_FEATURE_APIC != 0
}

/// Physical address of the register page, with the global enable bit forced on.
pub fn base_address() -> PhysAddr {
    let mut msr = Msr::new(APIC_BASE_MSR);
    // Safety: the MSR exists whenever CPUID reports the feature.
    unsafe {
        let value = msr.read();
        if value & APIC_GLOBAL_ENABLE == 0 {
            msr.write(value | APIC_GLOBAL_ENABLE);
        }
        PhysAddr::new(value & APIC_BASE_MASK)
    }
}

/// Virtual address of the register page once bring-up has activated it.
static ACTIVE_BASE: AtomicU64 = AtomicU64::new(0);

pub fn activate(base: VirtAddr) {
    ACTIVE_BASE.store(base.as_u64(), Ordering::Release);
}

/// The calling core's controller, if one was activated.
pub fn active() -> Option<LocalApic> {
    match ACTIVE_BASE.load(Ordering::Acquire) {
        0 => None,
        // Safety: only a mapped register page is ever published.
        base => Some(unsafe { LocalApic::new(VirtAddr::new(base)) }),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LocalApic {
    base: *mut u32,
}

// Safety: every core reaches its own controller through the same page.
unsafe impl Send for LocalApic {}

impl LocalApic {
    /// # Safety
    /// `base` must map the local APIC register page, uncached.
    pub unsafe fn new(base: VirtAddr) -> Self {
        Self {
            base: base.as_mut_ptr(),
        }
    }

    fn read(&self, register: usize) -> u32 {
        // Safety: `register` is a valid offset inside the register page.
        unsafe { ptr::read_volatile(self.base.add(register / 4)) }
    }

    fn write(&mut self, register: usize, value: u32) {
        // Safety: as for `read`.
        unsafe { ptr::write_volatile(self.base.add(register / 4), value) }
    }

    /// Version in bits 0-7, highest LVT entry in bits 16-23.
    pub fn version(&self) -> u32 {
        self.read(REG_VERSION)
    }

    pub fn error_status(&mut self) -> u32 {
        // writing first latches the current errors
        self.write(REG_ESR, 0);
        self.read(REG_ESR)
    }

    fn wait_for_delivery(&self) {
        while self.read(REG_ICR_LOW) & ICR_DELIVERY_STATUS != 0 {
            core::hint::spin_loop();
        }
    }

    pub fn send_ipi(&mut self, target: u8, command: u32) {
        self.wait_for_delivery();
        self.write(REG_ICR_HIGH, u32::from(target) << 24);
        self.write(REG_ICR_LOW, command);
    }

    /// Periodic timer on `vector`, reloading from `initial_count` with a
    /// divide-by-16 input clock.
    pub fn start_periodic_timer(&mut self, vector: u8, initial_count: u32) {
        self.write(REG_TIMER_DIVIDE, TIMER_DIVIDE_16);
        self.write(REG_LVT_TIMER, TIMER_PERIODIC | u32::from(vector));
        self.write(REG_TIMER_INITIAL, initial_count);
    }

    pub fn stop_timer(&mut self) {
        self.write(REG_LVT_TIMER, LVT_MASKED);
        self.write(REG_TIMER_INITIAL, 0);
    }

    /// Timer counts elapsed during `window_us`, measured with the timer masked.
    pub fn calibrate_timer(&mut self, delay: &mut impl Delay, window_us: u64) -> u32 {
        self.write(REG_TIMER_DIVIDE, TIMER_DIVIDE_16);
        self.write(REG_LVT_TIMER, LVT_MASKED);
        self.write(REG_TIMER_INITIAL, u32::MAX);
        delay.delay_us(window_us);
        let remaining = self.read(REG_TIMER_CURRENT);
        self.stop_timer();
        u32::MAX - remaining
    }
}

impl LocalInterruptController for LocalApic {
    fn id(&self) -> u8 {
        (self.read(REG_ID) >> 24) as u8
    }

    fn enable(&mut self) {
        self.write(REG_SPURIOUS, SPURIOUS_ENABLE | u32::from(SPURIOUS_VECTOR));
        self.write(REG_TPR, 0);
    }

    fn end_of_interrupt(&mut self) {
        self.write(REG_EOI, 0);
    }

    fn send_init(&mut self, target: u8) {
        self.send_ipi(target, ICR_INIT);
    }

    fn send_startup(&mut self, target: u8, page: u8) {
        self.send_ipi(target, ICR_STARTUP | u32::from(page));
    }
}

/// Initial count for a periodic timer at `frequency_hz`, given the counts
/// observed over a `window_us` calibration window.
pub fn periodic_count(counts_per_window: u32, window_us: u64, frequency_hz: u32) -> u32 {
    let per_second = u64::from(counts_per_window) * 1_000_000 / window_us.max(1);
    let count = per_second / u64::from(frequency_hz.max(1));
    count.clamp(1, u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host memory standing in for the register page.
    #[repr(C, align(4096))]
    struct RegisterPage([u32; 1024]);

    struct Fixture {
        page: Box<RegisterPage>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                page: Box::new(RegisterPage([0; 1024])),
            }
        }

        fn base(&mut self) -> *mut u32 {
            self.page.0.as_mut_ptr()
        }

        fn apic(&mut self) -> LocalApic {
            unsafe { LocalApic::new(VirtAddr::from_ptr(self.base())) }
        }

        fn get(&mut self, register: usize) -> u32 {
            unsafe { ptr::read_volatile(self.base().add(register / 4)) }
        }

        fn set(&mut self, register: usize, value: u32) {
            unsafe { ptr::write_volatile(self.base().add(register / 4), value) }
        }
    }

    struct CountdownDelay {
        current: *mut u32,
        elapsed: u32,
    }

    impl Delay for CountdownDelay {
        fn delay_us(&mut self, _us: u64) {
            unsafe { ptr::write_volatile(self.current, u32::MAX - self.elapsed) };
        }
    }

    #[test]
    fn enable_sets_spurious_and_priority() {
        let mut fixture = Fixture::new();
        fixture.set(REG_TPR, 0x20);
        let mut apic = fixture.apic();
        apic.enable();
        assert_eq!(fixture.get(REG_SPURIOUS), 0x1FF);
        assert_eq!(fixture.get(REG_TPR), 0);
    }

    #[test]
    fn id_comes_from_the_top_byte() {
        let mut fixture = Fixture::new();
        fixture.set(REG_ID, 3 << 24);
        assert_eq!(fixture.apic().id(), 3);
    }

    #[test]
    fn init_and_startup_commands() {
        let mut fixture = Fixture::new();
        let mut apic = fixture.apic();

        apic.send_init(5);
        assert_eq!(fixture.get(REG_ICR_HIGH), 5 << 24);
        assert_eq!(fixture.get(REG_ICR_LOW), 0x4500);

        apic.send_startup(7, 0x08);
        assert_eq!(fixture.get(REG_ICR_HIGH), 7 << 24);
        assert_eq!(fixture.get(REG_ICR_LOW), 0x4608);
    }

    #[test]
    fn eoi_writes_zero() {
        let mut fixture = Fixture::new();
        fixture.set(REG_EOI, 0xDEAD);
        fixture.apic().end_of_interrupt();
        assert_eq!(fixture.get(REG_EOI), 0);
    }

    #[test]
    fn calibration_measures_elapsed_counts() {
        let mut fixture = Fixture::new();
        let mut apic = fixture.apic();
        let mut delay = CountdownDelay {
            current: unsafe { fixture.base().add(REG_TIMER_CURRENT / 4) },
            elapsed: 62_500,
        };

        assert_eq!(apic.calibrate_timer(&mut delay, 10_000), 62_500);
        assert_eq!(fixture.get(REG_LVT_TIMER), LVT_MASKED);
        assert_eq!(fixture.get(REG_TIMER_INITIAL), 0);
    }

    #[test]
    fn periodic_timer_programming() {
        let mut fixture = Fixture::new();
        fixture.apic().start_periodic_timer(32, 1000);
        assert_eq!(fixture.get(REG_LVT_TIMER), TIMER_PERIODIC | 32);
        assert_eq!(fixture.get(REG_TIMER_INITIAL), 1000);
        assert_eq!(fixture.get(REG_TIMER_DIVIDE), TIMER_DIVIDE_16);
    }

    #[test]
    fn periodic_count_scales_calibration() {
        // 62_500 counts in 10 ms at 100 Hz is one window per tick
        assert_eq!(periodic_count(62_500, 10_000, 100), 62_500);
        assert_eq!(periodic_count(62_500, 10_000, 1000), 6_250);
        assert_eq!(periodic_count(0, 10_000, 100), 1);
    }
}
