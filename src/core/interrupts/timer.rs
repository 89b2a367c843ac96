//! # Timers
//!
//! - PIT channel 0 drives the periodic tick on IRQ0 (vector 32) in legacy mode
//! - PIT channel 2, gated through port 0x61, is a polled one-shot used as the
//!   monotonic delay for bring-up handshakes and local timer calibration
//!
//! The tick counter is shared by both modes; whichever source raises vector
//! 32 advances it.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use super::pic;

pub const PIT_FREQUENCY: u64 = 1_193_182;

const CHANNEL0: u16 = 0x40;
const CHANNEL2: u16 = 0x42;
const COMMAND: u16 = 0x43;
const PORT_B: u16 = 0x61;

/// Channel 0, low/high byte, rate generator.
const CHANNEL0_RATE_GENERATOR: u8 = 0x36;
/// Channel 2, low/high byte, interrupt on terminal count.
const CHANNEL2_ONE_SHOT: u8 = 0xB0;

const PORT_B_GATE: u8 = 0x01;
const PORT_B_SPEAKER: u8 = 0x02;
const PORT_B_OUTPUT: u8 = 0x20;

pub static TIMER_TICKS: AtomicU64 = AtomicU64::new(0);

/// Busy-wait for a bounded time. Bring-up only ever waits through this.
pub trait Delay {
    fn delay_us(&mut self, us: u64);

    fn delay_ms(&mut self, ms: u64) {
        self.delay_us(ms * 1000);
    }
}

/// Channel 0 reload value for `frequency_hz`, clamped to what 16 bits hold.
pub fn divisor_for(frequency_hz: u32) -> u16 {
    let divisor = PIT_FREQUENCY / u64::from(frequency_hz.max(1));
    divisor.clamp(1, u16::MAX as u64) as u16
}

/// Program channel 0 as a rate generator and open IRQ0.
pub fn init(frequency_hz: u32) {
    let divisor = divisor_for(frequency_hz);
    let mut command = Port::<u8>::new(COMMAND);
    let mut data = Port::<u8>::new(CHANNEL0);
    // Safety: the PIT ports are owned by this module.
    unsafe {
        command.write(CHANNEL0_RATE_GENERATOR);
        data.write(divisor as u8);
        data.write((divisor >> 8) as u8);
    }
    pic::unmask(0);
    log::info!("timer: PIT at {} Hz (divisor {})", frequency_hz, divisor);
}

pub fn tick() {
    TIMER_TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn ticks() -> u64 {
    TIMER_TICKS.load(Ordering::Relaxed)
}

/// Halt until `count` more ticks have arrived. Needs interrupts enabled.
pub fn wait_ticks(count: u64) {
    let target = ticks() + count;
    while ticks() < target {
        x86_64::instructions::hlt();
    }
}

/// Split a microsecond wait into counts that fit the 16-bit counter.
fn pit_counts(us: u64) -> impl Iterator<Item = u16> {
    let mut remaining = us.saturating_mul(PIT_FREQUENCY) / 1_000_000;
    core::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let count = remaining.min(u16::MAX as u64);
        remaining -= count;
        Some(count as u16)
    })
}

/// Monotonic delay polling PIT channel 2.
#[derive(Debug, Default, Clone, Copy)]
pub struct PitDelay;

impl PitDelay {
    pub const fn new() -> Self {
        Self
    }

    fn one_shot(&mut self, count: u16) {
        let mut command = Port::<u8>::new(COMMAND);
        let mut data = Port::<u8>::new(CHANNEL2);
        let mut port_b = Port::<u8>::new(PORT_B);
        // Safety: channel 2 and the gate bits of port 0x61 belong to this delay.
        unsafe {
            let saved = port_b.read() & !(PORT_B_GATE | PORT_B_SPEAKER);
            port_b.write(saved);
            command.write(CHANNEL2_ONE_SHOT);
            data.write(count as u8);
            data.write((count >> 8) as u8);
            port_b.write(saved | PORT_B_GATE);
            while port_b.read() & PORT_B_OUTPUT == 0 {
                core::hint::spin_loop();
            }
            port_b.write(saved);
        }
    }
}

impl Delay for PitDelay {
    fn delay_us(&mut self, us: u64) {
        for count in pit_counts(us) {
            self.one_shot(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_matches_frequency() {
        assert_eq!(divisor_for(100), 11_931);
        assert_eq!(divisor_for(1000), 1193);
        assert_eq!(divisor_for(1), u16::MAX);
        assert_eq!(divisor_for(0), u16::MAX);
        assert_eq!(divisor_for(2_000_000), 1);
    }

    #[test]
    fn long_waits_are_split() {
        // 10 ms is 11_931 PIT counts
        assert_eq!(pit_counts(10_000).collect::<Vec<_>>(), vec![11_931]);
        // 100 ms is 119_318 counts
        let counts: Vec<_> = pit_counts(100_000).collect();
        assert_eq!(counts, vec![65_535, 53_783]);
        assert_eq!(pit_counts(0).count(), 0);
    }

    #[test]
    fn ticks_advance() {
        let before = ticks();
        tick();
        tick();
        assert!(ticks() >= before + 2);
    }
}
