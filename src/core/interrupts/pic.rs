//! # Legacy Cascade Controller (8259 PIC)
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐
//! │  primary    │◀────│  secondary  │
//! │ IRQ 0-7     │ IRQ2│ IRQ 8-15    │
//! └─────────────┘     └─────────────┘
//!       │
//!       ▼
//!     CPU
//! ```
//!
//! Lines are remapped past the exception vectors: IRQ 0-7 land on 32-39 and
//! IRQ 8-15 on 40-47. After remapping every line except the cascade is
//! masked; drivers unmask what they need.

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = 40;

/// Primary mask with only IRQ2 (the cascade) open.
const CASCADE_ONLY: u8 = !(1 << 2);

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// True for vectors that belong to a legacy line.
pub fn handles(vector: u8) -> bool {
    (PIC_1_OFFSET..PIC_2_OFFSET + 8).contains(&vector)
}

/// Remap both chips and mask everything but the cascade.
pub fn init() {
    let mut pics = PICS.lock();
    // Safety: the offsets do not overlap the exception vectors.
    unsafe {
        pics.initialize();
        pics.write_masks(CASCADE_ONLY, 0xFF);
    }
}

pub fn unmask(irq: u8) {
    without_interrupts(|| {
        let mut pics = PICS.lock();
        // Safety: opening a line only lets an already installed gate fire.
        unsafe {
            let [mut primary, mut secondary] = pics.read_masks();
            if irq < 8 {
                primary &= !(1 << irq);
            } else {
                secondary &= !(1 << (irq - 8));
                primary &= CASCADE_ONLY;
            }
            pics.write_masks(primary, secondary);
        }
    });
}

/// Silence both chips for good once the per-core controller takes over.
pub fn disable() {
    // Safety: masking lines cannot cause an interrupt.
    unsafe { PICS.lock().disable() };
}

/// End of interrupt for `vector`; the chip pair also acknowledges the
/// secondary when the line was cascaded.
pub fn end_of_interrupt(vector: u8) {
    // Safety: only called from the dispatcher for a legacy vector.
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_vector_ranges() {
        assert!(handles(32));
        assert!(handles(47));
        assert!(!handles(31));
        assert!(!handles(48));
    }

    #[test]
    fn cascade_mask_keeps_line_two_open() {
        assert_eq!(CASCADE_ONLY, 0b1111_1011);
    }
}
