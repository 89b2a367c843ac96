//! # Interrupt Descriptor Table
//!
//! 256 gates of 16 bytes. Vectors 0-31 (exceptions), 32-47 (remapped
//! hardware lines) and the spurious vector get a gate; every other entry stays
//! zero and is therefore not present.
//!
//! Each installed vector has a tiny entry stub that normalises the stack to a
//! [`SavedRegisters`] frame (pushing a zero error code where the CPU does not)
//! and jumps to one common routine. That routine saves the general purpose
//! registers, calls [`interrupt_dispatch`](super::controller::interrupt_dispatch)
//! with a pointer to the frame, restores everything and returns with `iretq`.
//!
//! ```text
//! high  ss rsp rflags cs rip        <- pushed by the CPU
//!       error_code vector           <- pushed by the stub
//! low   rax ... r15                 <- pushed by the common routine
//! ```

use core::arch::naked_asm;
use core::mem::size_of;

use spin::Lazy;
use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::controller::interrupt_dispatch;
use super::gdt::KERNEL_CODE_SELECTOR;
use super::SPURIOUS_VECTOR;

pub const IDT_ENTRIES: usize = 256;

/// Present, ring 0, 64-bit interrupt gate.
pub const GATE_INTERRUPT: u8 = 0x8E;

/// Register state at the moment of the interrupt, in stack order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    zero: u32,
}

static_assertions::const_assert_eq!(size_of::<IdtEntry>(), 16);
static_assertions::const_assert_eq!(size_of::<SavedRegisters>(), 22 * 8);

impl IdtEntry {
    pub const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        ist: 0,
        type_attr: 0,
        offset_mid: 0,
        offset_high: 0,
        zero: 0,
    };

    pub const fn new(handler: u64, selector: u16, type_attr: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: 0,
            type_attr,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            zero: 0,
        }
    }

    pub fn handler_address(&self) -> u64 {
        self.offset_low as u64 | (self.offset_mid as u64) << 16 | (self.offset_high as u64) << 32
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn type_attr(&self) -> u8 {
        self.type_attr
    }

    pub fn is_present(&self) -> bool {
        self.type_attr & 0x80 != 0
    }
}

#[repr(C, align(16))]
pub struct InterruptTable {
    entries: [IdtEntry; IDT_ENTRIES],
}

impl InterruptTable {
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; IDT_ENTRIES],
        }
    }

    pub fn set_handler(&mut self, vector: u8, handler: u64) {
        self.entries[vector as usize] =
            IdtEntry::new(handler, KERNEL_CODE_SELECTOR.0, GATE_INTERRUPT);
    }

    pub fn entry(&self, vector: u8) -> &IdtEntry {
        &self.entries[vector as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point the calling core's table register at this table.
    pub fn load(&'static self) {
        let pointer = DescriptorTablePointer {
            limit: (size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
            base: VirtAddr::from_ptr(self.entries.as_ptr()),
        };
        // Safety: the table is 'static and every present gate points at a stub.
        unsafe { lidt(&pointer) };
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Vectors for which the CPU pushes an error code itself.
const fn pushes_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

#[unsafe(naked)]
unsafe extern "C" fn interrupt_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cld",
        "mov rdi, rsp",
        "mov rbp, rsp",
        "and rsp, -16",
        "call {dispatch}",
        "mov rsp, rbp",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym interrupt_dispatch,
    );
}

macro_rules! entry_stubs {
    ($($name:ident => $vector:literal),* $(,)?) => {
        $(
            #[unsafe(naked)]
            unsafe extern "C" fn $name() {
                naked_asm!(
                    ".if {has_error} == 0",
                    "push 0",
                    ".endif",
                    "push {vector}",
                    "jmp {common}",
                    has_error = const pushes_error_code($vector) as u8,
                    vector = const $vector,
                    common = sym interrupt_common,
                );
            }
        )*

        const ENTRY_STUBS: &[(u8, unsafe extern "C" fn())] = &[$(($vector, $name)),*];
    };
}

entry_stubs! {
    vector_0 => 0, vector_1 => 1, vector_2 => 2, vector_3 => 3,
    vector_4 => 4, vector_5 => 5, vector_6 => 6, vector_7 => 7,
    vector_8 => 8, vector_9 => 9, vector_10 => 10, vector_11 => 11,
    vector_12 => 12, vector_13 => 13, vector_14 => 14, vector_15 => 15,
    vector_16 => 16, vector_17 => 17, vector_18 => 18, vector_19 => 19,
    vector_20 => 20, vector_21 => 21, vector_22 => 22, vector_23 => 23,
    vector_24 => 24, vector_25 => 25, vector_26 => 26, vector_27 => 27,
    vector_28 => 28, vector_29 => 29, vector_30 => 30, vector_31 => 31,
    vector_32 => 32, vector_33 => 33, vector_34 => 34, vector_35 => 35,
    vector_36 => 36, vector_37 => 37, vector_38 => 38, vector_39 => 39,
    vector_40 => 40, vector_41 => 41, vector_42 => 42, vector_43 => 43,
    vector_44 => 44, vector_45 => 45, vector_46 => 46, vector_47 => 47,
    vector_255 => 255,
}

static_assertions::const_assert_eq!(SPURIOUS_VECTOR, 255);

fn build_table() -> InterruptTable {
    let mut table = InterruptTable::new();
    for &(vector, stub) in ENTRY_STUBS {
        table.set_handler(vector, stub as usize as u64);
    }
    table
}

static IDT: Lazy<InterruptTable> = Lazy::new(build_table);

pub fn table() -> &'static InterruptTable {
    &IDT
}

/// Build the shared table on first use and load it on the calling core.
pub fn init() {
    IDT.load();
}
