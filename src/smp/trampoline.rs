//! # Secondary Core Startup Routine
//!
//! A position-independent blob that takes a core from the real-mode state a
//! STARTUP signal leaves it in to a call into Rust in long mode.
//!
//! ```text
//! 16-bit   cli, DS = CS, ebx = CS << 4 (blob base)
//!          patch GDT pointer and far pointer with ebx, lgdt, CR0.PE = 1
//! 32-bit   flat data segments, CR4.PAE, CR3 <- data.cr3,
//!          EFER <- data.efer, caches on, CR0.PG = 1, far jump to 64-bit code
//! 64-bit   rsp <- data.stack_top, rdi <- data.argument, call data.entry
//! ```
//!
//! Entry contract: the blob sits at a page boundary below 1 MiB, identity
//! mapped and executable in the page tables named by `cr3`, and `cr3` is
//! below 4 GiB. Exit contract: the core runs `entry(argument)` on the given
//! stack with interrupts disabled; if it ever returns the core halts.
//!
//! Only label differences are used inside the blob, so it carries no
//! relocations and can be copied anywhere page aligned.

use core::arch::global_asm;
use core::mem::{offset_of, size_of};
use core::ptr;

use x86_64::registers::control::Cr3;
use x86_64::registers::model_specific::Efer;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use super::BringUpError;
use crate::config::{PAGE_SIZE, SECONDARY_STACK_SIZE, TRAMPOLINE_ADDRESS};
use crate::memory::{self, mapping};

global_asm!(
    r#"
    .pushsection .rodata.kestrel_ap_trampoline, "a"
    .balign 16
    .global kestrel_ap_trampoline_start
kestrel_ap_trampoline_start:
    .code16
    cli
    cld
    movw %cs, %ax
    movw %ax, %ds
    xorl %ebx, %ebx
    movw %ax, %bx
    shll $4, %ebx

    leal (.Lap_gdt - kestrel_ap_trampoline_start)(%ebx), %eax
    movl %eax, (.Lap_gdtr - kestrel_ap_trampoline_start + 2)
    leal (.Lap_protected - kestrel_ap_trampoline_start)(%ebx), %eax
    movl %eax, (.Lap_far32 - kestrel_ap_trampoline_start)

    lgdtl (.Lap_gdtr - kestrel_ap_trampoline_start)
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl *(.Lap_far32 - kestrel_ap_trampoline_start)

    .code32
.Lap_protected:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movw %ax, %fs
    movw %ax, %gs

    movl %cr4, %eax
    orl $0x20, %eax
    movl %eax, %cr4

    movl (.Lap_data_cr3 - kestrel_ap_trampoline_start)(%ebx), %eax
    movl %eax, %cr3

    movl $0xC0000080, %ecx
    movl (.Lap_data_efer - kestrel_ap_trampoline_start)(%ebx), %eax
    andl $~0x400, %eax
    xorl %edx, %edx
    wrmsr

    movl %cr0, %eax
    andl $~0x60000000, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0

    leal (.Lap_long - kestrel_ap_trampoline_start)(%ebx), %eax
    movl %eax, (.Lap_far64 - kestrel_ap_trampoline_start)(%ebx)
    ljmpl *(.Lap_far64 - kestrel_ap_trampoline_start)(%ebx)

    .code64
.Lap_long:
    movl %ebx, %ebx
    movq (.Lap_data_stack - kestrel_ap_trampoline_start)(%rbx), %rsp
    movq (.Lap_data_argument - kestrel_ap_trampoline_start)(%rbx), %rdi
    movq (.Lap_data_entry - kestrel_ap_trampoline_start)(%rbx), %rax
    xorl %ebp, %ebp
    callq *%rax
1:
    cli
    hlt
    jmp 1b

    .balign 8
.Lap_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
    .quad 0x00AF9A000000FFFF
.Lap_gdt_end:
.Lap_gdtr:
    .word .Lap_gdt_end - .Lap_gdt - 1
    .long 0
.Lap_far32:
    .long 0
    .word 0x08
.Lap_far64:
    .long 0
    .word 0x18

    .balign 8
.Lap_data_cr3:
    .quad 0
.Lap_data_efer:
    .quad 0
.Lap_data_stack:
    .quad 0
.Lap_data_entry:
    .quad 0
.Lap_data_argument:
    .quad 0
    .global kestrel_ap_trampoline_end
kestrel_ap_trampoline_end:
    .popsection
"#,
    options(att_syntax)
);

extern "C" {
    static kestrel_ap_trampoline_start: u8;
    static kestrel_ap_trampoline_end: u8;
}

/// Parameters the blob reads from its tail.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrampolineData {
    pub cr3: u64,
    pub efer: u64,
    pub stack_top: u64,
    pub entry: u64,
    pub argument: u64,
}

static_assertions::const_assert_eq!(offset_of!(TrampolineData, cr3), 0);
static_assertions::const_assert_eq!(offset_of!(TrampolineData, efer), 8);
static_assertions::const_assert_eq!(offset_of!(TrampolineData, stack_top), 16);
static_assertions::const_assert_eq!(offset_of!(TrampolineData, entry), 24);
static_assertions::const_assert_eq!(offset_of!(TrampolineData, argument), 32);
static_assertions::const_assert_eq!(size_of::<TrampolineData>(), 40);

/// STARTUP page number for the configured address.
pub const STARTUP_PAGE: u8 = (TRAMPOLINE_ADDRESS / PAGE_SIZE) as u8;

static_assertions::const_assert!(TRAMPOLINE_ADDRESS % PAGE_SIZE == 0);
static_assertions::const_assert!(TRAMPOLINE_ADDRESS < 0x10_0000);

/// The assembled blob.
pub fn blob() -> &'static [u8] {
    // Safety: both symbols delimit the same read-only section.
    unsafe {
        let start = ptr::addr_of!(kestrel_ap_trampoline_start);
        let end = ptr::addr_of!(kestrel_ap_trampoline_end);
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

/// Offset of [`TrampolineData`] inside the blob.
pub fn data_offset() -> usize {
    blob().len() - size_of::<TrampolineData>()
}

/// What a started core receives besides its stack.
pub type SecondaryEntry = extern "C" fn(u64) -> !;

/// Prepares startup code for one core at a time.
pub trait StartupImage {
    /// Make the routine ready for the core taking slot `index`. Returns the
    /// STARTUP page number and the stack top given to the core.
    fn prepare(&mut self, index: usize) -> Result<Prepared, BringUpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    pub page: u8,
    pub stack_top: u64,
}

/// The blob installed at [`TRAMPOLINE_ADDRESS`].
pub struct LowMemoryTrampoline {
    data: *mut TrampolineData,
    template: TrampolineData,
}

impl LowMemoryTrampoline {
    /// Identity-map the low page, copy the blob there and capture the boot
    /// core's paging state.
    pub fn install(entry: SecondaryEntry) -> Result<Self, BringUpError> {
        let code = blob();
        if code.len() > PAGE_SIZE as usize {
            return Err(BringUpError::TrampolineTooLarge);
        }

        let (level_4, _) = Cr3::read();
        let cr3 = level_4.start_address().as_u64();
        if cr3 > u32::MAX as u64 {
            return Err(BringUpError::PageTableAboveFourGiB);
        }

        let frame = PhysFrame::containing_address(PhysAddr::new(TRAMPOLINE_ADDRESS));
        memory::with_physical_memory(|frames| unsafe { mapping::identity_map(frame, frames) })
            .ok_or(BringUpError::MappingFailed)?
            .map_err(|_| BringUpError::MappingFailed)?;

        let target = mapping::phys_to_virt(frame.start_address()).as_mut_ptr::<u8>();
        // Safety: the low page is reserved for the routine and mapped through
        // the offset window.
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), target, code.len()) };

        log::debug!(
            "smp: startup routine ({} bytes) at {:#x}, cr3 {:#x}",
            code.len(),
            TRAMPOLINE_ADDRESS,
            cr3
        );

        Ok(Self {
            data: unsafe { target.add(data_offset()) }.cast(),
            template: TrampolineData {
                cr3,
                efer: Efer::read_raw(),
                stack_top: 0,
                entry: entry as usize as u64,
                argument: 0,
            },
        })
    }
}

impl StartupImage for LowMemoryTrampoline {
    fn prepare(&mut self, index: usize) -> Result<Prepared, BringUpError> {
        let stack =
            memory::allocate(SECONDARY_STACK_SIZE).map_err(|_| BringUpError::StackAllocation)?;
        let stack_top = stack.as_ptr() as u64 + SECONDARY_STACK_SIZE as u64;
        let data = TrampolineData {
            stack_top,
            argument: index as u64,
            ..self.template
        };
        // Safety: `data` points into the installed blob. Every attempt shares
        // it; a core that timed out was sent INIT again and is not running it.
        unsafe { ptr::write_volatile(self.data, data) };
        Ok(Prepared {
            page: STARTUP_PAGE,
            stack_top,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_fits_in_one_page() {
        let code = blob();
        assert!(!code.is_empty());
        assert!(code.len() <= PAGE_SIZE as usize);
    }

    #[test]
    fn starts_by_disabling_interrupts() {
        // cli; cld
        assert_eq!(&blob()[..2], &[0xFA, 0xFC]);
    }

    #[test]
    fn data_block_is_the_aligned_tail() {
        let offset = data_offset();
        assert_eq!(offset % 8, 0);
        assert_eq!(blob()[offset..], [0u8; 40]);
    }

    #[test]
    fn temporary_gdt_precedes_the_data_block() {
        let code = blob();
        let gdt_64 = 0x00AF_9A00_0000_FFFFu64.to_le_bytes();
        let gdt_32 = 0x00CF_9A00_0000_FFFFu64.to_le_bytes();
        assert!(code.windows(8).any(|w| w == gdt_64));
        assert!(code.windows(8).any(|w| w == gdt_32));
    }

    #[test]
    fn paging_is_enabled_with_caches_on() {
        // and $~0x60000000, %eax; or $0x80000001, %eax
        let code = blob();
        let clear_cd_nw = [0x25, 0xFF, 0xFF, 0xFF, 0x9F];
        let set_pg_pe = [0x0D, 0x01, 0x00, 0x00, 0x80];
        let clear = code.windows(5).position(|w| w == clear_cd_nw).unwrap();
        let set = code.windows(5).position(|w| w == set_pg_pe).unwrap();
        assert!(clear < set);
    }

    #[test]
    fn startup_page_matches_address() {
        assert_eq!(STARTUP_PAGE, 0x08);
    }
}
