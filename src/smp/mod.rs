//! # Multicore Bring-Up
//!
//! Run once on the boot core after memory and the heap are up:
//!
//! 1. Without a local APIC the boot core is the only core; stop.
//! 2. Enable the boot core's APIC and record it as core 0.
//! 3. For every candidate APIC id except our own: claim a slot, prepare the
//!    startup routine, send INIT, wait 10 ms, send STARTUP twice with 200 us
//!    after each, then poll the slot's online flag for up to ~1 s.
//! 4. Multicore is enabled when more than one core is online.
//!
//! A core that never answers is sent INIT again, which holds it in
//! wait-for-STARTUP; it costs its stack and its slot goes to the next
//! candidate. Started cores load the shared tables, enable their
//! APIC, mark themselves online and halt.

pub mod cores;
pub mod trampoline;

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{
    CANDIDATE_APIC_IDS, INIT_DELAY_US, ONLINE_POLL_ATTEMPTS, ONLINE_POLL_INTERVAL_US,
    STARTUP_DELAY_US,
};
use crate::core::interrupts::apic::{self, LocalApic, LocalInterruptController};
use crate::core::interrupts::timer::{Delay, PitDelay};
use crate::memory::{self, mapping};

pub use cores::{CoreRecord, CoreTable};
pub use trampoline::{LowMemoryTrampoline, Prepared, StartupImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpError {
    NoLocalController,
    MappingFailed,
    TrampolineTooLarge,
    PageTableAboveFourGiB,
    StackAllocation,
    TableFull,
    Timeout,
}

impl fmt::Display for BringUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BringUpError::NoLocalController => write!(f, "no local APIC"),
            BringUpError::MappingFailed => write!(f, "could not map bring-up memory"),
            BringUpError::TrampolineTooLarge => write!(f, "startup routine exceeds one page"),
            BringUpError::PageTableAboveFourGiB => write!(f, "page table root above 4 GiB"),
            BringUpError::StackAllocation => write!(f, "no heap left for a core stack"),
            BringUpError::TableFull => write!(f, "core table full"),
            BringUpError::Timeout => write!(f, "core did not come online"),
        }
    }
}

/// Outcome of bring-up. Hardware absence is reported here, never as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringUpReport {
    pub online: usize,
    pub attempted: usize,
    pub controller_active: bool,
    pub multicore: bool,
}

/// What bring-up drives. `image` is `None` when the startup routine could
/// not be installed; the boot core's controller is still enabled.
pub struct Hardware<C, S, D> {
    pub controller: C,
    pub image: Option<S>,
    pub delay: D,
}

pub fn bring_up<C, S, D>(cores: &CoreTable, hardware: Option<Hardware<C, S, D>>) -> BringUpReport
where
    C: LocalInterruptController,
    S: StartupImage,
    D: Delay,
{
    let Some(Hardware {
        mut controller,
        image,
        mut delay,
    }) = hardware
    else {
        cores.register_boot_core(0);
        log::info!("smp: no local APIC, running on the boot core only");
        return BringUpReport {
            online: 1,
            attempted: 0,
            controller_active: false,
            multicore: false,
        };
    };

    controller.enable();
    let boot_id = controller.id();
    cores.register_boot_core(boot_id);
    log::info!("smp: boot core has APIC id {}", boot_id);

    let mut attempted = 0;
    if let Some(mut image) = image {
        for target in (0..CANDIDATE_APIC_IDS).filter(|&id| id != boot_id) {
            attempted += 1;
            match start_core(cores, &mut controller, &mut image, &mut delay, target) {
                Ok(index) => log::info!("smp: core {} (APIC id {}) online", index, target),
                Err(BringUpError::Timeout) => {
                    log::debug!("smp: APIC id {} did not answer", target)
                }
                Err(error) => {
                    log::warn!("smp: giving up on further cores: {}", error);
                    break;
                }
            }
        }
    }

    let online = cores.online_count();
    BringUpReport {
        online,
        attempted,
        controller_active: true,
        multicore: online > 1,
    }
}

fn start_core<C, S, D>(
    cores: &CoreTable,
    controller: &mut C,
    image: &mut S,
    delay: &mut D,
    target: u8,
) -> Result<usize, BringUpError>
where
    C: LocalInterruptController,
    S: StartupImage,
    D: Delay,
{
    let index = cores.next_free().ok_or(BringUpError::TableFull)?;
    let prepared = image.prepare(index)?;
    cores
        .claim_next(target, prepared.stack_top)
        .ok_or(BringUpError::TableFull)?;

    controller.send_init(target);
    delay.delay_us(INIT_DELAY_US);
    for _ in 0..2 {
        controller.send_startup(target, prepared.page);
        delay.delay_us(STARTUP_DELAY_US);
    }

    for _ in 0..ONLINE_POLL_ATTEMPTS {
        if cores.is_online(index) && cores.commit(index) {
            return Ok(index);
        }
        delay.delay_us(ONLINE_POLL_INTERVAL_US);
    }
    // Park the core again so it cannot run the routine once it has been
    // prepared for the next candidate.
    controller.send_init(target);
    cores.abandon(index);
    Err(BringUpError::Timeout)
}

pub static CORES: CoreTable = CoreTable::new();
static MULTICORE: AtomicBool = AtomicBool::new(false);

fn detect() -> Result<Hardware<LocalApic, LowMemoryTrampoline, PitDelay>, BringUpError> {
    if !apic::is_supported() {
        return Err(BringUpError::NoLocalController);
    }
    let base = apic::base_address();
    let registers =
        memory::with_physical_memory(|frames| unsafe { mapping::map_mmio(base, frames) })
            .ok_or(BringUpError::MappingFailed)?
            .map_err(|_| BringUpError::MappingFailed)?;
    apic::activate(registers);
    // Safety: the register page was just mapped uncached.
    let controller = unsafe { LocalApic::new(registers) };
    log::debug!("smp: local APIC at {:#x}, version {:#x}", base.as_u64(), controller.version());

    let image = match LowMemoryTrampoline::install(secondary_main) {
        Ok(image) => Some(image),
        Err(error) => {
            log::warn!("smp: cannot install startup routine: {}", error);
            None
        }
    };
    Ok(Hardware {
        controller,
        image,
        delay: PitDelay::new(),
    })
}

/// Start every core that answers. Must run after the heap is initialized.
pub fn init() -> BringUpReport {
    let report = match detect() {
        Ok(hardware) => bring_up(&CORES, Some(hardware)),
        Err(error) => {
            log::warn!("smp: {}", error);
            bring_up::<LocalApic, LowMemoryTrampoline, PitDelay>(&CORES, None)
        }
    };
    MULTICORE.store(report.multicore, Ordering::Release);
    log::info!(
        "smp: {} core(s) online after {} attempt(s), multicore {}",
        report.online,
        report.attempted,
        if report.multicore { "enabled" } else { "disabled" }
    );
    report
}

/// First Rust code a started core runs.
extern "C" fn secondary_main(index: u64) -> ! {
    crate::core::interrupts::init_secondary();
    if let Some(mut local) = apic::active() {
        local.enable();
        CORES.mark_online(index as usize, local.id());
    }
    crate::halt_loop()
}

pub fn is_enabled() -> bool {
    MULTICORE.load(Ordering::Acquire)
}

pub fn core_count() -> usize {
    CORES.online_count()
}

pub fn core_info(index: usize) -> Option<CoreRecord> {
    CORES.record(index)
}

/// Logical index of the calling core; 0 whenever multicore is off.
pub fn current_core_id() -> usize {
    if !is_enabled() {
        return 0;
    }
    apic::active()
        .and_then(|local| CORES.index_of(local.id()))
        .unwrap_or(0)
}
