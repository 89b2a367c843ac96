#![no_std]
#![no_main]

extern crate rlibc;

use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;

use kestrel::boot_info::MemoryRegion;
use kestrel::memory::mapping;
use kestrel::{config, println};

entry_point!(kernel_main, config = &config::BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kestrel::init_early();

    let Some(offset) = boot_info.physical_memory_offset.into_option() else {
        println!("kestrel: loader did not map physical memory");
        kestrel::halt_loop();
    };
    mapping::set_physical_memory_offset(offset);

    let regions = &boot_info.memory_regions;
    let memory_map = (!regions.is_empty()).then(|| regions.iter().map(MemoryRegion::from));

    match kestrel::init_kernel(memory_map) {
        Ok(cores) => log::info!(
            "kestrel: up, {} core(s), multicore {}",
            cores.online,
            if cores.multicore { "on" } else { "off" }
        ),
        Err(e) => {
            println!("kestrel: initialization failed: {}", e);
            kestrel::halt_loop();
        }
    }

    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // Whoever panicked may hold the port.
    unsafe { kestrel::SERIAL.force_unlock() };
    println!(
        "PANIC on cpu{}: {} | {:?}",
        kestrel::current_core_id(),
        info.message(),
        info.location()
    );
    kestrel::halt_loop()
}
