//! Vireo Kernel Entry Point

#![no_std]
#![no_main]

extern crate alloc;

use ::x86_64::VirtAddr;
use alloc::vec::Vec;
use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use vireo_common::{LoadError, SegmentFlags};
use vireo_kernel::arch::x86_64::{self, interrupts, pit};
use vireo_kernel::fs::{FsError, ROOT_FS};
use vireo_kernel::loader::{load_program, ElfImageBuilder, LoaderConfig};
use vireo_kernel::memory::{self, ActiveSpace, KernelFrames};
use vireo_kernel::task::{SavedFrame, TASKS};
use vireo_kernel::{config, serial_println, timer};

entry_point!(kernel_main);

/// Path of the first user program.
const INIT_PATH: &str = "init";
const INIT_BASE: u32 = 0x0804_8000;

/// Why `init` could not be started.
#[derive(Debug)]
enum SpawnError {
    Open(FsError),
    Load(LoadError),
    TaskTableFull,
}

/// Kernel entry point.
///
/// Called by the bootloader after setting up the initial environment.
fn kernel_main(boot_info: &'static BootInfo) -> ! {
    vireo_kernel::init();
    log::info!("vireo kernel starting");

    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);
    // SAFETY: the bootloader maps all physical memory at this offset, and
    // this is the only mapper created.
    let mut mapper = unsafe { memory::init_mapper(phys_mem_offset) };
    // SAFETY: the bootloader's memory map marks in-use frames as non-usable.
    unsafe { memory::init_frames(&boot_info.memory_map) };

    if let Err(err) = vireo_kernel::allocator::init_heap(&mut mapper) {
        panic!("heap initialization failed: {:?}", err);
    }

    timer::init();
    pit::init(config::TIMER_HZ);

    vireo_kernel::tests::run_all(&mut mapper);

    ROOT_FS.add_file(INIT_PATH, &init_image());
    match spawn_init(&mut mapper) {
        Ok(()) => log::info!("{} started", INIT_PATH),
        Err(err) => log::error!("failed to start {}: {:?}", INIT_PATH, err),
    }

    interrupts::enable();
    if let Some(timer) = timer::subsystem() {
        timer.preemption().enable();
    }
    log::info!("boot complete");

    let mut last_report = 0;
    loop {
        x86_64::hlt();
        let ticks = timer::subsystem().map_or(0, |t| t.ticks());
        if ticks >= last_report + u64::from(config::TIMER_HZ) {
            last_report = ticks;
            log::debug!("uptime: {} ticks", ticks);
        }
    }
}

/// The built-in `init` program: a code page that spins and a small data
/// segment with a zero-filled tail.
fn init_image() -> Vec<u8> {
    ElfImageBuilder::new(INIT_BASE)
        .segment(INIT_BASE, SegmentFlags::READ | SegmentFlags::EXECUTE, &[0xEB, 0xFE], 2)
        .segment(INIT_BASE + 0x1000, SegmentFlags::READ | SegmentFlags::WRITE, b"vireo", 0x2000)
        .build()
}

fn spawn_init(mapper: &mut ::x86_64::structures::paging::OffsetPageTable<'static>) -> Result<(), SpawnError> {
    let mut file = ROOT_FS.open(INIT_PATH).map_err(SpawnError::Open)?;
    let mut space = ActiveSpace::new(mapper);
    let loaded = load_program(&mut file, &mut space, &mut KernelFrames, &LoaderConfig::default())
        .map_err(SpawnError::Load)?;

    let frame = SavedFrame::entry(loaded.entry, loaded.stack_pointer);
    let task = ::x86_64::instructions::interrupts::without_interrupts(|| TASKS.lock().spawn(frame))
        .ok_or(SpawnError::TaskTableFull)?;
    log::debug!("{}: {} entry {}", INIT_PATH, task, loaded.entry);
    Ok(())
}

/// Panic handler.
///
/// Called when the kernel encounters an unrecoverable error.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {}", info);
    x86_64::halt_loop()
}
