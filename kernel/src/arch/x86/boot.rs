//! Multiboot2 entry and kernel bring-up.
//!
//! The loader enters `_start` with `EAX` holding the Multiboot2 magic and
//! `EBX` pointing at the boot information structure. Bring-up order
//! matters: serial/logging first, descriptor tables, PIC, then the memory
//! plane (heap before frame allocator; the allocator's bitmap lives on
//! the heap), paging, the kernel aggregate with its plugins, the root
//! process, and finally the PIT and the first switch to ring 3.

extern crate alloc;

use core::arch::global_asm;

use alloc::sync::Arc;
use alloc::vec::Vec;

use multiboot2::{BootInformation, BootInformationHeader};
use spin::Mutex;

use super::{context, gdt, idt, pic, pit, serial, vga};
use crate::mm::frame_allocator::FrameAllocator;
use crate::mm::layout::{KERNEL_AREA_END, KERNEL_HEAP_END, KERNEL_HEAP_START};
use crate::mm::phys::{PhysAddr, PhysWindow, FRAME_SIZE};
use crate::mm::heap;
use crate::mm::vas::AddrSpaceMgr;
use crate::plugins::fs::RamFs;
use crate::plugins::{self, display};
use crate::process::{AppArea, UserApp};
use crate::state::{install_global, Kernel};

const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36D7_6289;

// Multiboot2 header + boot stack + entry shim.
global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8
mb2_header_start:
    .long 0xe85250d6                                    // magic
    .long 0                                             // architecture: i386
    .long mb2_header_end - mb2_header_start             // header length
    .long -(0xe85250d6 + 0 + (mb2_header_end - mb2_header_start))
    // end tag
    .word 0
    .word 0
    .long 8
mb2_header_end:

.section .bss
.align 16
boot_stack_bottom:
    .skip 16384
boot_stack_top:

.section .text
.global _start
_start:
    mov esp, offset boot_stack_top
    push ebx
    push eax
    call kernel_entry
5:  hlt
    jmp 5b
"#
);

extern "C" {
    /// End of the loaded kernel image (from the linker script).
    static __kernel_end: u8;
}

fn kernel_image_end() -> u32 {
    // SAFETY: taking the address of a linker symbol.
    let end = unsafe { &__kernel_end as *const u8 as u32 };
    end.div_ceil(FRAME_SIZE as u32) * FRAME_SIZE as u32
}

/// Highest usable RAM address below the kernel-area window, from the
/// Multiboot2 memory map.
fn usable_ram_top(boot_info: &BootInformation) -> u32 {
    let mut top = 0u64;
    if let Some(map) = boot_info.memory_map_tag() {
        for area in map.memory_areas() {
            // Only plain available RAM; typed value 1 in the wire format.
            if area.typ() == multiboot2::MemoryAreaType::Available.into() {
                top = top.max(area.end_address());
            }
        }
    }
    top.min(KERNEL_AREA_END as u64) as u32
}

fn enable_paging(cr3: u32) {
    // SAFETY: the directory identity-maps the whole kernel area, so the
    // instruction stream stays mapped across the switch.
    unsafe {
        core::arch::asm!(
            "mov cr3, {cr3}",
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            cr3 = in(reg) cr3,
            tmp = out(reg) _,
        );
    }
}

/// The built-in init image: a flat-binary idle loop that sleeps in a
/// syscall loop until a real init is exec'd over it.
///
/// ```text
/// b8 01 01 00 00    mov eax, SCID_THREAD_SLEEP
/// b9 64 00 00 00    mov ecx, 100
/// cd 30             int 48
/// eb f2             jmp back to the top
/// ```
const INIT_CODE: [u8; 14] = [
    0xB8, 0x01, 0x01, 0x00, 0x00, //
    0xB9, 0x64, 0x00, 0x00, 0x00, //
    0xCD, 0x30, //
    0xEB, 0xF2, //
];

fn init_app() -> UserApp {
    UserApp {
        areas: alloc::vec![AppArea {
            occupied: true,
            writable: false,
            load_vaddr: crate::mm::layout::APP_AREA_START,
            area_size: FRAME_SIZE as u32,
            given: INIT_CODE.to_vec(),
        }],
        entry: crate::mm::layout::APP_AREA_START,
    }
}

fn init_args() -> Vec<u8> {
    // One argument, "init", at offset 8 past the two offset words.
    let mut block = Vec::new();
    block.extend_from_slice(&8u32.to_le_bytes());
    block.extend_from_slice(&0u32.to_le_bytes());
    block.extend_from_slice(b"init\0");
    block
}

#[no_mangle]
extern "C" fn kernel_entry(magic: u32, info_addr: u32) -> ! {
    serial::init();
    crate::logger::init();
    vga::clear();
    crate::println!("bracken kernel starting");

    if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
        panic!("bad multiboot2 magic {magic:#010x}");
    }

    gdt::init();
    idt::init();
    pic::remap();
    pic::unmask(0);
    pic::unmask(1);

    // SAFETY: the loader guarantees EBX points at a valid, 8-byte-aligned
    // boot information structure.
    let boot_info =
        unsafe { BootInformation::load(info_addr as *const BootInformationHeader) }
            .expect("unreadable multiboot2 info");

    if let Some(fb) = boot_info.framebuffer_tag().and_then(Result::ok) {
        log::info!(
            "framebuffer: {}x{} bpp {} pitch {} at {:#x}",
            fb.width(),
            fb.height(),
            fb.bpp(),
            fb.pitch(),
            fb.address()
        );
    }

    // Heap first: the frame allocator's state lives on it.
    // SAFETY: the heap region is identity-mapped RAM, initialised once.
    unsafe { heap::init_allocator() };

    let phys_base = kernel_image_end().max(0x0010_0000);
    let phys_end = usable_ram_top(&boot_info);
    assert!(
        phys_base < KERNEL_HEAP_START && phys_end >= KERNEL_HEAP_END,
        "need RAM covering {KERNEL_HEAP_START:#x}..{KERNEL_HEAP_END:#x}, have {phys_base:#x}..{phys_end:#x}"
    );
    log::info!("physical frames: {phys_base:#010x}..{phys_end:#010x}");

    let mut ppa = FrameAllocator::new(PhysAddr::new(phys_base), PhysAddr::new(phys_end))
        .expect("frame allocator init");
    heap::reserve(&mut ppa).expect("heap reservation");

    let mm = AddrSpaceMgr::new(PhysWindow::identity(), ppa).expect("kernel address space");
    enable_paging(mm.kernel_space().cr3().as_u32());
    log::info!("paging enabled, kernel pd at {:#010x}", mm.kernel_space().cr3().as_u32());

    let mut kernel = Kernel::new(mm);
    let display_dev: Arc<Mutex<dyn display::CharDisplay>> = Arc::new(Mutex::new(vga::VgaDisplay));
    let filesys: Arc<Mutex<dyn plugins::fs::FileSys>> = Arc::new(Mutex::new(RamFs::new()));
    plugins::register_defaults(&mut kernel, display_dev, filesys).expect("plugin registration");

    kernel
        .boot_root(&init_app(), init_args())
        .expect("root process creation");

    pit::init();
    install_global(kernel);
    log::info!("entering user space");
    context::enter_user_or_idle()
}
