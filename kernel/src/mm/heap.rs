//! Kernel heap bring-up.
//!
//! The heap arena is a fixed slice of the identity-mapped kernel area
//! ([`crate::mm::layout::KERNEL_HEAP_START`]). Boot hands the region to
//! the global `linked_list_allocator` first (the frame allocator itself
//! needs `alloc`), then marks the same physical range reserved so no
//! frame from it is ever handed out. Host builds use the system allocator
//! instead (see `lib.rs`), so this module is target-only.

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::error::{ErrorCode, KernelResult};
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::mm::frame_allocator::{FrameAllocator, FrameKind};
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::mm::layout::{KERNEL_HEAP_END, KERNEL_HEAP_START};
#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::mm::phys::PhysAddr;

/// Hand the heap region to the global allocator.
///
/// # Safety
/// Must run exactly once, before the first `alloc` use, with the heap
/// region backed by real identity-mapped RAM.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn init_allocator() {
    // SAFETY: caller contract.
    unsafe {
        crate::ALLOCATOR.lock().init(
            KERNEL_HEAP_START as usize as *mut u8,
            (KERNEL_HEAP_END - KERNEL_HEAP_START) as usize,
        );
    }
}

/// Mark the heap's physical range allocated so the frame allocator never
/// hands its frames out.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn reserve(ppa: &mut FrameAllocator) -> KernelResult<()> {
    let out = ppa.alloc_range(
        PhysAddr::new(KERNEL_HEAP_START),
        PhysAddr::new(KERNEL_HEAP_END),
        FrameKind::Kernel,
    );
    if out.status.is_err() {
        log::error!(
            "kernel heap reservation stopped at {:#010x}",
            out.true_end.as_u32()
        );
        return Err(ErrorCode::NoMem);
    }
    log::info!(
        "kernel heap: {:#010x}..{:#010x}",
        KERNEL_HEAP_START,
        KERNEL_HEAP_END
    );
    Ok(())
}
