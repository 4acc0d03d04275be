//! Bracken kernel library.
//!
//! A 32-bit x86 protected-mode kernel: Multiboot2 boot, per-process page
//! directories over a bounded physical range, a preemptive round-robin
//! scheduler, an `INT 48` syscall gateway, and a handle/plugin object
//! system backing the terminal, keyboard, filesystem, futex, pipe, and
//! shared-memory services.
//!
//! The crate builds two ways: for the `i686` bare-metal target (the real
//! kernel) and for the host, where `std` supplies an allocator and the
//! standard test harness drives the architecture-independent core: the
//! memory manager, scheduler, wait queues, syscalls, and plugins are all
//! plain data manipulation over an arena-backed physical window.

#![no_std]

extern crate alloc;

// Bare metal: the kernel heap is the global allocator.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
pub mod handle;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod logger;
pub mod mm;
pub mod plugins;
pub mod process;
pub mod sched;
pub mod state;
pub mod syscall;
pub mod time;
pub mod util;
pub mod wait;

#[cfg(test)]
mod integration_tests;

// Re-exports for the binary and for tests.
pub use error::{ErrorCode, KernelResult};
pub use state::Kernel;

/// Panic handler for the bare-metal build: dump to both consoles, halt.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {info}");
    println!("KERNEL PANIC: {info}");
    arch::x86::halt_forever()
}
