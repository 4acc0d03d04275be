//! The Task State Segment.
//!
//! Only `SS0`/`ESP0` matter: the CPU reads them on every ring-3-to-ring-0
//! transition to find the kernel stack. The scheduler points `ESP0` at
//! the chosen thread's kernel stack on every switch.

use core::cell::UnsafeCell;

/// 32-bit TSS image. Field order is hardware ABI.
#[repr(C, packed)]
pub struct Tss {
    prev_task: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldtr: u32,
    iopb: u32,
}

pub const LIMIT: u32 = (core::mem::size_of::<Tss>() - 1) as u32;

struct TssCell(UnsafeCell<Tss>);

// SAFETY: mutated only with interrupts disabled on a single CPU.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(Tss {
    prev_task: 0,
    esp0: 0,
    ss0: super::gdt::KERNEL_DATA_SELECTOR as u32,
    esp1: 0,
    ss1: 0,
    esp2: 0,
    ss2: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
    es: 0,
    cs: 0,
    ss: 0,
    ds: 0,
    fs: 0,
    gs: 0,
    ldtr: 0,
    // The I/O-map base lives in the high word; pointing it past the
    // limit means "no bitmap".
    iopb: (core::mem::size_of::<Tss>() as u32) << 16,
}));

pub fn base_addr() -> u32 {
    TSS.0.get() as u32
}

/// Point the ring-0 stack at `esp0` for the next user-mode entry.
pub fn set_esp0(esp0: u32) {
    // SAFETY: single CPU, interrupts disabled in every kernel path that
    // calls this; the CPU itself only reads the TSS during transitions.
    unsafe {
        (*TSS.0.get()).esp0 = esp0;
    }
}
