//! Global Descriptor Table.
//!
//! Fixed layout, selectors baked into the rest of the kernel:
//!
//! | index | selector | descriptor |
//! |---|---|---|
//! | 0 | 0x00 | null |
//! | 1 | 0x08 | kernel code, ring 0 |
//! | 2 | 0x10 | kernel data, ring 0 |
//! | 3 | 0x1B | user code, ring 3 |
//! | 4 | 0x23 | user data, ring 3 |
//! | 5 | 0x28 | TSS |
//!
//! Descriptors are packed by explicit shift/mask; the i386 scatters base
//! and limit across the 8 bytes and a bit-field struct would not survive
//! the ABI.

use core::arch::asm;

use lazy_static::lazy_static;

use super::tss;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x1B;
pub const USER_DATA_SELECTOR: u16 = 0x23;
pub const TSS_SELECTOR: u16 = 0x28;

/// Pack a segment descriptor: 4 GiB flat unless `gran4k` is false.
fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut desc = 0u64;
    desc |= (limit & 0xFFFF) as u64; // limit 0..16
    desc |= ((base & 0xFFFF) as u64) << 16; // base 0..16
    desc |= (((base >> 16) & 0xFF) as u64) << 32; // base 16..24
    desc |= (access as u64) << 40;
    desc |= (((limit >> 16) & 0xF) as u64) << 48; // limit 16..20
    desc |= ((flags & 0xF) as u64) << 52;
    desc |= (((base >> 24) & 0xFF) as u64) << 56; // base 24..32
    desc
}

/// 4K-granular, 32-bit segment flags.
const FLAGS_FLAT32: u8 = 0xC;

lazy_static! {
    static ref GDT: [u64; 6] = [
        0,
        descriptor(0, 0xF_FFFF, 0x9A, FLAGS_FLAT32), // kernel code: P, ring0, X/R
        descriptor(0, 0xF_FFFF, 0x92, FLAGS_FLAT32), // kernel data: P, ring0, R/W
        descriptor(0, 0xF_FFFF, 0xFA, FLAGS_FLAT32), // user code: P, ring3, X/R
        descriptor(0, 0xF_FFFF, 0xF2, FLAGS_FLAT32), // user data: P, ring3, R/W
        // TSS: byte-granular, type 0x9 (available 32-bit TSS), ring 0.
        descriptor(tss::base_addr(), tss::LIMIT, 0x89, 0x0),
    ];
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Load the GDT, reload every segment register, and load the TSS.
pub fn init() {
    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[u64; 6]>() - 1) as u16,
        base: GDT.as_ptr() as u32,
    };

    // SAFETY: the GDT is a 'static table with the layout documented above;
    // the far jump reloads CS with the matching kernel code selector.
    unsafe {
        asm!(
            "lgdt [{ptr}]",
            "push {kcode}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {kdata:x}",
            "mov es, {kdata:x}",
            "mov fs, {kdata:x}",
            "mov gs, {kdata:x}",
            "mov ss, {kdata:x}",
            "ltr {tss:x}",
            ptr = in(reg) &ptr,
            kcode = const KERNEL_CODE_SELECTOR as u32,
            kdata = in(reg) KERNEL_DATA_SELECTOR as u32,
            tss = in(reg) TSS_SELECTOR,
            tmp = out(reg) _,
        );
    }
    log::info!("gdt: loaded, tss at {:#010x}", tss::base_addr());
}
