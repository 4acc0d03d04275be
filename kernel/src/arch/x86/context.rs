//! Kernel-to-user context switch.
//!
//! The single exit gate to ring 3. The chosen thread's saved frame is
//! copied into a static staging buffer (kernel data, present in every page
//! directory), CR3 and TSS.ESP0 are switched to the thread's, and a
//! `popad`/`iretd` pair consumes the staged frame. Interrupts stay off
//! for the whole sequence; `iretd` re-enables them from the saved EFLAGS.

use core::arch::asm;
use core::cell::UnsafeCell;

use super::{gdt, tss};
use crate::process::RegisterFrame;
use crate::state::with_kernel;

struct FrameCell(UnsafeCell<RegisterFrame>);

// SAFETY: written only between `cli` and the final `iretd` on one CPU.
unsafe impl Sync for FrameCell {}

static SWITCH_FRAME: FrameCell = FrameCell(UnsafeCell::new(RegisterFrame::ZERO));

/// Resume a user thread.
///
/// # Safety
/// `cr3` must name a live page directory whose kernel area matches the
/// running kernel, and `frame` must be a well-formed ring-3 frame.
pub unsafe fn switch_k2u(cr3: u32, frame: &RegisterFrame, esp0: u32) -> ! {
    tss::set_esp0(esp0);
    // SAFETY: single writer (interrupts are disabled until iretd).
    unsafe {
        *SWITCH_FRAME.0.get() = *frame;
    }
    // SAFETY: caller contract; the staged frame lives in kernel data,
    // which is mapped identically in every directory.
    unsafe {
        asm!(
            "mov cr3, {cr3}",
            "mov ds, {udata:x}",
            "mov es, {udata:x}",
            "mov fs, {udata:x}",
            "mov gs, {udata:x}",
            "mov esp, {frame}",
            "popad",
            "iretd",
            cr3 = in(reg) cr3,
            udata = in(reg) gdt::USER_DATA_SELECTOR as u32,
            frame = in(reg) SWITCH_FRAME.0.get(),
            options(noreturn),
        )
    }
}

/// [`switch_k2u`] with the syscall return value patched into `eax` just
/// before the frame is consumed.
///
/// # Safety
/// As for [`switch_k2u`].
pub unsafe fn switch_k2u_with_ret(cr3: u32, frame: &RegisterFrame, esp0: u32, eax: u32) -> ! {
    let mut patched = *frame;
    patched.eax = eax;
    // SAFETY: forwarded caller contract.
    unsafe { switch_k2u(cr3, &patched, esp0) }
}

#[repr(align(16))]
struct IdleStack(UnsafeCell<[u8; 4096]>);

// SAFETY: used as a raw CPU stack, never accessed as a Rust value.
unsafe impl Sync for IdleStack {}

static IDLE_STACK: IdleStack = IdleStack(UnsafeCell::new([0; 4096]));

/// Park on the dedicated idle stack until an interrupt supplies work.
/// Every interrupt handler finishes by re-entering user mode or calling
/// back into this loop, so the stack resets each time around.
fn idle() -> ! {
    let top = IDLE_STACK.0.get() as u32 + 4096;
    // SAFETY: the idle stack is a dedicated static; the loop never
    // returns and every escape route re-enters through a fresh stack.
    unsafe {
        asm!(
            "mov esp, {top}",
            "2:",
            "sti",
            "hlt",
            "cli",
            "jmp 2b",
            top = in(reg) top,
            options(noreturn),
        )
    }
}

/// Leave the kernel: run the ring head, or idle until something is
/// runnable. The common tail of every interrupt and syscall path.
pub fn enter_user_or_idle() -> ! {
    let next = with_kernel(|k| {
        if k.shutdown {
            None
        } else {
            k.prepare_switch()
        }
    });
    match next {
        Some((cr3, frame, esp0)) => {
            // SAFETY: prepare_switch only yields live directories and
            // frames saved from real user entries.
            unsafe { switch_k2u(cr3, &frame, esp0) }
        }
        None => {
            if with_kernel(|k| k.shutdown) {
                log::warn!("system halted");
                super::halt_forever();
            }
            idle()
        }
    }
}
