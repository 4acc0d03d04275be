//! Interrupt descriptor table and trampolines.
//!
//! Every vector funnels through one assembly tail (`isr_common`): push a
//! (vector, error-code) pair, save the register file, load kernel data
//! segments, and hand the stack frame to [`isr_dispatch`]. Dispatch never
//! returns; it finishes by switching into some user thread or idling.
//!
//! Vector map: 0..32 CPU exceptions, 32..48 remapped PIC IRQs (32 timer,
//! 33 keyboard, 39/47 spurious), 48 the syscall gate (DPL 3).

use core::arch::{asm, global_asm};
use core::cell::UnsafeCell;

use super::{context, gdt, pic, port};
use crate::handle::plugin_ids;
use crate::process::{exit_status, RegisterFrame};
use crate::plugins::keyboard::kernel_cmds;
use crate::state::with_kernel;
use crate::syscall::SyscallOutcome;

/// Vectors with trampolines (0..=48).
const NUM_STUBS: usize = 49;

// Trampolines. Exception vectors 8, 10..14 and 17 push a hardware error
// code; everyone else pushes a zero to keep the frame layout uniform.
global_asm!(
    r#"
.section .text

.irp vec, 0,1,2,3,4,5,6,7,9,15,16,18,19,20,21,22,23,24,25,26,27,28,29,30,31
.global isr_stub_\vec
isr_stub_\vec:
    push 0
    push \vec
    jmp isr_common
.endr

.irp vec, 8,10,11,12,13,14,17
.global isr_stub_\vec
isr_stub_\vec:
    push \vec
    jmp isr_common
.endr

.irp vec, 32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48
.global isr_stub_\vec
isr_stub_\vec:
    push 0
    push \vec
    jmp isr_common
.endr

isr_common:
    pusha
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call isr_dispatch
3:  hlt
    jmp 3b

.section .rodata
.global ISR_STUB_TABLE
.align 4
ISR_STUB_TABLE:
.irp vec, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48
    .long isr_stub_\vec
.endr
"#
);

extern "C" {
    static ISR_STUB_TABLE: [u32; NUM_STUBS];
}

/// What `isr_common` leaves on the kernel stack, lowest address first.
#[repr(C)]
struct IsrStack {
    // pusha order
    edi: u32,
    esi: u32,
    ebp: u32,
    esp_dummy: u32,
    ebx: u32,
    edx: u32,
    ecx: u32,
    eax: u32,
    // pushed by the stub
    vector: u32,
    err_code: u32,
    // pushed by the CPU
    eip: u32,
    cs: u32,
    eflags: u32,
    // only present on a ring-3 entry
    user_esp: u32,
    user_ss: u32,
}

impl IsrStack {
    fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    fn to_frame(&self) -> RegisterFrame {
        // The CPU only pushes SS:ESP on a privilege change; a ring-0
        // entry's stack ends at EFLAGS and those two words must not be
        // read.
        let (user_esp, user_ss) = if self.from_user() {
            (self.user_esp, self.user_ss)
        } else {
            (0, 0)
        };
        RegisterFrame {
            edi: self.edi,
            esi: self.esi,
            ebp: self.ebp,
            esp_dummy: 0,
            ebx: self.ebx,
            edx: self.edx,
            ecx: self.ecx,
            eax: self.eax,
            eip: self.eip,
            cs: self.cs,
            eflags: self.eflags,
            user_esp,
            user_ss,
        }
    }
}

/// Pack an interrupt gate: present, 32-bit, type 0xE.
fn gate(handler: u32, dpl: u8) -> u64 {
    let access = 0x8E | ((dpl as u64) << 5);
    (handler & 0xFFFF) as u64
        | (gdt::KERNEL_CODE_SELECTOR as u64) << 16
        | (access << 40)
        | ((handler >> 16) as u64) << 48
}

struct IdtCell(UnsafeCell<[u64; 256]>);

// SAFETY: written once during single-threaded boot, read-only afterwards.
unsafe impl Sync for IdtCell {}

static IDT: IdtCell = IdtCell(UnsafeCell::new([0; 256]));

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

pub fn init() {
    // SAFETY: boot is single-threaded; interrupts are still disabled.
    let idt = unsafe { &mut *IDT.0.get() };
    for (vector, entry) in idt.iter_mut().take(NUM_STUBS).enumerate() {
        // SAFETY: the table is emitted by the trampoline asm above.
        let handler = unsafe { ISR_STUB_TABLE[vector] };
        let dpl = if vector as u8 == crate::syscall::SYSCALL_VECTOR {
            3
        } else {
            0
        };
        *entry = gate(handler, dpl);
    }

    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[u64; 256]>() - 1) as u16,
        base: IDT.0.get() as u32,
    };
    // SAFETY: the IDT is 'static and fully initialised above.
    unsafe {
        asm!("lidt [{ptr}]", ptr = in(reg) &ptr);
    }
    log::info!("idt: {NUM_STUBS} vectors wired, syscall gate at 48");
}

fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: reading CR2 is side-effect free at CPL 0.
    unsafe {
        asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// The typed-action layer every trampoline lands in.
#[no_mangle]
extern "C" fn isr_dispatch(stack: &mut IsrStack) -> ! {
    let vector = stack.vector;
    let from_user = stack.from_user();
    let frame = stack.to_frame();

    // Step 1 of the switch protocol: whatever user context was running
    // is parked in its thread slot before any handler touches the
    // scheduler.
    if from_user {
        with_kernel(|k| k.save_current_frame(frame));
    }

    match vector {
        // Timer: the scheduling heartbeat.
        32 => {
            pic::eoi(0);
            with_kernel(|k| k.on_tick());
        }
        // Keyboard: feed the scancode to the keyboard plugin.
        33 => {
            // SAFETY: reading the PS/2 data port in the IRQ1 handler.
            let byte = unsafe { port::inb(0x60) };
            pic::eoi(1);
            with_kernel(|k| {
                let _ = k.plugin_kernel_cmd(
                    plugin_ids::KEYBOARD,
                    kernel_cmds::KEY_EVENT,
                    byte as u32,
                );
            });
        }
        39 => pic::ack_irq7(),
        47 => pic::ack_irq15(),
        34..=38 | 40..=46 => pic::eoi((vector - 32) as u8),

        // The syscall gate.
        48 => {
            with_kernel(|k| {
                let outcome =
                    k.dispatch_syscall(frame.eax, [frame.ecx, frame.edx, frame.esi, frame.edi]);
                if let SyscallOutcome::Return(value) = outcome {
                    if let Ok(key) = k.current_key() {
                        k.set_thread_return(key, value);
                    }
                }
            });
        }

        // CPU exceptions.
        0..=31 => {
            if !from_user {
                panic!(
                    "cpu exception {} in kernel context (err={:#x} eip={:#010x} cr2={:#010x})",
                    vector, stack.err_code, stack.eip, read_cr2()
                );
            }
            let status = if vector == 14 {
                exit_status::PF
            } else {
                exit_status::GPF
            };
            with_kernel(|k| {
                if let Ok(key) = k.current_key() {
                    log::error!(
                        "process {} killed by exception {} (eip={:#010x} cr2={:#010x})",
                        key.pid,
                        vector,
                        frame.eip,
                        read_cr2()
                    );
                    k.kill_process(key.pid, status);
                }
            });
        }

        _ => log::warn!("stray interrupt vector {vector}"),
    }

    context::enter_user_or_idle()
}
