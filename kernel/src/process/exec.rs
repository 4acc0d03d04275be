//! Exec: replacing a process image.
//!
//! The new image is described by a `UserApp` record (up to ten area
//! descriptors plus an entry point). Everything fallible (copying the
//! descriptors, the area payloads, and the args block out of the caller,
//! then building the complete replacement address space) happens before
//! any old state is touched, so a failed exec leaves the caller exactly as
//! it was. The commit step is infallible: siblings die, non-default
//! handles close, children are re-parented to the root, the old directory
//! is destroyed, and a fresh thread 0 starts at the image entry with
//! argc/argv pointing into the rewritten args block.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{ErrorCode, KernelResult};
use crate::mm::layout::{self, APP_AREA_END, APP_AREA_START, ARGS_AREA_END, ARGS_AREA_START};
use crate::mm::{AddressSpace, FRAME_SIZE};
use crate::process::threads::{EFLAGS_USER, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::process::{ProcId, RegisterFrame, Thread, ThreadId, ThreadKey};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;

pub const MAX_APP_AREAS: usize = 10;

/// One loadable area of a user application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppArea {
    pub occupied: bool,
    pub writable: bool,
    pub load_vaddr: u32,
    pub area_size: u32,
    /// Initial bytes for the front of the area; the rest is zero-filled.
    pub given: Vec<u8>,
}

/// A kernel-side application image, ready to be stamped into a directory.
#[derive(Debug, Clone, Default)]
pub struct UserApp {
    pub areas: Vec<AppArea>,
    pub entry: u32,
}

/// Wire size of the userspace `user_app` record: ten area descriptors of
/// six little-endian `u32`s, then the entry point.
const USER_APP_DESC_SIZE: usize = MAX_APP_AREAS * 24 + 4;

fn word(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

impl Kernel {
    pub(crate) fn sys_proc_exec(
        &mut self,
        caller: ThreadKey,
        ua_ptr: u32,
        block_ptr: u32,
        block_size: u32,
    ) -> SyscallOutcome {
        let app = match self.read_user_app(caller.pid, ua_ptr) {
            Ok(app) => app,
            Err(e) => return SyscallOutcome::ret(e),
        };
        let args_block = {
            if block_size as usize > (ARGS_AREA_END - ARGS_AREA_START) as usize {
                return SyscallOutcome::ret(ErrorCode::InvalidRange);
            }
            let mut block = alloc::vec![0u8; block_size as usize];
            if block_size > 0 {
                if let Err(e) = self.copy_from_proc(caller.pid, &mut block, block_ptr) {
                    return SyscallOutcome::ret(e);
                }
            }
            block
        };

        match self.exec_process(caller, &app, args_block) {
            Ok(()) => SyscallOutcome::Suspended,
            Err(e) => SyscallOutcome::ret(e),
        }
    }

    /// Fetch and validate a `user_app` record plus its area payloads.
    fn read_user_app(&mut self, pid: ProcId, ua_ptr: u32) -> KernelResult<UserApp> {
        let mut desc = [0u8; USER_APP_DESC_SIZE];
        self.copy_from_proc(pid, &mut desc, ua_ptr)?;

        let mut app = UserApp {
            areas: Vec::new(),
            entry: word(&desc, MAX_APP_AREAS * 24),
        };
        for i in 0..MAX_APP_AREAS {
            let base = i * 24;
            if word(&desc, base) == 0 {
                continue;
            }
            let area_size = word(&desc, base + 12);
            let given_ptr = word(&desc, base + 16);
            let given_size = word(&desc, base + 20) as usize;
            let mut area = AppArea {
                occupied: true,
                writable: word(&desc, base + 4) != 0,
                load_vaddr: word(&desc, base + 8),
                area_size,
                given: alloc::vec![0u8; given_size],
            };
            if given_size > 0 {
                self.copy_from_proc(pid, &mut area.given, given_ptr)?;
            }
            app.areas.push(area);
        }
        validate_app(&app)?;
        Ok(app)
    }

    /// Build the replacement space, then atomically swap it in.
    pub(crate) fn exec_process(
        &mut self,
        caller: ThreadKey,
        app: &UserApp,
        mut args_block: Vec<u8>,
    ) -> KernelResult<()> {
        let pid = caller.pid;
        rewrite_args_block(&mut args_block)?;

        // Phase 1 (fallible): the complete new world on the side.
        let new_space = self.create_image_space(app, &args_block)?;
        let frame = match self.build_main_frame(new_space, app.entry, &args_block) {
            Ok(frame) => frame,
            Err(e) => {
                self.mm.destroy_pd(new_space);
                return Err(e);
            }
        };
        let kstack = match self.alloc_kstack() {
            Ok(f) => f,
            Err(e) => {
                self.mm.destroy_pd(new_space);
                return Err(e);
            }
        };

        // Phase 2 (infallible): dismantle the old process identity,
        // the caller included.
        let tids: Vec<usize> = self.proc(pid)?.threads.ids().collect();
        for tid in tids {
            self.force_remove_thread(ThreadKey {
                pid,
                tid: ThreadId(tid as u32),
            });
        }

        for id in self.plugin_ids_snapshot() {
            let _ = self.with_plugin(id, |k, p| p.on_reset_proc(k, pid));
        }

        // Close everything but the default I/O handle states.
        let (keep_in, keep_out) = {
            let proc = self.proc(pid)?;
            (proc.in_handle, proc.out_handle)
        };
        let handle_ids: Vec<usize> = self.proc(pid)?.handles.ids().collect();
        for h in handle_ids {
            if Some(h) == keep_in || Some(h) == keep_out {
                continue;
            }
            if let Some(state) = self.proc_mut(pid)?.handles.take(h) {
                state.close(self, pid);
            }
        }

        // Children (living and zombie) are adopted by the root.
        let (children, zombies) = {
            let proc = self.proc_mut(pid)?;
            (
                core::mem::take(&mut proc.children),
                core::mem::take(&mut proc.zombies),
            )
        };
        for child in &children {
            if let Ok(c) = self.proc_mut(*child) {
                c.parent = ProcId::ROOT;
            }
        }
        if pid != ProcId::ROOT {
            if let Ok(root) = self.proc_mut(ProcId::ROOT) {
                root.children.extend(children);
                root.zombies.extend(zombies.iter().copied());
            }
            if !zombies.is_empty() {
                let _ = self.deliver_signal(ProcId::ROOT, crate::process::SIG_CHLD);
            }
        }

        let old_space = {
            let proc = self.proc_mut(pid)?;
            proc.sig_pending = 0;
            proc.sig_allowed = 0;
            proc.space.replace(new_space)
        };
        if let Some(old) = old_space {
            self.mm.destroy_pd(old);
        }

        // A fresh thread 0 at the image entry.
        let (stack_lo, stack_hi) = layout::stack_pages(ThreadId::MAIN.as_usize());
        self.proc_mut(pid)?.threads.insert_at(
            ThreadId::MAIN.as_usize(),
            Thread::new(ThreadId::MAIN, frame, (stack_lo, stack_hi), kstack),
        )?;
        self.sched.enqueue(ThreadKey {
            pid,
            tid: ThreadId::MAIN,
        });
        log::info!("exec: process {pid} entering {:#010x}", app.entry);
        Ok(())
    }

    /// Map and fill a fresh directory with the image and args block.
    fn create_image_space(&mut self, app: &UserApp, args_block: &[u8]) -> KernelResult<AddressSpace> {
        let space = self.mm.create_user_pd()?;
        match self.populate_image(space, app, args_block) {
            Ok(()) => Ok(space),
            Err(e) => {
                self.mm.destroy_pd(space);
                Err(e)
            }
        }
    }

    fn populate_image(
        &mut self,
        space: AddressSpace,
        app: &UserApp,
        args_block: &[u8],
    ) -> KernelResult<()> {
        for area in &app.areas {
            let start = area.load_vaddr;
            let end = page_round_up(start + area.area_size);
            let out = self.mm.map_range(space, start, end, true, true);
            out.status?;
            if !area.given.is_empty() {
                self.mm
                    .copy_to_user(space, start, &area.given)
                    .map_err(|fault| fault.kind)?;
            }
            if !area.writable {
                self.mm.protect_range(space, start, end, false);
            }
        }

        // The args block always gets at least one page so argv is mapped.
        let args_end = page_round_up(ARGS_AREA_START + (args_block.len() as u32).max(4));
        let out = self.mm.map_range(space, ARGS_AREA_START, args_end, true, true);
        out.status?;
        if !args_block.is_empty() {
            self.mm
                .copy_to_user(space, ARGS_AREA_START, args_block)
                .map_err(|fault| fault.kind)?;
        }
        Ok(())
    }

    /// Map thread 0's stack and build its entry frame:
    /// `main(argc, argv)` with a null return address.
    fn build_main_frame(
        &mut self,
        space: AddressSpace,
        entry: u32,
        args_block: &[u8],
    ) -> KernelResult<RegisterFrame> {
        let (stack_lo, stack_hi) = layout::stack_pages(ThreadId::MAIN.as_usize());
        let out = self.mm.map_range(space, stack_lo, stack_hi, true, true);
        out.status?;

        let argc = count_args(args_block);
        let esp = layout::stack_top(ThreadId::MAIN.as_usize()) - 12;
        self.mm
            .write_user_u32(space, esp, 0)
            .and_then(|_| self.mm.write_user_u32(space, esp + 4, argc))
            .and_then(|_| self.mm.write_user_u32(space, esp + 8, ARGS_AREA_START))
            .map_err(|fault| fault.kind)?;

        Ok(RegisterFrame {
            eip: entry,
            cs: USER_CODE_SELECTOR,
            eflags: EFLAGS_USER,
            user_esp: esp,
            user_ss: USER_DATA_SELECTOR,
            ..RegisterFrame::default()
        })
    }

    /// Construct process 0 at boot and schedule its main thread.
    pub fn boot_root(&mut self, app: &UserApp, mut args_block: Vec<u8>) -> KernelResult<()> {
        validate_app(app)?;
        rewrite_args_block(&mut args_block)?;

        let space = self.create_image_space(app, &args_block)?;
        let frame = match self.build_main_frame(space, app.entry, &args_block) {
            Ok(frame) => frame,
            Err(e) => {
                self.mm.destroy_pd(space);
                return Err(e);
            }
        };
        let kstack = match self.alloc_kstack() {
            Ok(f) => f,
            Err(e) => {
                self.mm.destroy_pd(space);
                return Err(e);
            }
        };

        let mut root = crate::process::Process::new(ProcId::ROOT, ProcId::ROOT, space);
        let (stack_lo, stack_hi) = layout::stack_pages(ThreadId::MAIN.as_usize());
        root.threads.insert_at(
            ThreadId::MAIN.as_usize(),
            Thread::new(ThreadId::MAIN, frame, (stack_lo, stack_hi), kstack),
        )?;
        self.procs.insert_at(ProcId::ROOT.as_usize(), root)?;
        self.sched.enqueue(ThreadKey {
            pid: ProcId::ROOT,
            tid: ThreadId::MAIN,
        });
        log::info!("root process created, entry {:#010x}", app.entry);
        Ok(())
    }

}

fn page_round_up(addr: u32) -> u32 {
    addr.div_ceil(FRAME_SIZE as u32) * FRAME_SIZE as u32
}

fn validate_app(app: &UserApp) -> KernelResult<()> {
    if app.areas.len() > MAX_APP_AREAS {
        return Err(ErrorCode::BadArgs);
    }
    for area in &app.areas {
        if !area.occupied {
            return Err(ErrorCode::BadArgs);
        }
        if area.load_vaddr % FRAME_SIZE as u32 != 0 {
            return Err(ErrorCode::AlignError);
        }
        let end = area.load_vaddr.checked_add(area.area_size).ok_or(ErrorCode::InvalidRange)?;
        if area.load_vaddr < APP_AREA_START || end > APP_AREA_END || area.area_size == 0 {
            return Err(ErrorCode::InvalidRange);
        }
        if area.given.len() > area.area_size as usize {
            return Err(ErrorCode::InvalidRange);
        }
    }
    Ok(())
}

/// Rewrite the leading offset table in place: each non-zero `u32` becomes
/// the absolute address the string will have once the block sits at
/// `ARGS_AREA_START`. The zero terminator stays zero (a null `argv` end).
fn rewrite_args_block(block: &mut [u8]) -> KernelResult<()> {
    let mut at = 0usize;
    loop {
        if block.is_empty() {
            return Ok(());
        }
        if at + 4 > block.len() {
            return Err(ErrorCode::BadArgs);
        }
        let off = word(block, at);
        if off == 0 {
            return Ok(());
        }
        if off as usize >= block.len() {
            return Err(ErrorCode::InvalidRange);
        }
        let abs = ARGS_AREA_START
            .checked_add(off)
            .ok_or(ErrorCode::InvalidRange)?;
        block[at..at + 4].copy_from_slice(&abs.to_le_bytes());
        at += 4;
    }
}

/// Number of argv entries ahead of the zero terminator.
fn count_args(block: &[u8]) -> u32 {
    let mut argc = 0;
    let mut at = 0;
    while at + 4 <= block.len() && word(block, at) != 0 {
        argc += 1;
        at += 4;
    }
    argc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_rewrite_matches_wire_example() {
        // The canonical block: two args at offsets 0x0C and 0x11.
        let mut block = alloc::vec![
            0x0C, 0, 0, 0, //
            0x11, 0, 0, 0, //
            0, 0, 0, 0, //
        ];
        block.extend_from_slice(b"arg1\0arg2\0");
        rewrite_args_block(&mut block).unwrap();

        assert_eq!(word(&block, 0), ARGS_AREA_START + 0x0C);
        assert_eq!(word(&block, 4), ARGS_AREA_START + 0x11);
        assert_eq!(word(&block, 8), 0);
        assert_eq!(count_args(&block), 2);
        assert_eq!(&block[0x0C..0x10], b"arg1");
        assert_eq!(&block[0x11..0x15], b"arg2");
    }

    #[test]
    fn empty_block_means_no_args() {
        let mut block = alloc::vec![];
        rewrite_args_block(&mut block).unwrap();
        assert_eq!(count_args(&block), 0);
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let mut block = alloc::vec![0xFF, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(rewrite_args_block(&mut block), Err(ErrorCode::InvalidRange));
    }
}
