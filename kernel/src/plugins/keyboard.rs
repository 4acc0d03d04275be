//! Keyboard plugin.
//!
//! IRQ1 delivers raw PS/2 set-1 bytes through the privileged
//! `kernel_cmd` hook. The plugin folds the `0xE0` extended prefix into
//! 16-bit codes (`0xE000 | byte`) and writes them into a single global
//! cyclic buffer. The buffer is overwrite-on-overflow: slow readers lose
//! old codes, the plugin does not track them. Each open handle carries its
//! own read position and simply chases the global write position.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{ErrorCode, KernelResult};
use crate::handle::{plugin_ids, HandleState, Plugin, NULL_HANDLE};
use crate::process::{ProcId, ThreadKey, WaitLocation};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;
use crate::wait::{BasicWaitQueue, NotifyMode, WaitQueue};

/// Capacity of the global scan-code ring.
pub const KB_BUFFER_SIZE: usize = 128;

/// Privileged commands (from the IRQ1 action).
pub mod kernel_cmds {
    pub const KEY_EVENT: u32 = 0;
}

/// Userspace plugin commands.
pub mod cmds {
    pub const OPEN: u16 = 0;
}

/// Handle commands beyond the defaults.
pub mod hcids {
    use crate::handle::hcid::NUM_DEFAULT;

    /// Skip the handle's read position past everything already buffered.
    pub const SKIP_FWD: u16 = NUM_DEFAULT;
}

struct KbCore {
    buf: [u16; KB_BUFFER_SIZE],
    /// Next position written; reading here means "caught up".
    write_pos: usize,
    /// An `0xE0` prefix byte has been seen and not yet consumed.
    pending_ext: bool,
    /// Threads blocked waiting for a key.
    wq: BasicWaitQueue<ThreadKey>,
}

pub struct KeyboardPlugin {
    core: Arc<Mutex<KbCore>>,
}

impl KeyboardPlugin {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Mutex::new(KbCore {
                buf: [0; KB_BUFFER_SIZE],
                write_pos: 0,
                pending_ext: false,
                wq: BasicWaitQueue::new(),
            })),
        }
    }
}

impl Default for KeyboardPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for KeyboardPlugin {
    fn kernel_cmd(&mut self, k: &mut Kernel, cmd: u32, arg: u32) -> KernelResult<()> {
        if cmd != kernel_cmds::KEY_EVENT {
            return Err(ErrorCode::NotImplemented);
        }
        let byte = arg as u8;
        let woken = {
            let mut core = self.core.lock();
            if byte == 0xE0 {
                core.pending_ext = true;
                return Ok(());
            }
            let code = if core.pending_ext {
                0xE000 | byte as u16
            } else {
                byte as u16
            };
            core.pending_ext = false;
            let pos = core.write_pos;
            core.buf[pos] = code;
            core.write_pos = (pos + 1) % KB_BUFFER_SIZE;

            core.wq.notify(NotifyMode::All);
            let mut woken = Vec::new();
            while let Ok(key) = core.wq.pop() {
                woken.push(key);
            }
            woken
        };
        for key in woken {
            k.make_runnable(key, Some(ErrorCode::Success.as_u32()));
        }
        Ok(())
    }

    fn cmd(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        cmd: u16,
        args: [u32; 4],
    ) -> SyscallOutcome {
        match cmd {
            cmds::OPEN => {
                let state = Box::new(KbHandleState {
                    core: Arc::clone(&self.core),
                    pos: self.core.lock().write_pos,
                });
                let res = match k.proc_mut(caller.pid) {
                    Ok(proc) => proc.handles.insert(state),
                    Err(e) => Err(e),
                };
                match res {
                    Ok(h) => {
                        let w = k.put_user_u32(caller.pid, args[0], h as u32);
                        SyscallOutcome::of(w)
                    }
                    Err(e) => {
                        let _ = k.put_user_u32(caller.pid, args[0], NULL_HANDLE as u32);
                        SyscallOutcome::ret(e)
                    }
                }
            }
            _ => SyscallOutcome::ret(ErrorCode::NotImplemented),
        }
    }

    fn remove_thread(&mut self, key: ThreadKey) {
        self.core.lock().wq.remove(key);
    }
}

struct KbHandleState {
    core: Arc<Mutex<KbCore>>,
    /// Next ring position this handle will read.
    pos: usize,
}

impl HandleState for KbHandleState {
    fn copy_for(&self, _k: &mut Kernel, _dst: ProcId) -> KernelResult<Box<dyn HandleState>> {
        Ok(Box::new(KbHandleState {
            core: Arc::clone(&self.core),
            pos: self.pos,
        }))
    }

    fn close(self: Box<Self>, _k: &mut Kernel, _owner: ProcId) {}

    /// Drain buffered scan codes into `u_dst`.
    ///
    /// Codes are 16-bit: a `len` of 1 cannot carry even one and is
    /// rejected; higher odd lengths simply leave the last byte unused.
    fn read(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        u_dst: u32,
        len: usize,
        read_ptr: u32,
    ) -> SyscallOutcome {
        if u_dst == 0 || read_ptr == 0 || len == 1 {
            return SyscallOutcome::ret(ErrorCode::BadArgs);
        }

        let mut codes: Vec<u16> = Vec::new();
        {
            let core = self.core.lock();
            if self.pos == core.write_pos {
                return SyscallOutcome::ret(ErrorCode::Empty);
            }
            let mut to_read = len / 2;

            // The ring may wrap between this handle and the writer: first
            // the tail segment, then the head segment.
            if to_read > 0 && self.pos > core.write_pos {
                let take = (KB_BUFFER_SIZE - self.pos).min(to_read);
                codes.extend_from_slice(&core.buf[self.pos..self.pos + take]);
                self.pos = (self.pos + take) % KB_BUFFER_SIZE;
                to_read -= take;
            }
            if to_read > 0 && self.pos < core.write_pos {
                let take = (core.write_pos - self.pos).min(to_read);
                codes.extend_from_slice(&core.buf[self.pos..self.pos + take]);
                self.pos += take;
            }
        }

        let mut bytes = Vec::with_capacity(codes.len() * 2);
        for code in &codes {
            bytes.extend_from_slice(&code.to_le_bytes());
        }
        let res = k
            .copy_to_proc(caller.pid, u_dst, &bytes)
            .and_then(|_| k.put_user_u32(caller.pid, read_ptr, bytes.len() as u32));
        SyscallOutcome::of(res)
    }

    fn wait_read_ready(&mut self, k: &mut Kernel, caller: ThreadKey) -> SyscallOutcome {
        let mut core = self.core.lock();
        if self.pos != core.write_pos {
            return SyscallOutcome::ret(ErrorCode::Success);
        }
        core.wq.enqueue(caller);
        drop(core);
        match k.block_current(WaitLocation::Plugin(plugin_ids::KEYBOARD)) {
            Ok(_) => SyscallOutcome::Suspended,
            Err(e) => {
                self.core.lock().wq.remove(caller);
                SyscallOutcome::ret(e)
            }
        }
    }

    fn cmd(
        &mut self,
        _k: &mut Kernel,
        _caller: ThreadKey,
        cmd: u16,
        _args: [u32; 4],
    ) -> SyscallOutcome {
        match cmd {
            hcids::SKIP_FWD => {
                self.pos = self.core.lock().write_pos;
                SyscallOutcome::ret(ErrorCode::Success)
            }
            _ => SyscallOutcome::ret(ErrorCode::NotImplemented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_prefix_tags_the_code() {
        let plugin = KeyboardPlugin::new();
        {
            let mut core = plugin.core.lock();
            // Simulate the fold done by kernel_cmd without a Kernel.
            core.pending_ext = true;
            let code = if core.pending_ext { 0xE000 | 0x48u16 } else { 0x48 };
            core.pending_ext = false;
            let pos = core.write_pos;
            core.buf[pos] = code;
            core.write_pos = (pos + 1) % KB_BUFFER_SIZE;
        }
        let core = plugin.core.lock();
        assert_eq!(core.buf[0], 0xE048);
        assert_eq!(core.write_pos, 1);
    }
}
