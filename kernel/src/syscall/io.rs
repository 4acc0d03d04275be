//! Handle operations and the default I/O syscalls.
//!
//! All six default handle capabilities funnel through [`Kernel::run_handle_op`],
//! which moves the handle state out of its slot, runs the hook, and puts it
//! back (unless the operation was a close). The default-I/O family is the
//! same machinery aimed at the process's remembered in/out handle indices.

use crate::error::ErrorCode;
use crate::handle::NULL_HANDLE;
use crate::process::ThreadKey;
use crate::state::Kernel;
use crate::syscall::{HandleOp, SyscallOutcome};

impl Kernel {
    pub(crate) fn run_handle_op(
        &mut self,
        caller: ThreadKey,
        h: usize,
        op: HandleOp,
        args: [u32; 4],
    ) -> SyscallOutcome {
        // Length validation up front for the data-moving operations.
        if matches!(op, HandleOp::Write | HandleOp::Read) && args[1] == 0 {
            return SyscallOutcome::ret(ErrorCode::BadArgs);
        }

        let Ok(proc) = self.proc_mut(caller.pid) else {
            return SyscallOutcome::ret(ErrorCode::InvalidIndex);
        };
        let Some(mut state) = proc.handles.take(h) else {
            return SyscallOutcome::ret(ErrorCode::InvalidIndex);
        };

        // Close consumes the state; everything else hands it back.
        if op == HandleOp::Close {
            state.close(self, caller.pid);
            return SyscallOutcome::ret(ErrorCode::Success);
        }

        let outcome = match op {
            HandleOp::WaitWriteReady => state.wait_write_ready(self, caller),
            HandleOp::Write => state.write(self, caller, args[0], args[1] as usize, args[2]),
            HandleOp::WaitReadReady => state.wait_read_ready(self, caller),
            HandleOp::Read => state.read(self, caller, args[0], args[1] as usize, args[2]),
            HandleOp::IsDisplay => {
                if state.is_display() {
                    SyscallOutcome::ret(ErrorCode::Success)
                } else {
                    SyscallOutcome::ret(ErrorCode::StateMismatch)
                }
            }
            HandleOp::Cmd(cmd) => state.cmd(self, caller, cmd, args),
            HandleOp::Close => unreachable!(),
        };

        if let Ok(proc) = self.proc_mut(caller.pid) {
            proc.handles
                .insert_at(h, state)
                .expect("handle slot vanished during hook");
        }
        outcome
    }

    // -----------------------------------------------------------------
    // Default I/O family
    // -----------------------------------------------------------------

    pub(crate) fn sys_set_in_handle(&mut self, caller: ThreadKey, h: u32) -> SyscallOutcome {
        let Ok(proc) = self.proc_mut(caller.pid) else {
            return SyscallOutcome::ret(ErrorCode::InvalidIndex);
        };
        proc.in_handle = proc.handles.contains(h as usize).then_some(h as usize);
        SyscallOutcome::ret(ErrorCode::Success)
    }

    pub(crate) fn sys_get_in_handle(&mut self, caller: ThreadKey) -> SyscallOutcome {
        match self.proc(caller.pid) {
            Ok(proc) => SyscallOutcome::Return(proc.in_handle.unwrap_or(NULL_HANDLE) as u32),
            Err(e) => SyscallOutcome::ret(e),
        }
    }

    pub(crate) fn sys_set_out_handle(&mut self, caller: ThreadKey, h: u32) -> SyscallOutcome {
        let Ok(proc) = self.proc_mut(caller.pid) else {
            return SyscallOutcome::ret(ErrorCode::InvalidIndex);
        };
        proc.out_handle = proc.handles.contains(h as usize).then_some(h as usize);
        SyscallOutcome::ret(ErrorCode::Success)
    }

    pub(crate) fn sys_get_out_handle(&mut self, caller: ThreadKey) -> SyscallOutcome {
        match self.proc(caller.pid) {
            Ok(proc) => SyscallOutcome::Return(proc.out_handle.unwrap_or(NULL_HANDLE) as u32),
            Err(e) => SyscallOutcome::ret(e),
        }
    }

    /// Read via the default input handle; `Empty` when none is set.
    pub(crate) fn sys_in_read(&mut self, caller: ThreadKey, args: [u32; 4]) -> SyscallOutcome {
        match self.proc(caller.pid).ok().and_then(|p| p.in_handle) {
            Some(h) => self.run_handle_op(caller, h, HandleOp::Read, args),
            None => SyscallOutcome::ret(ErrorCode::Empty),
        }
    }

    pub(crate) fn sys_in_wait(&mut self, caller: ThreadKey) -> SyscallOutcome {
        match self.proc(caller.pid).ok().and_then(|p| p.in_handle) {
            Some(h) => self.run_handle_op(caller, h, HandleOp::WaitReadReady, [0; 4]),
            None => SyscallOutcome::ret(ErrorCode::Empty),
        }
    }

    /// Write via the default output handle; with none set, the write
    /// behaves as if every byte were consumed.
    pub(crate) fn sys_out_write(&mut self, caller: ThreadKey, args: [u32; 4]) -> SyscallOutcome {
        match self.proc(caller.pid).ok().and_then(|p| p.out_handle) {
            Some(h) => self.run_handle_op(caller, h, HandleOp::Write, args),
            None => match self.put_user_u32(caller.pid, args[2], args[1]) {
                Ok(()) => SyscallOutcome::ret(ErrorCode::Success),
                Err(e) => SyscallOutcome::ret(e),
            },
        }
    }

    pub(crate) fn sys_out_wait(&mut self, caller: ThreadKey) -> SyscallOutcome {
        match self.proc(caller.pid).ok().and_then(|p| p.out_handle) {
            Some(h) => self.run_handle_op(caller, h, HandleOp::WaitWriteReady, [0; 4]),
            None => SyscallOutcome::ret(ErrorCode::Success),
        }
    }
}
