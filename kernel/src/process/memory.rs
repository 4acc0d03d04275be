//! The `mem_request` / `mem_return` syscalls over the free area.

use crate::error::ErrorCode;
use crate::process::ThreadKey;
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;

impl Kernel {
    /// Allocate `[s, e)` in the caller's free area. The first address that
    /// could not be given lands in `*true_e`; validation failures write
    /// nothing at all.
    pub(crate) fn sys_mem_request(
        &mut self,
        caller: ThreadKey,
        s: u32,
        e: u32,
        true_e_ptr: u32,
    ) -> SyscallOutcome {
        if true_e_ptr == 0 {
            return SyscallOutcome::ret(ErrorCode::BadArgs);
        }
        let space = match self.proc_space(caller.pid) {
            Ok(space) => space,
            Err(e) => return SyscallOutcome::ret(e),
        };
        let out = self.mm.request_user_range(space, s, e);
        match out.status {
            Err(code @ (ErrorCode::AlignError | ErrorCode::InvalidRange)) => {
                SyscallOutcome::ret(code)
            }
            Ok(()) => {
                let res = self.put_user_u32(caller.pid, true_e_ptr, out.true_end);
                SyscallOutcome::of(res)
            }
            Err(code) => {
                let _ = self.put_user_u32(caller.pid, true_e_ptr, out.true_end);
                SyscallOutcome::ret(code)
            }
        }
    }

    /// Return `[s, e)` to the kernel; malformed ranges are ignored.
    pub(crate) fn sys_mem_return(&mut self, caller: ThreadKey, s: u32, e: u32) -> SyscallOutcome {
        let space = match self.proc_space(caller.pid) {
            Ok(space) => space,
            Err(e) => return SyscallOutcome::ret(e),
        };
        self.mm.return_user_range(space, s, e);
        SyscallOutcome::ret(ErrorCode::Success)
    }
}
