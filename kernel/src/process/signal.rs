//! Signals.
//!
//! A process carries two 32-bit vectors: pending and allowed. Delivering a
//! signal sets its pending bit; if the bit is allowed, one thread blocked
//! in `signal_wait` with that bit in its interest set is woken and the bit
//! is consumed. If the bit is NOT allowed, the target process is killed
//! with the `SIGNAL` exit status on the spot (the serial kernel makes this
//! indistinguishable from killing it at its next scheduling decision).

extern crate alloc;

use crate::error::{ErrorCode, KernelResult};
use crate::process::{exit_status, PendingOp, ProcId, ThreadKey, WaitLocation};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;
use crate::wait::VectorNotifyMode;

impl Kernel {
    /// Set a pending bit on `target` and wake or kill accordingly.
    pub(crate) fn deliver_signal(&mut self, target: ProcId, sid: u32) -> KernelResult<()> {
        if sid >= 32 {
            return Err(ErrorCode::BadArgs);
        }
        let bit = 1u32 << sid;
        let allowed = {
            let proc = self.proc_mut(target)?;
            if proc.is_zombie() {
                return Err(ErrorCode::InvalidIndex);
            }
            proc.sig_pending |= bit;
            proc.sig_allowed & bit != 0
        };

        if !allowed {
            self.kill_process(target, exit_status::SIGNAL);
            return Ok(());
        }

        self.wake_signal_waiters(target, sid);
        Ok(())
    }

    /// Pop the (at most one) waiter released for `sid`, consume the bit,
    /// and deliver the signal id through its out-pointer.
    fn wake_signal_waiters(&mut self, target: ProcId, sid: u32) {
        let mut woken = alloc::vec::Vec::new();
        if let Ok(proc) = self.proc_mut(target) {
            proc.sig_queue.notify(sid, VectorNotifyMode::First);
            while let Ok((key, event)) = proc.sig_queue.pop() {
                proc.sig_pending &= !(1u32 << event);
                woken.push((key, event));
            }
        }
        for (key, event) in woken {
            let pending = self.thread(key).map(|t| t.pending).unwrap_or(PendingOp::None);
            if let PendingOp::SignalWait { sid_ptr } = pending {
                let _ = self.put_user_u32(key.pid, sid_ptr, event);
                if let Ok(thread) = self.thread_mut(key) {
                    thread.pending = PendingOp::None;
                }
            }
            self.make_runnable(key, Some(ErrorCode::Success.as_u32()));
        }
    }

    pub(crate) fn sys_signal(&mut self, caller: ThreadKey, pid: u32, sid: u32) -> SyscallOutcome {
        let target = if pid == ProcId::NONE.0 {
            match self.proc(caller.pid) {
                Ok(proc) => proc.parent,
                Err(e) => return SyscallOutcome::ret(e),
            }
        } else {
            ProcId(pid)
        };
        let killed_self = target == caller.pid;
        let res = self.deliver_signal(target, sid);
        // Signalling yourself with a disallowed signal consumes the caller.
        if killed_self && res.is_ok() && self.thread(caller).is_err() {
            return SyscallOutcome::Suspended;
        }
        SyscallOutcome::of(res)
    }

    /// Replace the allowed mask, returning the previous one in `eax`. If
    /// any pending signal is now disallowed, the process exits.
    pub(crate) fn sys_signal_allow(&mut self, caller: ThreadKey, sv: u32) -> SyscallOutcome {
        let (old, doomed) = match self.proc_mut(caller.pid) {
            Ok(proc) => {
                let old = proc.sig_allowed;
                proc.sig_allowed = sv;
                (old, proc.sig_pending & !sv != 0)
            }
            Err(e) => return SyscallOutcome::ret(e),
        };
        if doomed {
            self.kill_process(caller.pid, exit_status::SIGNAL);
            return SyscallOutcome::Suspended;
        }
        SyscallOutcome::Return(old)
    }

    /// Wait for any signal in `sv`. Returns immediately if one is already
    /// pending; the delivered bit is cleared either way.
    pub(crate) fn sys_signal_wait(
        &mut self,
        caller: ThreadKey,
        sv: u32,
        sid_ptr: u32,
    ) -> SyscallOutcome {
        if sv == 0 {
            let _ = self.put_user_u32(caller.pid, sid_ptr, 32);
            return SyscallOutcome::ret(ErrorCode::BadArgs);
        }

        let ready = match self.proc_mut(caller.pid) {
            Ok(proc) => {
                let hits = proc.sig_pending & sv;
                if hits != 0 {
                    let sid = hits.trailing_zeros();
                    proc.sig_pending &= !(1u32 << sid);
                    Some(sid)
                } else {
                    None
                }
            }
            Err(e) => return SyscallOutcome::ret(e),
        };

        if let Some(sid) = ready {
            let res = self.put_user_u32(caller.pid, sid_ptr, sid);
            return SyscallOutcome::of(res);
        }

        if let Ok(proc) = self.proc_mut(caller.pid) {
            if proc.sig_queue.enqueue(caller, sv).is_err() {
                return SyscallOutcome::ret(ErrorCode::BadArgs);
            }
        }
        match self.block_current(WaitLocation::Signal) {
            Ok(_) => {
                if let Ok(thread) = self.thread_mut(caller) {
                    thread.pending = PendingOp::SignalWait { sid_ptr };
                }
                SyscallOutcome::Suspended
            }
            Err(e) => SyscallOutcome::ret(e),
        }
    }

    pub(crate) fn sys_signal_clear(&mut self, caller: ThreadKey, sv: u32) -> SyscallOutcome {
        match self.proc_mut(caller.pid) {
            Ok(proc) => {
                proc.sig_pending &= !sv;
                SyscallOutcome::ret(ErrorCode::Success)
            }
            Err(e) => SyscallOutcome::ret(e),
        }
    }
}
