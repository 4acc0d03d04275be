//! Thread syscalls: sleep, spawn, join, exit.

extern crate alloc;

use crate::config::MAX_THREADS_PER_PROC;
use crate::error::{ErrorCode, KernelResult};
use crate::mm::layout;
use crate::process::{
    exit_status, PendingOp, RegisterFrame, Thread, ThreadId, ThreadKey, ThreadState, WaitLocation,
};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;
use crate::wait::{VectorNotifyMode, WaitQueue};

/// User-mode segment selectors (GDT entries 3 and 4, RPL 3). The GDT in
/// `arch::x86::gdt` must lay its entries out to match.
pub const USER_CODE_SELECTOR: u32 = 0x1B;
pub const USER_DATA_SELECTOR: u32 = 0x23;

/// EFLAGS for a fresh user thread: reserved bit 1 plus IF.
pub const EFLAGS_USER: u32 = 0x202;

impl Kernel {
    /// Park the caller on the timed queue for at least `ticks` ticks.
    ///
    /// `sleep(0)` degenerates into a single yield: the deadline is already
    /// due, so the thread is ready before this returns and rejoins the
    /// ring at the tail.
    pub(crate) fn sys_thread_sleep(&mut self, caller: ThreadKey, ticks: u32) -> SyscallOutcome {
        let wake = self.ticks.wrapping_add(ticks);
        self.sleep_queue.enqueue(caller, wake);
        if self.block_current(WaitLocation::Sleep).is_err() {
            self.sleep_queue.remove(caller);
            return SyscallOutcome::ret(ErrorCode::Unknown);
        }
        self.drain_sleepers();
        SyscallOutcome::Suspended
    }

    /// Move every expired sleeper back onto the runnable ring.
    pub(crate) fn drain_sleepers(&mut self) {
        self.sleep_queue.notify(self.ticks);
        while let Ok(key) = self.sleep_queue.pop() {
            self.make_runnable(key, Some(ErrorCode::Success.as_u32()));
        }
    }

    /// Create a new thread entering `entry(arg)` on a fresh stack.
    pub(crate) fn sys_thread_spawn(
        &mut self,
        caller: ThreadKey,
        tid_ptr: u32,
        entry: u32,
        arg: u32,
    ) -> SyscallOutcome {
        match self.spawn_thread(caller.pid, entry, arg) {
            Ok(tid) => {
                let res = self.put_user_u32(caller.pid, tid_ptr, tid.0);
                SyscallOutcome::of(res)
            }
            Err(e) => {
                let _ = self.put_user_u32(caller.pid, tid_ptr, ThreadId::NONE.0);
                SyscallOutcome::ret(e)
            }
        }
    }

    pub(crate) fn spawn_thread(
        &mut self,
        pid: crate::process::ProcId,
        entry: u32,
        arg: u32,
    ) -> KernelResult<ThreadId> {
        let space = self.proc_space(pid)?;
        let proc = self.proc(pid)?;
        let tid = (0..MAX_THREADS_PER_PROC)
            .find(|t| !proc.threads.contains(*t))
            .ok_or(ErrorCode::NoSpace)?;

        let kstack = self.alloc_kstack()?;
        let (stack_lo, stack_hi) = layout::stack_pages(tid);
        let out = self.mm.map_range(space, stack_lo, stack_hi, true, true);
        if out.status.is_err() {
            self.mm.unmap_range(space, stack_lo, out.true_end);
            self.mm.frames_mut().free_frame(kstack);
            return Err(out.status.unwrap_err());
        }

        // Entry convention: cdecl with one argument and a null return
        // address (the userspace runtime wraps real entry functions so
        // that returning lands in `sc_thread_exit`).
        let esp = layout::stack_top(tid) - 8;
        self.mm
            .write_user_u32(space, esp, 0)
            .and_then(|_| self.mm.write_user_u32(space, esp + 4, arg))
            .map_err(|fault| fault.kind)?;

        let frame = RegisterFrame {
            eip: entry,
            cs: USER_CODE_SELECTOR,
            eflags: EFLAGS_USER,
            user_esp: esp,
            user_ss: USER_DATA_SELECTOR,
            ..RegisterFrame::default()
        };

        let tid = ThreadId(tid as u32);
        self.proc_mut(pid)?.threads.insert_at(
            tid.as_usize(),
            Thread::new(tid, frame, (stack_lo, stack_hi), kstack),
        )?;
        self.sched.enqueue(ThreadKey { pid, tid });
        Ok(tid)
    }

    /// One identity-mapped frame serving as a thread's ring-0 stack.
    pub(crate) fn alloc_kstack(&mut self) -> KernelResult<crate::mm::Frame> {
        self.mm
            .frames_mut()
            .alloc_frame(crate::mm::FrameKind::Kernel)
    }

    /// Block until a thread named in `jv` exits.
    pub(crate) fn sys_thread_join(
        &mut self,
        caller: ThreadKey,
        jv: u32,
        joined_ptr: u32,
        retval_ptr: u32,
    ) -> SyscallOutcome {
        // A join vector that can only ever match the caller would deadlock.
        if jv == 0 || jv & !(1u32 << caller.tid.0) == 0 {
            let _ = self.put_user_u32(caller.pid, joined_ptr, ThreadId::NONE.0);
            let _ = self.put_user_u32(caller.pid, retval_ptr, 0);
            return SyscallOutcome::ret(ErrorCode::BadArgs);
        }

        if let Ok(proc) = self.proc_mut(caller.pid) {
            if proc.join_queue.enqueue(caller, jv).is_err() {
                return SyscallOutcome::ret(ErrorCode::BadArgs);
            }
        }
        match self.block_current(WaitLocation::Join) {
            Ok(_) => {
                if let Ok(thread) = self.thread_mut(caller) {
                    thread.pending = PendingOp::Join {
                        joined_ptr,
                        retval_ptr,
                    };
                }
                SyscallOutcome::Suspended
            }
            Err(e) => SyscallOutcome::ret(e),
        }
    }

    pub(crate) fn sys_thread_exit(&mut self, caller: ThreadKey, retval: u32) -> SyscallOutcome {
        self.retire_thread(caller, retval);
        SyscallOutcome::Suspended
    }

    /// Voluntary thread exit: deliver the return value to at most one
    /// joiner, release the stack, and fold up the process if this was the
    /// main (or last) thread.
    pub(crate) fn retire_thread(&mut self, key: ThreadKey, retval: u32) {
        self.release_joiners(key, Ok(retval));

        self.sched.remove(key);
        let (stack, kstack) = {
            let Ok(thread) = self.thread(key) else { return };
            (thread.stack_range, thread.kstack)
        };
        if let Ok(space) = self.proc_space(key.pid) {
            self.mm.unmap_range(space, stack.0, stack.1);
        }
        self.mm.frames_mut().free_frame(kstack);
        let folded = match self.proc_mut(key.pid) {
            Ok(proc) => {
                proc.threads.remove(key.tid.as_usize());
                key.tid == ThreadId::MAIN || proc.threads.is_empty()
            }
            Err(_) => false,
        };
        if folded {
            self.kill_process(key.pid, exit_status::UNSET);
        }
    }

    /// Forced thread termination (exec replacing siblings, process kill).
    /// Joiners of the removed thread are released with `StateMismatch`.
    pub(crate) fn force_remove_thread(&mut self, key: ThreadKey) {
        let (kstack, state) = {
            let Ok(thread) = self.thread(key) else { return };
            (thread.kstack, thread.state)
        };
        if let ThreadState::Waiting(loc) = state {
            self.remove_waiting_thread(key, loc);
        }
        self.sched.remove(key);
        self.release_joiners(key, Err(ErrorCode::StateMismatch));
        self.mm.frames_mut().free_frame(kstack);
        if let Ok(proc) = self.proc_mut(key.pid) {
            proc.threads.remove(key.tid.as_usize());
        }
    }

    /// Wake the joiner (if any) parked on `key`'s tid.
    fn release_joiners(&mut self, key: ThreadKey, result: Result<u32, ErrorCode>) {
        let Ok(proc) = self.proc_mut(key.pid) else { return };
        proc.join_queue.notify(key.tid.0, VectorNotifyMode::First);
        let mut woken = alloc::vec::Vec::new();
        while let Ok((jkey, event)) = proc.join_queue.pop() {
            woken.push((jkey, event));
        }
        for (jkey, event) in woken {
            let pending = self.thread(jkey).map(|t| t.pending).unwrap_or(PendingOp::None);
            if let PendingOp::Join {
                joined_ptr,
                retval_ptr,
            } = pending
            {
                let (code, joined, rv) = match result {
                    Ok(rv) => (ErrorCode::Success, event, rv),
                    Err(e) => (e, ThreadId::NONE.0, 0),
                };
                let _ = self.put_user_u32(jkey.pid, joined_ptr, joined);
                let _ = self.put_user_u32(jkey.pid, retval_ptr, rv);
                if let Ok(thread) = self.thread_mut(jkey) {
                    thread.pending = PendingOp::None;
                }
                self.make_runnable(jkey, Some(code.as_u32()));
            } else {
                self.make_runnable(jkey, Some(ErrorCode::Unknown.as_u32()));
            }
        }
    }
}
