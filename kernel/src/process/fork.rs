//! Fork.
//!
//! Fork clones the caller's address space eagerly (identical and
//! independent user memory), copies *only the calling thread* into thread
//! 0 of the child, deep-copies every handle state through its copy hook,
//! and starts the child with cleared signal vectors and no multithreading
//! state. Both sides return `Success`; the out-pointer distinguishes them
//! (child pid in the parent, the null pid in the child).

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{ErrorCode, KernelResult};
use crate::process::{Process, ProcId, Thread, ThreadId, ThreadKey};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;

impl Kernel {
    pub(crate) fn sys_proc_fork(&mut self, caller: ThreadKey, cpid_ptr: u32) -> SyscallOutcome {
        match self.fork_process(caller) {
            Ok(child) => {
                let res = self
                    .put_user_u32(caller.pid, cpid_ptr, child.0)
                    .and_then(|_| self.put_user_u32(child, cpid_ptr, ProcId::NONE.0));
                SyscallOutcome::of(res)
            }
            Err(e) => {
                let _ = self.put_user_u32(caller.pid, cpid_ptr, ProcId::NONE.0);
                SyscallOutcome::ret(e)
            }
        }
    }

    pub(crate) fn fork_process(&mut self, caller: ThreadKey) -> KernelResult<ProcId> {
        let parent = caller.pid;
        let parent_space = self.proc_space(parent)?;

        // Claim the child's id slot first; it is the scarcest resource.
        let child_slot = (0..self.procs.capacity())
            .find(|slot| !self.procs.contains(*slot))
            .ok_or(ErrorCode::NoSpace)?;
        let child = ProcId(child_slot as u32);

        let child_space = self.mm.clone_user(parent_space)?;
        let mut child_proc = Process::new(child, parent, child_space);

        // Deep-copy the handle table through each state's copy hook.
        let handle_ids: Vec<usize> = self.proc(parent)?.handles.ids().collect();
        let mut copies = Vec::new();
        for h in handle_ids {
            let copied = {
                let Some(state) = self.proc_mut(parent)?.handles.take(h) else {
                    continue;
                };
                let copied = state.copy_for(self, child);
                self.proc_mut(parent)?
                    .handles
                    .insert_at(h, state)
                    .expect("handle slot vanished during fork");
                copied
            };
            match copied {
                Ok(new_state) => copies.push((h, new_state)),
                Err(e) => {
                    for (_, state) in copies {
                        state.close(self, child);
                    }
                    self.mm.destroy_pd(child_space);
                    return Err(e);
                }
            }
        }
        for (h, state) in copies {
            child_proc
                .handles
                .insert_at(h, state)
                .expect("duplicate handle index in fork copy");
        }
        let (in_h, out_h) = {
            let p = self.proc(parent)?;
            (p.in_handle, p.out_handle)
        };
        child_proc.in_handle = in_h;
        child_proc.out_handle = out_h;

        // The calling thread becomes thread 0 of the child: same saved
        // frame, same stack addresses (the clone carried the pages). The
        // child resumes out of the same syscall, so its `eax` reads
        // success directly.
        let mut frame = self.thread(caller)?.frame;
        frame.eax = ErrorCode::Success.as_u32();
        let stack_range = self.thread(caller)?.stack_range;
        let kstack = match self.alloc_kstack() {
            Ok(f) => f,
            Err(e) => {
                let ids: Vec<usize> = child_proc.handles.ids().collect();
                for h in ids {
                    if let Some(state) = child_proc.handles.take(h) {
                        state.close(self, child);
                    }
                }
                self.mm.destroy_pd(child_space);
                return Err(e);
            }
        };
        child_proc.threads.insert_at(
            ThreadId::MAIN.as_usize(),
            Thread::new(ThreadId::MAIN, frame, stack_range, kstack),
        )?;

        self.procs.insert_at(child_slot, child_proc)?;

        // Plugin fan-out; a veto unwinds the ones already notified.
        let plugin_ids = self.plugin_ids_snapshot();
        let mut notified = Vec::new();
        for id in &plugin_ids {
            let res = self.with_plugin(*id, |k, p| p.on_fork_proc(k, parent, child))?;
            match res {
                Ok(()) => notified.push(*id),
                Err(e) => {
                    for done in notified {
                        let _ = self.with_plugin(done, |k, p| p.on_reap_proc(k, child));
                    }
                    self.destroy_failed_fork(child);
                    return Err(e);
                }
            }
        }

        self.proc_mut(parent)?.children.push(child);
        self.sched.enqueue(ThreadKey {
            pid: child,
            tid: ThreadId::MAIN,
        });
        log::debug!("fork: {parent} -> {child}");
        Ok(child)
    }

    /// Dismantle a child that failed mid-fork: close its handle copies,
    /// free its thread's kernel stack, destroy its address space, release
    /// its id slot.
    fn destroy_failed_fork(&mut self, child: ProcId) {
        let Some(mut proc) = self.procs.remove(child.as_usize()) else {
            return;
        };
        let handle_ids: Vec<usize> = proc.handles.ids().collect();
        for h in handle_ids {
            if let Some(state) = proc.handles.take(h) {
                state.close(self, child);
            }
        }
        let kstacks: Vec<_> = proc.threads.iter().map(|(_, t)| t.kstack).collect();
        for kstack in kstacks {
            self.mm.frames_mut().free_frame(kstack);
        }
        if let Some(space) = proc.space.take() {
            self.mm.destroy_pd(space);
        }
    }
}
