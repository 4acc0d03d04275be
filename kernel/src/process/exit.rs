//! Process exit, zombies, and reaping.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{ErrorCode, KernelResult};
use crate::process::{exit_status, ProcId, ProcState, ThreadKey, SIG_CHLD};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;

impl Kernel {
    pub(crate) fn sys_proc_exit(&mut self, caller: ThreadKey, status: u32) -> SyscallOutcome {
        self.kill_process(caller.pid, status);
        SyscallOutcome::Suspended
    }

    /// Terminate a process: all threads are forcibly removed, the address
    /// space is destroyed, and the process becomes a zombie holding only
    /// its exit status and handle table. Children are re-parented to the
    /// root process; the parent is sent `CHLD` last, because delivering it
    /// may recursively kill the parent.
    pub(crate) fn kill_process(&mut self, pid: ProcId, status: u32) {
        let Ok(proc) = self.proc(pid) else { return };
        if proc.is_zombie() {
            return;
        }

        let threads: Vec<ThreadKey> = proc
            .threads
            .ids()
            .map(|tid| ThreadKey {
                pid,
                tid: crate::process::ThreadId(tid as u32),
            })
            .collect();
        for key in threads {
            self.force_remove_thread(key);
        }

        let (space, children, zombies, parent) = {
            let proc = self.proc_mut(pid).expect("process vanished mid-kill");
            proc.state = ProcState::Zombie;
            proc.exit_status = status;
            (
                proc.space.take(),
                core::mem::take(&mut proc.children),
                core::mem::take(&mut proc.zombies),
                proc.parent,
            )
        };
        if let Some(space) = space {
            self.mm.destroy_pd(space);
        }

        // Orphans (living and zombie alike) are adopted by the root.
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
                let _ = self.deliver_signal(ProcId::ROOT, SIG_CHLD);
            }
        }

        log::info!("process {pid} exited with status {status}");

        if pid == ProcId::ROOT {
            self.begin_shutdown();
            return;
        }

        // Enroll as a zombie child of the parent and notify it.
        if let Ok(parent_proc) = self.proc_mut(parent) {
            parent_proc.children.retain(|c| *c != pid);
            parent_proc.zombies.push(pid);
        }
        let _ = self.deliver_signal(parent, SIG_CHLD);
    }

    pub(crate) fn sys_proc_reap(
        &mut self,
        caller: ThreadKey,
        cpid: u32,
        rcpid_ptr: u32,
        rces_ptr: u32,
    ) -> SyscallOutcome {
        match self.reap_child(caller.pid, cpid) {
            Ok((reaped, status)) => {
                let res = self
                    .put_user_u32(caller.pid, rcpid_ptr, reaped.0)
                    .and_then(|_| self.put_user_u32(caller.pid, rces_ptr, status));
                SyscallOutcome::of(res)
            }
            Err(e) => {
                let _ = self.put_user_u32(caller.pid, rcpid_ptr, ProcId::NONE.0);
                let _ = self.put_user_u32(caller.pid, rces_ptr, exit_status::UNSET);
                SyscallOutcome::ret(e)
            }
        }
    }

    /// Find and release a zombie child. `cpid == ProcId::NONE` reaps any.
    pub(crate) fn reap_child(
        &mut self,
        parent: ProcId,
        cpid: u32,
    ) -> KernelResult<(ProcId, u32)> {
        let target = {
            let proc = self.proc(parent)?;
            if cpid == ProcId::NONE.0 {
                *proc.zombies.first().ok_or(ErrorCode::Empty)?
            } else {
                let cpid = ProcId(cpid);
                if proc.zombies.contains(&cpid) {
                    cpid
                } else if proc.children.contains(&cpid) {
                    // A living child: nothing to collect yet.
                    return Err(ErrorCode::Empty);
                } else {
                    return Err(ErrorCode::StateMismatch);
                }
            }
        };

        for id in self.plugin_ids_snapshot() {
            let _ = self.with_plugin(id, |k, plugin| plugin.on_reap_proc(k, target));
        }

        // Drop the table entry first so the id slot frees, then close the
        // surviving handle states with full kernel access.
        let mut zombie = self
            .procs
            .remove(target.as_usize())
            .ok_or(ErrorCode::InvalidIndex)?;
        let status = zombie.exit_status;
        let handle_ids: Vec<usize> = zombie.handles.ids().collect();
        for h in handle_ids {
            if let Some(state) = zombie.handles.take(h) {
                state.close(self, target);
            }
        }

        if let Ok(proc) = self.proc_mut(parent) {
            proc.zombies.retain(|z| *z != target);
        }
        Ok((target, status))
    }
}
