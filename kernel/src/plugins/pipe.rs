//! Pipe plugin.
//!
//! `open` produces a connected (read, write) handle pair over one bounded
//! byte ring. Reads and writes are non-blocking partial operations; the
//! wait hooks park the caller until the other side makes progress. Handle
//! copies made by fork share the ring (the ends are reference counted), so
//! a pipe keeps flowing across process boundaries; EOF is reported as
//! `Empty` once every write end is closed and the ring has drained.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{ErrorCode, KernelResult};
use crate::handle::{plugin_ids, HandleState, Plugin, NULL_HANDLE};
use crate::process::{ProcId, ThreadKey, WaitLocation};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;
use crate::wait::{BasicWaitQueue, NotifyMode, WaitQueue};

/// Bytes a pipe buffers before writers stall.
pub const PIPE_CAPACITY: usize = 1024;

/// Userspace plugin commands.
pub mod cmds {
    pub const OPEN: u16 = 0;
}

struct PipeCore {
    buf: VecDeque<u8>,
    readers: usize,
    writers: usize,
    read_wq: BasicWaitQueue<ThreadKey>,
    write_wq: BasicWaitQueue<ThreadKey>,
}

impl PipeCore {
    fn wake_all(queue: &mut BasicWaitQueue<ThreadKey>) -> Vec<ThreadKey> {
        queue.notify(NotifyMode::All);
        let mut woken = Vec::new();
        while let Ok(key) = queue.pop() {
            woken.push(key);
        }
        woken
    }
}

pub struct PipePlugin {
    /// Live pipes, tracked weakly so `remove_thread` can sweep their
    /// wait queues without keeping dead pipes alive.
    pipes: Vec<Weak<Mutex<PipeCore>>>,
}

impl PipePlugin {
    pub fn new() -> Self {
        Self { pipes: Vec::new() }
    }
}

impl Default for PipePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for PipePlugin {
    fn cmd(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        cmd: u16,
        args: [u32; 4],
    ) -> SyscallOutcome {
        match cmd {
            cmds::OPEN => {
                let core = Arc::new(Mutex::new(PipeCore {
                    buf: VecDeque::new(),
                    readers: 1,
                    writers: 1,
                    read_wq: BasicWaitQueue::new(),
                    write_wq: BasicWaitQueue::new(),
                }));
                self.pipes.retain(|w| w.strong_count() > 0);
                self.pipes.push(Arc::downgrade(&core));

                let read_state = Box::new(PipeReadState {
                    core: Arc::clone(&core),
                });
                let write_state = Box::new(PipeWriteState { core });

                let handles = (|| -> KernelResult<(usize, usize)> {
                    let proc = k.proc_mut(caller.pid)?;
                    let rh = proc.handles.insert(read_state)?;
                    match proc.handles.insert(write_state) {
                        Ok(wh) => Ok((rh, wh)),
                        Err(e) => {
                            proc.handles.remove(rh);
                            Err(e)
                        }
                    }
                })();

                match handles {
                    Ok((rh, wh)) => {
                        let res = k
                            .put_user_u32(caller.pid, args[0], rh as u32)
                            .and_then(|_| k.put_user_u32(caller.pid, args[1], wh as u32));
                        SyscallOutcome::of(res)
                    }
                    Err(e) => {
                        let _ = k.put_user_u32(caller.pid, args[0], NULL_HANDLE as u32);
                        let _ = k.put_user_u32(caller.pid, args[1], NULL_HANDLE as u32);
                        SyscallOutcome::ret(e)
                    }
                }
            }
            _ => SyscallOutcome::ret(ErrorCode::NotImplemented),
        }
    }

    fn remove_thread(&mut self, key: ThreadKey) {
        for weak in &self.pipes {
            if let Some(core) = weak.upgrade() {
                let mut core = core.lock();
                core.read_wq.remove(key);
                core.write_wq.remove(key);
            }
        }
    }
}

struct PipeReadState {
    core: Arc<Mutex<PipeCore>>,
}

impl HandleState for PipeReadState {
    fn copy_for(&self, _k: &mut Kernel, _dst: ProcId) -> KernelResult<Box<dyn HandleState>> {
        self.core.lock().readers += 1;
        Ok(Box::new(PipeReadState {
            core: Arc::clone(&self.core),
        }))
    }

    fn close(self: Box<Self>, k: &mut Kernel, _owner: ProcId) {
        let woken = {
            let mut core = self.core.lock();
            core.readers -= 1;
            if core.readers == 0 {
                // Writers can never make progress again.
                PipeCore::wake_all(&mut core.write_wq)
            } else {
                Vec::new()
            }
        };
        for key in woken {
            k.make_runnable(key, Some(ErrorCode::Empty.as_u32()));
        }
    }

    fn read(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        u_dst: u32,
        len: usize,
        read_ptr: u32,
    ) -> SyscallOutcome {
        let (bytes, woken) = {
            let mut core = self.core.lock();
            if core.buf.is_empty() {
                return SyscallOutcome::ret(ErrorCode::Empty);
            }
            let n = len.min(core.buf.len());
            let bytes: Vec<u8> = core.buf.drain(..n).collect();
            // Space opened up: release stalled writers.
            (bytes, PipeCore::wake_all(&mut core.write_wq))
        };
        for key in woken {
            k.make_runnable(key, Some(ErrorCode::Success.as_u32()));
        }
        let res = k
            .copy_to_proc(caller.pid, u_dst, &bytes)
            .and_then(|_| k.put_user_u32(caller.pid, read_ptr, bytes.len() as u32));
        SyscallOutcome::of(res)
    }

    fn wait_read_ready(&mut self, k: &mut Kernel, caller: ThreadKey) -> SyscallOutcome {
        {
            let mut core = self.core.lock();
            if !core.buf.is_empty() {
                return SyscallOutcome::ret(ErrorCode::Success);
            }
            if core.writers == 0 {
                return SyscallOutcome::ret(ErrorCode::Empty);
            }
            core.read_wq.enqueue(caller);
        }
        match k.block_current(WaitLocation::Plugin(plugin_ids::PIPE)) {
            Ok(_) => SyscallOutcome::Suspended,
            Err(e) => {
                self.core.lock().read_wq.remove(caller);
                SyscallOutcome::ret(e)
            }
        }
    }
}

struct PipeWriteState {
    core: Arc<Mutex<PipeCore>>,
}

impl HandleState for PipeWriteState {
    fn copy_for(&self, _k: &mut Kernel, _dst: ProcId) -> KernelResult<Box<dyn HandleState>> {
        self.core.lock().writers += 1;
        Ok(Box::new(PipeWriteState {
            core: Arc::clone(&self.core),
        }))
    }

    fn close(self: Box<Self>, k: &mut Kernel, _owner: ProcId) {
        let (woken, drained) = {
            let mut core = self.core.lock();
            core.writers -= 1;
            if core.writers == 0 {
                (PipeCore::wake_all(&mut core.read_wq), core.buf.is_empty())
            } else {
                (Vec::new(), false)
            }
        };
        // Blocked readers learn the pipe's fate: data or EOF.
        let code = if drained {
            ErrorCode::Empty
        } else {
            ErrorCode::Success
        };
        for key in woken {
            k.make_runnable(key, Some(code.as_u32()));
        }
    }

    fn write(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        u_src: u32,
        len: usize,
        written_ptr: u32,
    ) -> SyscallOutcome {
        let space = {
            let core = self.core.lock();
            if core.readers == 0 {
                return SyscallOutcome::ret(ErrorCode::Inactive);
            }
            PIPE_CAPACITY - core.buf.len()
        };
        let n = space.min(len);
        let mut buf = alloc::vec![0u8; n];
        if n > 0 {
            if let Err(e) = k.copy_from_proc(caller.pid, &mut buf, u_src) {
                return SyscallOutcome::ret(e);
            }
        }
        let woken = {
            let mut core = self.core.lock();
            core.buf.extend(buf);
            if n > 0 {
                PipeCore::wake_all(&mut core.read_wq)
            } else {
                Vec::new()
            }
        };
        for key in woken {
            k.make_runnable(key, Some(ErrorCode::Success.as_u32()));
        }
        SyscallOutcome::of(
            k.put_user_u32(caller.pid, written_ptr, n as u32),
        )
    }

    fn wait_write_ready(&mut self, k: &mut Kernel, caller: ThreadKey) -> SyscallOutcome {
        {
            let mut core = self.core.lock();
            if core.readers == 0 {
                return SyscallOutcome::ret(ErrorCode::Empty);
            }
            if core.buf.len() < PIPE_CAPACITY {
                return SyscallOutcome::ret(ErrorCode::Success);
            }
            core.write_wq.enqueue(caller);
        }
        match k.block_current(WaitLocation::Plugin(plugin_ids::PIPE)) {
            Ok(_) => SyscallOutcome::Suspended,
            Err(e) => {
                self.core.lock().write_wq.remove(caller);
                SyscallOutcome::ret(e)
            }
        }
    }
}
