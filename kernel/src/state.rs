//! The kernel aggregate.
//!
//! Everything the interrupt and syscall paths touch hangs off one
//! [`Kernel`] value: the address-space manager, the process table, the
//! scheduler ring, the sleep queue, and the plugin registry. On bare metal
//! a single instance is built during boot and parked in a global cell; the
//! trampolines reach it through [`with_kernel`]. Host tests build private
//! instances instead and drive them directly, which is why nothing in here
//! depends on the architecture layer.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::config::{MAX_PLUGINS, MAX_PROCS};
use crate::error::{ErrorCode, KernelResult};
use crate::handle::Plugin;
use crate::mm::{AddrSpaceMgr, AddressSpace};
use crate::process::{Process, ProcId, Thread, ThreadKey, ThreadState, WaitLocation};
use crate::sched::Scheduler;
use crate::util::id_table::IdTable;
use crate::wait::{TimedWaitQueue, WaitQueue};

pub struct Kernel {
    pub mm: AddrSpaceMgr,
    pub procs: IdTable<Process>,
    pub sched: Scheduler,
    /// Threads parked by `thread_sleep`, keyed by absolute wake tick.
    pub sleep_queue: TimedWaitQueue<ThreadKey>,
    pub plugins: IdTable<Box<dyn Plugin>>,
    /// Monotonic (wrapping) tick counter advanced by the timer interrupt.
    pub ticks: u32,
    pub shutdown: bool,
}

impl Kernel {
    pub fn new(mm: AddrSpaceMgr) -> Self {
        Self {
            mm,
            procs: IdTable::new(MAX_PROCS),
            sched: Scheduler::new(),
            sleep_queue: TimedWaitQueue::new(),
            plugins: IdTable::new(MAX_PLUGINS),
            ticks: 0,
            shutdown: false,
        }
    }

    // -----------------------------------------------------------------
    // Lookup helpers
    // -----------------------------------------------------------------

    pub fn proc(&self, pid: ProcId) -> KernelResult<&Process> {
        self.procs.get(pid.as_usize()).ok_or(ErrorCode::InvalidIndex)
    }

    pub fn proc_mut(&mut self, pid: ProcId) -> KernelResult<&mut Process> {
        self.procs
            .get_mut(pid.as_usize())
            .ok_or(ErrorCode::InvalidIndex)
    }

    pub fn thread(&self, key: ThreadKey) -> KernelResult<&Thread> {
        self.proc(key.pid)?
            .threads
            .get(key.tid.as_usize())
            .ok_or(ErrorCode::InvalidIndex)
    }

    pub fn thread_mut(&mut self, key: ThreadKey) -> KernelResult<&mut Thread> {
        self.proc_mut(key.pid)?
            .threads
            .get_mut(key.tid.as_usize())
            .ok_or(ErrorCode::InvalidIndex)
    }

    /// The thread owning the CPU right now.
    pub fn current_key(&self) -> KernelResult<ThreadKey> {
        self.sched.current().ok_or(ErrorCode::Unknown)
    }

    /// Address space of a live process.
    pub fn proc_space(&self, pid: ProcId) -> KernelResult<AddressSpace> {
        self.proc(pid)?.space.ok_or(ErrorCode::Inactive)
    }

    // -----------------------------------------------------------------
    // User-space access shorthands
    // -----------------------------------------------------------------

    /// Write a `u32` through an optional user out-pointer (0 means the
    /// caller did not supply one).
    pub fn put_user_u32(&self, pid: ProcId, ptr: u32, value: u32) -> KernelResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        let space = self.proc_space(pid)?;
        self.mm
            .write_user_u32(space, ptr, value)
            .map_err(|fault| fault.kind)
    }

    pub fn get_user_u32(&self, pid: ProcId, ptr: u32) -> KernelResult<u32> {
        let space = self.proc_space(pid)?;
        self.mm.read_user_u32(space, ptr).map_err(|fault| fault.kind)
    }

    pub fn copy_to_proc(&self, pid: ProcId, u_dst: u32, bytes: &[u8]) -> KernelResult<()> {
        let space = self.proc_space(pid)?;
        self.mm
            .copy_to_user(space, u_dst, bytes)
            .map_err(|fault| fault.kind)
    }

    pub fn copy_from_proc(&self, pid: ProcId, buf: &mut [u8], u_src: u32) -> KernelResult<()> {
        let space = self.proc_space(pid)?;
        self.mm
            .copy_from_user(space, buf, u_src)
            .map_err(|fault| fault.kind)
    }

    // -----------------------------------------------------------------
    // Blocking and waking
    // -----------------------------------------------------------------

    /// Transition the current thread to waiting. The caller is responsible
    /// for having parked the key on the queue `loc` names.
    pub fn block_current(&mut self, loc: WaitLocation) -> KernelResult<ThreadKey> {
        let key = self.current_key()?;
        self.sched.remove(key);
        self.thread_mut(key)?.state = ThreadState::Waiting(loc);
        Ok(key)
    }

    /// Make a (possibly stale) thread key runnable again, optionally
    /// supplying the syscall return value that lands in its `eax`.
    ///
    /// Stale keys are ignored: a thread can die between being notified on
    /// a queue and being popped from it.
    pub fn make_runnable(&mut self, key: ThreadKey, ret: Option<u32>) {
        let Ok(thread) = self.thread_mut(key) else {
            return;
        };
        if thread.state == ThreadState::Runnable {
            return;
        }
        thread.state = ThreadState::Runnable;
        if let Some(val) = ret {
            thread.frame.eax = val;
        }
        self.sched.enqueue(key);
    }

    /// Patch the saved `eax` of a parked thread (return-value delivery for
    /// a wake-up path that follows later).
    pub fn set_thread_return(&mut self, key: ThreadKey, value: u32) {
        if let Ok(thread) = self.thread_mut(key) {
            thread.frame.eax = value;
        }
    }

    /// Remove a waiting thread from whichever queue holds it. Idempotent.
    pub fn remove_waiting_thread(&mut self, key: ThreadKey, loc: WaitLocation) {
        match loc {
            WaitLocation::Sleep => self.sleep_queue.remove(key),
            WaitLocation::Join => {
                if let Ok(proc) = self.proc_mut(key.pid) {
                    proc.join_queue.remove(key);
                }
            }
            WaitLocation::Signal => {
                if let Ok(proc) = self.proc_mut(key.pid) {
                    proc.sig_queue.remove(key);
                }
            }
            WaitLocation::Plugin(plugin_id) => {
                if let Some(plugin) = self.plugins.get_mut(plugin_id as usize) {
                    plugin.remove_thread(key);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Context-switch support
    // -----------------------------------------------------------------

    /// Stash the interrupted user register frame into the thread slot of
    /// whoever owns the CPU (step 1 of the switch protocol).
    pub fn save_current_frame(&mut self, frame: crate::process::RegisterFrame) {
        if let Ok(key) = self.current_key() {
            if let Ok(thread) = self.thread_mut(key) {
                thread.frame = frame;
            }
        }
    }

    /// `(cr3, frame, esp0)` of the ring head, for `switch_k2u`.
    pub fn prepare_switch(&self) -> Option<(u32, crate::process::RegisterFrame, u32)> {
        let key = self.sched.current()?;
        let space = self.proc(key.pid).ok()?.space?;
        let thread = self.thread(key).ok()?;
        Some((space.cr3().as_u32(), thread.frame, thread.kstack_top()))
    }

    // -----------------------------------------------------------------
    // Plugin registry
    // -----------------------------------------------------------------

    pub fn register_plugin(&mut self, id: u32, plugin: Box<dyn Plugin>) -> KernelResult<()> {
        self.plugins.insert_at(id as usize, plugin)
    }

    /// Run a plugin hook with the plugin temporarily out of its slot.
    pub fn with_plugin<R>(
        &mut self,
        id: u32,
        f: impl FnOnce(&mut Kernel, &mut dyn Plugin) -> R,
    ) -> KernelResult<R> {
        let mut plugin = self
            .plugins
            .take(id as usize)
            .ok_or(ErrorCode::InvalidIndex)?;
        let result = f(self, plugin.as_mut());
        self.plugins
            .insert_at(id as usize, plugin)
            .expect("plugin slot vanished during hook");
        Ok(result)
    }

    /// Privileged plugin entry used by interrupt handlers.
    pub fn plugin_kernel_cmd(&mut self, id: u32, cmd: u32, arg: u32) -> KernelResult<()> {
        self.with_plugin(id, |k, plugin| plugin.kernel_cmd(k, cmd, arg))?
    }

    /// Registered plugin ids, for hooks that fan out to every plugin.
    pub fn plugin_ids_snapshot(&self) -> Vec<u32> {
        self.plugins.ids().map(|id| id as u32).collect()
    }

    /// Orderly shutdown: every plugin's `on_shutdown` hook, then halt (the
    /// flag is what host tests observe; bare metal parks the CPU).
    pub fn begin_shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        log::warn!("kernel: shutting down");
        for id in self.plugin_ids_snapshot() {
            let _ = self.with_plugin(id, |k, plugin| plugin.on_shutdown(k));
        }
    }
}

// ---------------------------------------------------------------------
// The global cell (bare metal only uses this; tests build private kernels)
// ---------------------------------------------------------------------

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Park the boot-built kernel in the global cell. Call exactly once.
pub fn install_global(kernel: Kernel) {
    let mut installed = false;
    KERNEL.call_once(|| {
        installed = true;
        Mutex::new(kernel)
    });
    assert!(installed, "kernel installed twice");
}

/// Run `f` against the global kernel. Interrupt and syscall paths enter
/// here; they execute serially with interrupts disabled, so the lock is
/// uncontended by construction.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let cell = KERNEL.get().expect("kernel not installed");
    let mut guard = cell.lock();
    f(&mut guard)
}
