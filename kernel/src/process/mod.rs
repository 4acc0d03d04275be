//! Processes and threads.
//!
//! Entities only: the lifecycle operations (fork, exit, exec, signals,
//! thread management) are `impl Kernel` blocks in the sibling files, since
//! they all cut across the scheduler, the address-space manager, and the
//! plugin registry. Cross-references between processes and threads are
//! always ids, never pointers; a stale id fails lookup instead of dangling.

mod exec;
mod exit;
mod fork;
mod memory;
mod signal;
pub(crate) mod threads;

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use crate::config::{MAX_HANDLES_PER_PROC, MAX_PROCS, MAX_THREADS_PER_PROC};
use crate::handle::HandleTable;
use crate::mm::AddressSpace;
use crate::util::id_table::IdTable;
use crate::wait::VectorWaitQueue;

pub use exec::{AppArea, UserApp, MAX_APP_AREAS};

/// Signal id of the only special signal: sent to a parent when a child
/// process exits.
pub const SIG_CHLD: u32 = 0;

/// Globally unique process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcId(pub u32);

impl ProcId {
    pub const ROOT: ProcId = ProcId(0);

    /// The "no process" sentinel handed across the syscall ABI.
    pub const NONE: ProcId = ProcId(MAX_PROCS as u32);

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId {
    pub const MAIN: ThreadId = ThreadId(0);

    /// The "no thread" sentinel handed across the syscall ABI.
    pub const NONE: ThreadId = ThreadId(MAX_THREADS_PER_PROC as u32);

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global name of one thread; what wait queues and the scheduler ring hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadKey {
    pub pid: ProcId,
    pub tid: ThreadId,
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.tid)
    }
}

/// Process exit statuses with kernel-assigned meaning. Values above
/// `Signal` are user-defined.
pub mod exit_status {
    pub const SUCCESS: u32 = 0;
    pub const UNSET: u32 = 1;
    pub const FAILURE: u32 = 2;
    /// Killed by a general protection fault.
    pub const GPF: u32 = 3;
    /// Killed by a page fault.
    pub const PF: u32 = 4;
    /// Killed by a disallowed signal.
    pub const SIGNAL: u32 = 5;
}

/// The saved user-mode register file of a thread.
///
/// Layout is ABI: the interrupt trampolines fill it with `pusha` order
/// followed by the CPU-pushed `iret` frame, and the context-switch exit
/// sequence consumes it in the same order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterFrame {
    // pusha order (esp_dummy is the slot pusha stores but popa ignores)
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // iret frame from ring 3
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

impl RegisterFrame {
    /// Const-context form of `Default::default()`.
    pub const ZERO: RegisterFrame = RegisterFrame {
        edi: 0,
        esi: 0,
        ebp: 0,
        esp_dummy: 0,
        ebx: 0,
        edx: 0,
        ecx: 0,
        eax: 0,
        eip: 0,
        cs: 0,
        eflags: 0,
        user_esp: 0,
        user_ss: 0,
    };
}

/// Where a waiting thread is parked, so forced termination can find and
/// remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitLocation {
    /// The kernel's timed sleep queue.
    Sleep,
    /// The owning process's join queue.
    Join,
    /// The owning process's signal queue.
    Signal,
    /// A wait queue owned by the given plugin.
    Plugin(u32),
}

/// Kernel-side bookkeeping for a blocked syscall that must write results
/// through user out-pointers when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    None,
    Join { joined_ptr: u32, retval_ptr: u32 },
    SignalWait { sid_ptr: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Waiting(WaitLocation),
}

pub struct Thread {
    pub tid: ThreadId,
    pub frame: RegisterFrame,
    pub state: ThreadState,
    /// Demand-mapped user stack page range (freed when the thread exits).
    pub stack_range: (u32, u32),
    /// Kernel stack frame; TSS.ESP0 points at its top while this thread
    /// runs. Identity-mapped, so the top is `base + FRAME_SIZE`.
    pub kstack: crate::mm::Frame,
    pub pending: PendingOp,
}

impl Thread {
    pub fn new(
        tid: ThreadId,
        frame: RegisterFrame,
        stack_range: (u32, u32),
        kstack: crate::mm::Frame,
    ) -> Self {
        Self {
            tid,
            frame,
            state: ThreadState::Runnable,
            stack_range,
            kstack,
            pending: PendingOp::None,
        }
    }

    /// Ring-0 stack pointer loaded into TSS.ESP0 for this thread.
    pub fn kstack_top(&self) -> u32 {
        self.kstack.base().as_u32() + crate::mm::FRAME_SIZE as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    /// All threads gone; only the exit status and handle table remain
    /// until a reap collects them.
    Zombie,
}

pub struct Process {
    pub pid: ProcId,
    /// Rewritten to the root process when the parent dies first.
    pub parent: ProcId,
    pub state: ProcState,
    pub exit_status: u32,
    /// `None` once the process is a zombie.
    pub space: Option<AddressSpace>,
    pub threads: IdTable<Thread>,
    /// Living children pids.
    pub children: Vec<ProcId>,
    /// Exited-but-unreaped children pids.
    pub zombies: Vec<ProcId>,
    pub sig_pending: u32,
    pub sig_allowed: u32,
    /// Threads of this process blocked in `signal_wait`.
    pub sig_queue: VectorWaitQueue<ThreadKey>,
    /// Threads of this process blocked in `thread_join`, keyed by tid set.
    pub join_queue: VectorWaitQueue<ThreadKey>,
    pub handles: HandleTable,
    /// Default I/O handle indices (preserved across exec).
    pub in_handle: Option<usize>,
    pub out_handle: Option<usize>,
}

impl Process {
    pub fn new(pid: ProcId, parent: ProcId, space: AddressSpace) -> Self {
        Self {
            pid,
            parent,
            state: ProcState::Alive,
            exit_status: exit_status::UNSET,
            space: Some(space),
            threads: IdTable::new(MAX_THREADS_PER_PROC),
            children: Vec::new(),
            zombies: Vec::new(),
            sig_pending: 0,
            sig_allowed: 0,
            sig_queue: VectorWaitQueue::new(),
            join_queue: VectorWaitQueue::new(),
            handles: HandleTable::new(MAX_HANDLES_PER_PROC),
            in_handle: None,
            out_handle: None,
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcState::Zombie
    }
}
