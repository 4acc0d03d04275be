//! The handle / plugin object system.
//!
//! A handle is a per-process integer slot holding a capability object (a
//! [`HandleState`] trait object) supplied by a plugin or kernel subsystem.
//! A plugin is a globally registered service with system-wide hooks. The
//! syscall dispatcher routes `01`-category ids through handle states and
//! `10`-category ids through plugin `cmd` hooks.
//!
//! Dispatch uses take-call-reinstall: the trait object is moved out of its
//! table slot, the hook runs with full `&mut Kernel` access, and the object
//! is put back unless it closed itself. Hooks therefore never alias the
//! table entry they live in, and everything they reference across kernel
//! structures is an id.

extern crate alloc;

use alloc::boxed::Box;

use crate::config::MAX_HANDLES_PER_PROC;
use crate::error::{ErrorCode, KernelResult};
use crate::process::{ProcId, ThreadKey};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;
use crate::util::id_table::IdTable;

/// The "no handle" sentinel handed across the syscall ABI.
pub const NULL_HANDLE: usize = MAX_HANDLES_PER_PROC;

/// Default handle command ids, understood for every handle.
pub mod hcid {
    pub const CLOSE: u16 = 0;
    pub const WAIT_WRITE_READY: u16 = 1;
    pub const WRITE: u16 = 2;
    pub const WAIT_READ_READY: u16 = 3;
    pub const READ: u16 = 4;
    pub const IS_DISPLAY: u16 = 5;

    /// Plugin-specific handle commands start here.
    pub const NUM_DEFAULT: u16 = 6;
}

/// Well-known plugin ids.
pub mod plugin_ids {
    pub const FUTEX: u32 = 0;
    pub const FILE_SYS: u32 = 1;
    pub const KEYBOARD: u32 = 2;
    pub const DISPLAY: u32 = 3;
    pub const PIPE: u32 = 4;
    pub const SHM: u32 = 5;
}

/// A capability object behind one handle slot.
///
/// Every hook except `copy_for` and `close` has a default that implements
/// the "hook absent" behaviour: writes succeed consuming nothing, reads
/// report `Empty`, waits return immediately, commands are unimplemented.
/// `Send` because the owning process table sits behind the global kernel
/// cell.
pub trait HandleState: Send {
    /// Deep copy for `fork`. The copy belongs to `dst` and must be
    /// independent of the original wherever the underlying object allows
    /// (stream positions are per-handle; a pipe's buffer is shared by its
    /// nature).
    fn copy_for(&self, k: &mut Kernel, dst: ProcId) -> KernelResult<Box<dyn HandleState>>;

    /// Release the underlying resources. The slot is already free.
    fn close(self: Box<Self>, k: &mut Kernel, owner: ProcId);

    /// Non-blocking write of `len` bytes from `u_src` in the caller's
    /// space; the amount consumed is stored through `written_ptr`.
    fn write(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        _u_src: u32,
        _len: usize,
        written_ptr: u32,
    ) -> SyscallOutcome {
        match k.put_user_u32(caller.pid, written_ptr, 0) {
            Ok(()) => SyscallOutcome::ret(ErrorCode::Success),
            Err(e) => SyscallOutcome::ret(e),
        }
    }

    /// Block until the next `write` will make progress.
    fn wait_write_ready(&mut self, _k: &mut Kernel, _caller: ThreadKey) -> SyscallOutcome {
        SyscallOutcome::ret(ErrorCode::Success)
    }

    /// Non-blocking read into `u_dst`; the amount produced is stored
    /// through `read_ptr`. `Empty` when nothing is available.
    fn read(
        &mut self,
        _k: &mut Kernel,
        _caller: ThreadKey,
        _u_dst: u32,
        _len: usize,
        _read_ptr: u32,
    ) -> SyscallOutcome {
        SyscallOutcome::ret(ErrorCode::Empty)
    }

    /// Block until data is available (`Success`) or no more data can ever
    /// arrive (`Empty`).
    fn wait_read_ready(&mut self, _k: &mut Kernel, _caller: ThreadKey) -> SyscallOutcome {
        SyscallOutcome::ret(ErrorCode::Success)
    }

    /// Handle-specific command (`hcid::NUM_DEFAULT` and up).
    fn cmd(
        &mut self,
        _k: &mut Kernel,
        _caller: ThreadKey,
        _cmd: u16,
        _args: [u32; 4],
    ) -> SyscallOutcome {
        SyscallOutcome::ret(ErrorCode::NotImplemented)
    }

    /// Whether this handle fronts a character display.
    fn is_display(&self) -> bool {
        false
    }
}

/// Per-process handle table. Allocation yields the smallest free index.
pub type HandleTable = IdTable<Box<dyn HandleState>>;

/// A globally registered service module.
///
/// All hooks are optional; the defaults do nothing (or report
/// `NotImplemented` where a result is expected). `Send` because the
/// registry sits behind the global kernel cell.
pub trait Plugin: Send {
    /// Privileged command from inside the kernel (e.g. the keyboard IRQ).
    fn kernel_cmd(&mut self, _k: &mut Kernel, _cmd: u32, _arg: u32) -> KernelResult<()> {
        Err(ErrorCode::NotImplemented)
    }

    /// Command from userspace (`10`-category syscall).
    fn cmd(
        &mut self,
        _k: &mut Kernel,
        _caller: ThreadKey,
        _cmd: u16,
        _args: [u32; 4],
    ) -> SyscallOutcome {
        SyscallOutcome::ret(ErrorCode::NotImplemented)
    }

    /// Invoked on every timer tick.
    fn tick(&mut self, _k: &mut Kernel) {}

    /// A fork created `child` from `parent`. Failing vetoes the fork; the
    /// kernel unwinds already-notified plugins with `on_reap_proc(child)`.
    fn on_fork_proc(&mut self, _k: &mut Kernel, _parent: ProcId, _child: ProcId) -> KernelResult<()> {
        Ok(())
    }

    /// `pid` is replacing its image via exec.
    fn on_reset_proc(&mut self, _k: &mut Kernel, _pid: ProcId) {}

    /// `pid` has been reaped; drop any per-process state.
    fn on_reap_proc(&mut self, _k: &mut Kernel, _pid: ProcId) {}

    /// The system is going down.
    fn on_shutdown(&mut self, _k: &mut Kernel) {}

    /// Remove every reference to a forcefully terminated thread from the
    /// plugin's wait queues. Must be idempotent.
    fn remove_thread(&mut self, _key: ThreadKey) {}
}
