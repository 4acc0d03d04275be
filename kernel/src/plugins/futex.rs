//! Futex plugin.
//!
//! Userspace builds its locks from `cmp_xchg` plus this plugin's
//! wait/wake pair. Registration is per process, keyed by the futex's user
//! address; each registered futex owns one FIFO wait queue. `wait`
//! re-reads the futex word through the caller's page directory and only
//! parks the thread when the value still matches the expected one, which
//! closes the lost-wake race against a concurrent `cmp_xchg`.

extern crate alloc;

use alloc::collections::BTreeMap;

use crate::error::ErrorCode;
use crate::handle::{plugin_ids, Plugin};
use crate::process::{ProcId, ThreadKey, WaitLocation};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;
use crate::wait::{BasicWaitQueue, NotifyMode, WaitQueue};

/// Plugin command ids (ABI).
pub mod cmds {
    pub const REGISTER: u16 = 0;
    pub const DEREGISTER: u16 = 1;
    pub const WAIT: u16 = 2;
    pub const WAKE: u16 = 3;
}

type FutexTable = BTreeMap<u32, BasicWaitQueue<ThreadKey>>;

#[derive(Default)]
pub struct FutexPlugin {
    /// Per-process registries: pid -> futex vaddr -> waiters.
    tables: BTreeMap<u32, FutexTable>,
}

impl FutexPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, pid: ProcId, uaddr: u32) -> ErrorCode {
        if uaddr % 4 != 0 {
            return ErrorCode::AlignError;
        }
        let table = self.tables.entry(pid.0).or_default();
        if table.contains_key(&uaddr) {
            return ErrorCode::InUse;
        }
        table.insert(uaddr, BasicWaitQueue::new());
        ErrorCode::Success
    }

    fn deregister(&mut self, k: &mut Kernel, pid: ProcId, uaddr: u32) -> ErrorCode {
        let Some(table) = self.tables.get_mut(&pid.0) else {
            return ErrorCode::InvalidIndex;
        };
        let Some(mut queue) = table.remove(&uaddr) else {
            return ErrorCode::InvalidIndex;
        };
        // Waiters on a dying futex are woken with `Inactive`.
        queue.notify(NotifyMode::All);
        while let Ok(key) = queue.pop() {
            k.make_runnable(key, Some(ErrorCode::Inactive.as_u32()));
        }
        ErrorCode::Success
    }

    fn wait(&mut self, k: &mut Kernel, caller: ThreadKey, uaddr: u32, expected: u32) -> SyscallOutcome {
        let Some(table) = self.tables.get_mut(&caller.pid.0) else {
            return SyscallOutcome::ret(ErrorCode::InvalidIndex);
        };
        if !table.contains_key(&uaddr) {
            return SyscallOutcome::ret(ErrorCode::InvalidIndex);
        }
        let current = match k.get_user_u32(caller.pid, uaddr) {
            Ok(v) => v,
            Err(e) => return SyscallOutcome::ret(e),
        };
        if current != expected {
            // The word moved before we could park: no wait happens.
            return SyscallOutcome::ret(ErrorCode::Success);
        }
        let queue = table.get_mut(&uaddr).expect("futex queue vanished");
        queue.enqueue(caller);
        match k.block_current(WaitLocation::Plugin(plugin_ids::FUTEX)) {
            Ok(_) => SyscallOutcome::Suspended,
            Err(e) => {
                queue.remove(caller);
                SyscallOutcome::ret(e)
            }
        }
    }

    fn wake(&mut self, k: &mut Kernel, pid: ProcId, uaddr: u32, all: bool) -> ErrorCode {
        let Some(queue) = self
            .tables
            .get_mut(&pid.0)
            .and_then(|table| table.get_mut(&uaddr))
        else {
            return ErrorCode::InvalidIndex;
        };
        queue.notify(if all { NotifyMode::All } else { NotifyMode::Next });
        let mut woken = alloc::vec::Vec::new();
        while let Ok(key) = queue.pop() {
            woken.push(key);
        }
        for key in woken {
            k.make_runnable(key, Some(ErrorCode::Success.as_u32()));
        }
        ErrorCode::Success
    }
}

impl Plugin for FutexPlugin {
    fn cmd(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        cmd: u16,
        args: [u32; 4],
    ) -> SyscallOutcome {
        match cmd {
            cmds::REGISTER => SyscallOutcome::ret(self.register(caller.pid, args[0])),
            cmds::DEREGISTER => SyscallOutcome::ret(self.deregister(k, caller.pid, args[0])),
            cmds::WAIT => self.wait(k, caller, args[0], args[1]),
            cmds::WAKE => SyscallOutcome::ret(self.wake(k, caller.pid, args[0], args[1] != 0)),
            _ => SyscallOutcome::ret(ErrorCode::NotImplemented),
        }
    }

    fn on_reset_proc(&mut self, _k: &mut Kernel, pid: ProcId) {
        self.tables.remove(&pid.0);
    }

    fn on_reap_proc(&mut self, _k: &mut Kernel, pid: ProcId) {
        self.tables.remove(&pid.0);
    }

    fn remove_thread(&mut self, key: ThreadKey) {
        if let Some(table) = self.tables.get_mut(&key.pid.0) {
            for queue in table.values_mut() {
                queue.remove(key);
            }
        }
    }
}
