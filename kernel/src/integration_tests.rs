//! End-to-end scenarios over a host-built kernel.
//!
//! Each test boots a private kernel over an arena-backed physical window,
//! registers the standard plugins (with the in-memory display and RAM
//! filesystem collaborators), creates a root process from a small test
//! image, and then drives the same syscall dispatcher the INT 48 gate
//! calls on real hardware. Return values are patched into the caller's
//! saved `eax` exactly the way the interrupt tail does it.

#![cfg(test)]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{MAX_HANDLES_PER_PROC, MAX_PROCS};
use crate::error::ErrorCode;
use crate::handle::plugin_ids;
use crate::mm::frame_allocator::FrameAllocator;
use crate::mm::layout::{APP_AREA_START, ARGS_AREA_START, FREE_AREA_START, SHARED_AREA_START};
use crate::mm::phys::TestArena;
use crate::mm::vas::AddrSpaceMgr;
use crate::plugins::display::BufferDisplay;
use crate::plugins::fs::{FileSys, RamFs};
use crate::plugins::{self, display, fs, futex, pipe, shm};
use crate::process::{exit_status, AppArea, ProcId, ThreadId, ThreadKey, UserApp, SIG_CHLD};
use crate::state::Kernel;
use crate::syscall::{handle_scid, plugin_scid, scid, SyscallOutcome};
use crate::handle::hcid;

/// Scratch addresses inside the boot image's writable area.
const SCRATCH: u32 = APP_AREA_START + 0x1000;
const SCRATCH2: u32 = APP_AREA_START + 0x2000;
const SCRATCH3: u32 = APP_AREA_START + 0x3000;

struct TestOs {
    // Field order matters only for drop; the arena must outlive nothing
    // (the kernel holds a raw window into it), so keep both together.
    _arena: TestArena,
    k: Kernel,
    fs: Arc<Mutex<RamFs>>,
    display: Arc<Mutex<BufferDisplay>>,
}

fn test_app() -> UserApp {
    UserApp {
        areas: alloc::vec![AppArea {
            occupied: true,
            writable: true,
            load_vaddr: APP_AREA_START,
            area_size: 4 * 0x1000,
            given: alloc::vec![0x90; 16], // nop sled stand-in for code
        }],
        entry: APP_AREA_START,
    }
}

impl TestOs {
    fn boot() -> Self {
        let arena = TestArena::new(4096).unwrap();
        let ppa = FrameAllocator::new(arena.phys_base(), arena.phys_end()).unwrap();
        let mm = AddrSpaceMgr::new(arena.window(), ppa).unwrap();
        let mut k = Kernel::new(mm);

        let fs = Arc::new(Mutex::new(RamFs::new()));
        let display = Arc::new(Mutex::new(BufferDisplay::new(40, 4)));
        let dyn_fs: Arc<Mutex<dyn FileSys>> = fs.clone();
        let dyn_display: Arc<Mutex<dyn display::CharDisplay>> = display.clone();
        plugins::register_defaults(&mut k, dyn_display, dyn_fs).unwrap();

        k.boot_root(&test_app(), Vec::new()).unwrap();
        Self {
            _arena: arena,
            k,
            fs,
            display,
        }
    }

    fn current(&self) -> ThreadKey {
        self.k.sched.current().expect("no runnable thread")
    }

    /// Dispatch a syscall as the ring head, patching `eax` the way the
    /// interrupt tail does for synchronous returns.
    fn sys(&mut self, id: u32, args: [u32; 4]) -> SyscallOutcome {
        let outcome = self.k.dispatch_syscall(id, args);
        if let SyscallOutcome::Return(value) = outcome {
            if let Ok(key) = self.k.current_key() {
                self.k.set_thread_return(key, value);
            }
        }
        outcome
    }

    fn expect_ret(&mut self, id: u32, args: [u32; 4], code: ErrorCode) {
        assert_eq!(self.sys(id, args), SyscallOutcome::Return(code.as_u32()));
    }

    fn read_u32(&self, pid: ProcId, addr: u32) -> u32 {
        self.k.get_user_u32(pid, addr).unwrap()
    }

    fn write_u32(&mut self, pid: ProcId, addr: u32, value: u32) {
        self.k.put_user_u32(pid, addr, value).unwrap()
    }

    fn write_bytes(&mut self, pid: ProcId, addr: u32, bytes: &[u8]) {
        self.k.copy_to_proc(pid, addr, bytes).unwrap()
    }

    fn read_bytes(&self, pid: ProcId, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; len];
        self.k.copy_from_proc(pid, &mut buf, addr).unwrap();
        buf
    }

    fn eax_of(&self, key: ThreadKey) -> u32 {
        self.k.thread(key).unwrap().frame.eax
    }

    fn rotate_to(&mut self, key: ThreadKey) {
        for _ in 0..self.k.sched.len() {
            if self.current() == key {
                return;
            }
            self.k.sched.rotate();
        }
        panic!("thread {key} is not runnable");
    }

    /// Fork as the current thread and return the child pid.
    fn fork(&mut self) -> ProcId {
        let caller = self.current();
        self.expect_ret(scid::PROC_FORK, [SCRATCH3, 0, 0, 0], ErrorCode::Success);
        ProcId(self.read_u32(caller.pid, SCRATCH3))
    }
}

fn key(pid: u32, tid: u32) -> ThreadKey {
    ThreadKey {
        pid: ProcId(pid),
        tid: ThreadId(tid),
    }
}

mod boot_tests {
    use super::*;

    #[test]
    fn boot_creates_root_process() {
        let os = TestOs::boot();
        assert_eq!(os.current(), key(0, 0));
        let root = os.k.proc(ProcId::ROOT).unwrap();
        assert_eq!(root.threads.len(), 1);
        let t0 = root.threads.get(0).unwrap();
        assert_eq!(t0.frame.eip, APP_AREA_START);
        // cdecl entry: [ret][argc][argv].
        assert_eq!(os.read_u32(ProcId::ROOT, t0.frame.user_esp + 8), ARGS_AREA_START);
    }

    #[test]
    fn image_bytes_are_loaded_and_writable_area_works() {
        let mut os = TestOs::boot();
        assert_eq!(os.read_bytes(ProcId::ROOT, APP_AREA_START, 4), [0x90; 4]);
        os.write_bytes(ProcId::ROOT, SCRATCH, b"ok");
        assert_eq!(os.read_bytes(ProcId::ROOT, SCRATCH, 2), b"ok");
    }
}

mod sleep_tests {
    use super::*;

    #[test]
    fn sleep_wakes_no_earlier_than_deadline() {
        let mut os = TestOs::boot();
        let t0 = os.k.now();
        assert_eq!(
            os.sys(scid::THREAD_SLEEP, [4, 0, 0, 0]),
            SyscallOutcome::Suspended
        );
        assert!(os.k.sched.is_empty());

        for _ in 0..3 {
            os.k.on_tick();
            assert!(os.k.sched.is_empty());
        }
        os.k.on_tick();
        assert_eq!(os.current(), key(0, 0));
        assert!(os.k.now() >= t0 + 4);
        assert_eq!(os.eax_of(key(0, 0)), ErrorCode::Success.as_u32());
    }

    #[test]
    fn sleep_zero_yields_once() {
        let mut os = TestOs::boot();
        // A second runnable thread to yield to.
        os.expect_ret(
            scid::THREAD_SPAWN,
            [SCRATCH, 0x0800_0004, 0, 0],
            ErrorCode::Success,
        );
        assert_eq!(
            os.sys(scid::THREAD_SLEEP, [0, 0, 0, 0]),
            SyscallOutcome::Suspended
        );
        // Ready immediately, but behind the other thread.
        let order: Vec<_> = os.k.sched.iter().collect();
        assert_eq!(order, alloc::vec![key(0, 1), key(0, 0)]);
    }
}

mod process_tests {
    use super::*;

    #[test]
    fn fork_exit_signal_wait_reap() {
        let mut os = TestOs::boot();
        // Parent must survive CHLD.
        assert_eq!(
            os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]),
            SyscallOutcome::Return(0)
        );

        let child = os.fork();
        assert_eq!(child, ProcId(1));
        // The child sees the null pid through the same pointer.
        assert_eq!(os.read_u32(child, SCRATCH3), ProcId::NONE.0);
        let ckey = key(child.0, 0);
        assert_eq!(os.eax_of(ckey), ErrorCode::Success.as_u32());

        os.rotate_to(ckey);
        assert_eq!(
            os.sys(scid::PROC_EXIT, [42, 0, 0, 0]),
            SyscallOutcome::Suspended
        );
        assert!(os.k.proc(child).unwrap().is_zombie());

        os.rotate_to(key(0, 0));
        os.expect_ret(scid::SIGNAL_WAIT, [1 << SIG_CHLD, SCRATCH, 0, 0], ErrorCode::Success);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), SIG_CHLD);

        os.expect_ret(
            scid::PROC_REAP,
            [child.0, SCRATCH, SCRATCH2, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), child.0);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 42);
        assert!(os.k.proc(child).is_err());
    }

    #[test]
    fn reap_distinguishes_living_and_foreign_children() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        let child = os.fork();

        // Living child: nothing to collect yet.
        os.expect_ret(scid::PROC_REAP, [child.0, SCRATCH, SCRATCH2, 0], ErrorCode::Empty);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), ProcId::NONE.0);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), exit_status::UNSET);

        // Not a child at all.
        os.expect_ret(scid::PROC_REAP, [17, SCRATCH, SCRATCH2, 0], ErrorCode::StateMismatch);

        // Reap-any with no zombies.
        os.expect_ret(
            scid::PROC_REAP,
            [MAX_PROCS as u32, SCRATCH, SCRATCH2, 0],
            ErrorCode::Empty,
        );
    }

    #[test]
    fn reap_releases_all_process_resources() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        let frames_before = os.k.mm.frames().free_frames();

        let child = os.fork();
        let ckey = key(child.0, 0);
        os.rotate_to(ckey);
        os.sys(scid::PROC_EXIT, [0, 0, 0, 0]);
        os.rotate_to(key(0, 0));
        os.expect_ret(
            scid::PROC_REAP,
            [child.0, 0, 0, 0],
            ErrorCode::Success,
        );

        // Every frame the fork consumed is back: directory, page tables,
        // user pages, kernel stack.
        assert_eq!(os.k.mm.frames().free_frames(), frames_before);
        // And the pid slot is reusable.
        let again = os.fork();
        assert_eq!(again, child);
    }

    #[test]
    fn disallowed_signal_kills_target() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        let child = os.fork();

        os.expect_ret(scid::SIGNAL, [child.0, 3, 0, 0], ErrorCode::Success);
        let zombie = os.k.proc(child).unwrap();
        assert!(zombie.is_zombie());
        assert_eq!(zombie.exit_status, exit_status::SIGNAL);
        // The parent was told.
        assert_eq!(os.k.proc(ProcId::ROOT).unwrap().sig_pending & 1, 1);
    }

    #[test]
    fn signal_allow_retroactively_kills() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << 4, 0, 0, 0]);
        // Signal 4 to self: allowed, stays pending.
        os.expect_ret(scid::SIGNAL, [0, 4, 0, 0], ErrorCode::Success);
        // Disallowing it now is fatal.
        assert_eq!(
            os.sys(scid::SIGNAL_ALLOW, [0, 0, 0, 0]),
            SyscallOutcome::Suspended
        );
        assert!(os.k.proc(ProcId::ROOT).unwrap().is_zombie());
        assert!(os.k.shutdown, "root death shuts the system down");
    }

    #[test]
    fn signal_wait_blocks_until_signalled() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << 5, 0, 0, 0]);
        os.expect_ret(scid::THREAD_SPAWN, [0, 0x0800_0004, 0, 0], ErrorCode::Success);

        assert_eq!(
            os.sys(scid::SIGNAL_WAIT, [1 << 5, SCRATCH, 0, 0]),
            SyscallOutcome::Suspended
        );
        assert_eq!(os.current(), key(0, 1));

        // Sibling signals the process; the waiter becomes runnable with
        // the bit consumed before anything else of the process runs.
        os.expect_ret(scid::SIGNAL, [0, 5, 0, 0], ErrorCode::Success);
        assert!(os.k.sched.contains(key(0, 0)));
        assert_eq!(os.eax_of(key(0, 0)), ErrorCode::Success.as_u32());
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), 5);
        assert_eq!(os.k.proc(ProcId::ROOT).unwrap().sig_pending & (1 << 5), 0);
    }

    #[test]
    fn signal_clear_drops_pending_bits() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [0b110, 0, 0, 0]);
        os.expect_ret(scid::SIGNAL, [0, 1, 0, 0], ErrorCode::Success);
        os.expect_ret(scid::SIGNAL, [0, 2, 0, 0], ErrorCode::Success);
        os.expect_ret(scid::SIGNAL_CLEAR, [0b010, 0, 0, 0], ErrorCode::Success);
        assert_eq!(os.k.proc(ProcId::ROOT).unwrap().sig_pending, 0b100);
    }

    #[test]
    fn user_fault_kills_only_the_faulting_process() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        let child = os.fork();
        let sibling = os.fork();

        // What the page-fault action does for a user-mode fault.
        os.k.kill_process(child, exit_status::PF);

        assert!(os.k.proc(child).unwrap().is_zombie());
        assert_eq!(os.k.proc(child).unwrap().exit_status, exit_status::PF);
        // Siblings keep running.
        assert!(os.k.sched.contains(key(sibling.0, 0)));
        assert!(os.k.sched.contains(key(0, 0)));
        // The parent eventually observes CHLD.
        os.expect_ret(scid::SIGNAL_WAIT, [1 << SIG_CHLD, SCRATCH, 0, 0], ErrorCode::Success);
    }
}

mod thread_tests {
    use super::*;

    #[test]
    fn spawn_join_exit_round_trip() {
        let mut os = TestOs::boot();
        os.expect_ret(
            scid::THREAD_SPAWN,
            [SCRATCH, 0x0800_0008, 0x1234, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), 1);
        let t1 = os.k.thread(key(0, 1)).unwrap();
        assert_eq!(t1.frame.eip, 0x0800_0008);
        // cdecl: [null return][arg].
        assert_eq!(os.read_u32(ProcId::ROOT, t1.frame.user_esp + 4), 0x1234);

        assert_eq!(
            os.sys(scid::THREAD_JOIN, [1 << 1, SCRATCH, SCRATCH2, 0]),
            SyscallOutcome::Suspended
        );

        os.rotate_to(key(0, 1));
        assert_eq!(
            os.sys(scid::THREAD_EXIT, [0xAB, 0, 0, 0]),
            SyscallOutcome::Suspended
        );

        // The joiner got the tid and return value.
        assert_eq!(os.eax_of(key(0, 0)), ErrorCode::Success.as_u32());
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), 1);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 0xAB);
        // The process survived: tid 1 was not the main thread.
        assert!(!os.k.proc(ProcId::ROOT).unwrap().is_zombie());
        assert!(os.k.proc(ProcId::ROOT).unwrap().threads.get(1).is_none());
    }

    #[test]
    fn join_on_self_only_is_rejected() {
        let mut os = TestOs::boot();
        os.expect_ret(
            scid::THREAD_JOIN,
            [1 << 0, SCRATCH, SCRATCH2, 0],
            ErrorCode::BadArgs,
        );
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), ThreadId::NONE.0);
        os.expect_ret(scid::THREAD_JOIN, [0, SCRATCH, SCRATCH2, 0], ErrorCode::BadArgs);
    }

    #[test]
    fn main_thread_exit_folds_the_process() {
        let mut os = TestOs::boot();
        os.expect_ret(scid::THREAD_SPAWN, [0, 0x0800_0004, 0, 0], ErrorCode::Success);
        assert_eq!(
            os.sys(scid::THREAD_EXIT, [0, 0, 0, 0]),
            SyscallOutcome::Suspended
        );
        // Main thread gone => whole process exits, sibling included.
        assert!(os.k.proc(ProcId::ROOT).unwrap().is_zombie());
        assert!(os.k.sched.is_empty());
    }
}

mod memory_tests {
    use super::*;

    #[test]
    fn mem_request_and_return_through_the_gate() {
        let mut os = TestOs::boot();
        let s = FREE_AREA_START;
        let e = FREE_AREA_START + 0x3000;
        os.expect_ret(scid::MEM_REQUEST, [s, e, SCRATCH, 0], ErrorCode::Success);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), e);

        os.write_bytes(ProcId::ROOT, s + 0x2FF0, b"deadbeef");
        assert_eq!(os.read_bytes(ProcId::ROOT, s + 0x2FF0, 8), b"deadbeef");

        // Requesting the same range again collides immediately.
        os.expect_ret(scid::MEM_REQUEST, [s, e, SCRATCH, 0], ErrorCode::AlreadyAllocated);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), s);

        os.expect_ret(scid::MEM_RETURN, [s, e, 0, 0], ErrorCode::Success);
        assert!(os.k.copy_from_proc(ProcId::ROOT, &mut [0u8; 1], s).is_err());
    }

    #[test]
    fn mem_request_validates_arguments() {
        let mut os = TestOs::boot();
        os.expect_ret(scid::MEM_REQUEST, [FREE_AREA_START, FREE_AREA_START + 0x1000, 0, 0], ErrorCode::BadArgs);
        os.expect_ret(
            scid::MEM_REQUEST,
            [FREE_AREA_START + 1, FREE_AREA_START + 0x1000, SCRATCH, 0],
            ErrorCode::AlignError,
        );
        os.expect_ret(
            scid::MEM_REQUEST,
            [APP_AREA_START, APP_AREA_START + 0x1000, SCRATCH, 0],
            ErrorCode::InvalidRange,
        );
    }
}

mod futex_tests {
    use super::*;

    #[test]
    fn ping_pong_wakes_match_wakers_not_waiters() {
        let mut os = TestOs::boot();
        let f = SCRATCH2;
        os.write_u32(ProcId::ROOT, f, 0);
        os.expect_ret(
            plugin_scid(plugin_ids::FUTEX, futex::cmds::REGISTER),
            [f, 0, 0, 0],
            ErrorCode::Success,
        );
        os.expect_ret(scid::THREAD_SPAWN, [0, 0x0800_0004, 0, 0], ErrorCode::Success);

        // T0's cmp_xchg(0 -> 1) succeeded elsewhere; the wait sees the
        // moved value and does not park.
        os.write_u32(ProcId::ROOT, f, 1);
        os.expect_ret(
            plugin_scid(plugin_ids::FUTEX, futex::cmds::WAIT),
            [f, 0, 0, 0],
            ErrorCode::Success,
        );

        // Now wait on the value actually stored: parks.
        assert_eq!(
            os.sys(plugin_scid(plugin_ids::FUTEX, futex::cmds::WAIT), [f, 1, 0, 0]),
            SyscallOutcome::Suspended
        );
        assert_eq!(os.current(), key(0, 1));

        // Wake one: exactly the one waiter runs again.
        os.write_u32(ProcId::ROOT, f, 0);
        os.expect_ret(
            plugin_scid(plugin_ids::FUTEX, futex::cmds::WAKE),
            [f, 0, 0, 0],
            ErrorCode::Success,
        );
        assert!(os.k.sched.contains(key(0, 0)));
        assert_eq!(os.eax_of(key(0, 0)), ErrorCode::Success.as_u32());

        // A wake with nobody parked is a no-op success.
        let len = os.k.sched.len();
        os.expect_ret(
            plugin_scid(plugin_ids::FUTEX, futex::cmds::WAKE),
            [f, 0, 0, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.k.sched.len(), len);
    }

    #[test]
    fn deregister_wakes_waiters_with_inactive() {
        let mut os = TestOs::boot();
        let f = SCRATCH2;
        os.write_u32(ProcId::ROOT, f, 7);
        os.expect_ret(
            plugin_scid(plugin_ids::FUTEX, futex::cmds::REGISTER),
            [f, 0, 0, 0],
            ErrorCode::Success,
        );
        os.expect_ret(scid::THREAD_SPAWN, [0, 0x0800_0004, 0, 0], ErrorCode::Success);

        assert_eq!(
            os.sys(plugin_scid(plugin_ids::FUTEX, futex::cmds::WAIT), [f, 7, 0, 0]),
            SyscallOutcome::Suspended
        );
        os.expect_ret(
            plugin_scid(plugin_ids::FUTEX, futex::cmds::DEREGISTER),
            [f, 0, 0, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.eax_of(key(0, 0)), ErrorCode::Inactive.as_u32());

        // Waiting on a deregistered futex fails outright.
        os.rotate_to(key(0, 1));
        os.expect_ret(
            plugin_scid(plugin_ids::FUTEX, futex::cmds::WAIT),
            [f, 7, 0, 0],
            ErrorCode::InvalidIndex,
        );
    }
}

mod exec_tests {
    use super::*;

    /// Serialize a `user_app` record into user memory the way the
    /// userspace runtime lays it out.
    fn write_user_app(os: &mut TestOs, pid: ProcId, at: u32, payload_at: u32, payload: &[u8]) {
        os.write_bytes(pid, payload_at, payload);
        let mut desc = alloc::vec![0u8; 10 * 24 + 4];
        // area 0: occupied, writable, load at APP_AREA_START, one page.
        desc[0..4].copy_from_slice(&1u32.to_le_bytes());
        desc[4..8].copy_from_slice(&1u32.to_le_bytes());
        desc[8..12].copy_from_slice(&APP_AREA_START.to_le_bytes());
        desc[12..16].copy_from_slice(&0x1000u32.to_le_bytes());
        desc[16..20].copy_from_slice(&payload_at.to_le_bytes());
        desc[20..24].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        // entry
        desc[240..244].copy_from_slice(&(APP_AREA_START + 4).to_le_bytes());
        os.write_bytes(pid, at, &desc);
    }

    #[test]
    fn exec_replaces_the_image_and_rewrites_args() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        let child = os.fork();
        let ckey = key(child.0, 0);

        // Keep a display handle as the default output: it must survive.
        os.rotate_to(ckey);
        os.expect_ret(
            plugin_scid(plugin_ids::DISPLAY, display::cmds::OPEN),
            [SCRATCH, 0, 0, 0],
            ErrorCode::Success,
        );
        let out_h = os.read_u32(child, SCRATCH);
        os.expect_ret(scid::SET_OUT_HANDLE, [out_h, 0, 0, 0], ErrorCode::Success);
        // And one doomed handle.
        os.expect_ret(
            plugin_scid(plugin_ids::DISPLAY, display::cmds::OPEN),
            [SCRATCH, 0, 0, 0],
            ErrorCode::Success,
        );

        // The §8.5 wire example.
        let mut block = alloc::vec![
            0x0C, 0, 0, 0, //
            0x11, 0, 0, 0, //
            0, 0, 0, 0, //
        ];
        block.extend_from_slice(b"arg1\0arg2\0");
        os.write_bytes(child, SCRATCH2, &block);
        write_user_app(&mut os, child, SCRATCH3, APP_AREA_START + 0x800, b"\xEB\xFE\x90\x90\x90\x90");

        assert_eq!(
            os.sys(scid::PROC_EXEC, [SCRATCH3, SCRATCH2, block.len() as u32, 0]),
            SyscallOutcome::Suspended
        );

        // A fresh thread 0 sits at the new entry.
        let t0 = os.k.thread(ckey).unwrap();
        assert_eq!(t0.frame.eip, APP_AREA_START + 4);
        // argc/argv on the stack.
        assert_eq!(os.read_u32(child, t0.frame.user_esp + 4), 2);
        assert_eq!(os.read_u32(child, t0.frame.user_esp + 8), ARGS_AREA_START);
        // Offsets rewritten to absolute pointers; terminator intact.
        assert_eq!(os.read_u32(child, ARGS_AREA_START), ARGS_AREA_START + 0x0C);
        assert_eq!(os.read_u32(child, ARGS_AREA_START + 4), ARGS_AREA_START + 0x11);
        assert_eq!(os.read_u32(child, ARGS_AREA_START + 8), 0);
        assert_eq!(os.read_bytes(child, ARGS_AREA_START + 0x0C, 4), b"arg1");
        // The new image is in place; the old scratch bytes are gone.
        assert_eq!(os.read_bytes(child, APP_AREA_START, 2), [0xEB, 0xFE]);
        assert!(os.k.copy_from_proc(child, &mut [0u8; 1], SCRATCH2).is_err());

        // Default out handle preserved, the doomed handle closed.
        let proc = os.k.proc(child).unwrap();
        assert_eq!(proc.out_handle, Some(out_h as usize));
        assert_eq!(proc.handles.len(), 1);
    }

    #[test]
    fn exec_isolation_only_new_mappings_remain() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        let child = os.fork();
        let ckey = key(child.0, 0);
        os.rotate_to(ckey);

        // Give the child extra free-area memory that exec must strip.
        os.expect_ret(
            scid::MEM_REQUEST,
            [FREE_AREA_START, FREE_AREA_START + 0x2000, SCRATCH, 0],
            ErrorCode::Success,
        );

        write_user_app(&mut os, child, SCRATCH3, APP_AREA_START + 0x800, b"\x90\x90\x90\x90\x90\x90");
        assert_eq!(
            os.sys(scid::PROC_EXEC, [SCRATCH3, 0, 0, 0]),
            SyscallOutcome::Suspended
        );

        let space = os.k.proc(child).unwrap().space.unwrap();
        for (va, _) in os.k.mm.user_mappings(space) {
            let in_image = (APP_AREA_START..APP_AREA_START + 0x1000).contains(&va);
            let in_args = (ARGS_AREA_START..ARGS_AREA_START + 0x1000).contains(&va);
            let stack = crate::mm::layout::stack_pages(0);
            let in_stack = (stack.0..stack.1).contains(&va);
            assert!(
                in_image || in_args || in_stack,
                "stale mapping at {va:#010x} survived exec"
            );
        }
    }
}

mod handle_tests {
    use super::*;

    fn open_file(os: &mut TestOs, pid: ProcId, path: &str) -> u32 {
        os.write_bytes(pid, SCRATCH, path.as_bytes());
        os.expect_ret(
            plugin_scid(plugin_ids::FILE_SYS, fs::cmds::OPEN),
            [SCRATCH, path.len() as u32, SCRATCH2, 0],
            ErrorCode::Success,
        );
        os.read_u32(pid, SCRATCH2)
    }

    #[test]
    fn handle_deep_copy_over_fork_reads_identically() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        os.fs.lock().touch("/data").unwrap();
        {
            let mut fsys = os.fs.lock();
            let id = fsys.open("/data").unwrap();
            fsys.write(id, 0, b"0123456789").unwrap();
            fsys.close(id);
        }

        let h = open_file(&mut os, ProcId::ROOT, "/data");
        // Parent consumes 3 bytes before forking.
        os.expect_ret(
            handle_scid(h as usize, hcid::READ),
            [SCRATCH, 3, SCRATCH2, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.read_bytes(ProcId::ROOT, SCRATCH, 3), b"012");

        let child = os.fork();
        let ckey = key(child.0, 0);

        // Child reads 7 from its copy.
        os.rotate_to(ckey);
        os.expect_ret(
            handle_scid(h as usize, hcid::READ),
            [SCRATCH, 7, SCRATCH2, 0],
            ErrorCode::Success,
        );
        let child_bytes = os.read_bytes(child, SCRATCH, 7);

        // Parent reads 7 from its own.
        os.rotate_to(key(0, 0));
        os.expect_ret(
            handle_scid(h as usize, hcid::READ),
            [SCRATCH, 7, SCRATCH2, 0],
            ErrorCode::Success,
        );
        let parent_bytes = os.read_bytes(ProcId::ROOT, SCRATCH, 7);

        assert_eq!(child_bytes, parent_bytes);
        assert_eq!(child_bytes, b"3456789");
    }

    #[test]
    fn default_io_family() {
        let mut os = TestOs::boot();
        // No default handles yet: the null handle comes back.
        assert_eq!(
            os.sys(scid::GET_IN_HANDLE, [0; 4]),
            SyscallOutcome::Return(MAX_HANDLES_PER_PROC as u32)
        );
        os.expect_ret(scid::IN_READ, [SCRATCH, 8, SCRATCH2, 0], ErrorCode::Empty);
        // Writes to a missing out handle pretend to succeed fully.
        os.expect_ret(scid::OUT_WRITE, [SCRATCH, 5, SCRATCH2, 0], ErrorCode::Success);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 5);

        // Wire the display as default out and write through it.
        os.expect_ret(
            plugin_scid(plugin_ids::DISPLAY, display::cmds::OPEN),
            [SCRATCH, 0, 0, 0],
            ErrorCode::Success,
        );
        let h = os.read_u32(ProcId::ROOT, SCRATCH);
        os.expect_ret(scid::SET_OUT_HANDLE, [h, 0, 0, 0], ErrorCode::Success);
        os.write_bytes(ProcId::ROOT, SCRATCH, b"hello");
        os.expect_ret(scid::OUT_WRITE, [SCRATCH, 5, SCRATCH2, 0], ErrorCode::Success);
        assert_eq!(&os.display.lock().row_text(0)[..5], b"hello");

        // is_display distinguishes handle kinds.
        os.expect_ret(handle_scid(h as usize, hcid::IS_DISPLAY), [0; 4], ErrorCode::Success);
        os.expect_ret(
            handle_scid(h as usize, display::hcids::GET_DIMS),
            [SCRATCH, SCRATCH2, 0, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH), 40);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 4);
    }

    #[test]
    fn closed_and_absent_handles_fail_lookup() {
        let mut os = TestOs::boot();
        os.expect_ret(handle_scid(3, hcid::READ), [SCRATCH, 4, SCRATCH2, 0], ErrorCode::InvalidIndex);
        os.expect_ret(
            plugin_scid(plugin_ids::DISPLAY, display::cmds::OPEN),
            [SCRATCH, 0, 0, 0],
            ErrorCode::Success,
        );
        let h = os.read_u32(ProcId::ROOT, SCRATCH) as usize;
        os.expect_ret(handle_scid(h, hcid::CLOSE), [0; 4], ErrorCode::Success);
        os.expect_ret(handle_scid(h, hcid::WRITE), [SCRATCH, 1, 0, 0], ErrorCode::InvalidIndex);
    }

    #[test]
    fn zero_length_reads_and_writes_are_bad_args() {
        let mut os = TestOs::boot();
        os.expect_ret(
            plugin_scid(plugin_ids::DISPLAY, display::cmds::OPEN),
            [SCRATCH, 0, 0, 0],
            ErrorCode::Success,
        );
        let h = os.read_u32(ProcId::ROOT, SCRATCH) as usize;
        os.expect_ret(handle_scid(h, hcid::WRITE), [SCRATCH, 0, 0, 0], ErrorCode::BadArgs);
        os.expect_ret(handle_scid(h, hcid::READ), [SCRATCH, 0, 0, 0], ErrorCode::BadArgs);
    }
}

mod fs_plugin_tests {
    use super::*;

    fn path_call(os: &mut TestOs, cmd: u16, path: &str, extra: [u32; 2]) -> SyscallOutcome {
        os.write_bytes(ProcId::ROOT, SCRATCH, path.as_bytes());
        os.sys(
            plugin_scid(plugin_ids::FILE_SYS, cmd),
            [SCRATCH, path.len() as u32, extra[0], extra[1]],
        )
    }

    #[test]
    fn paths_resolve_against_the_working_directory() {
        let mut os = TestOs::boot();
        assert_eq!(
            path_call(&mut os, fs::cmds::MKDIR, "/home", [0, 0]),
            SyscallOutcome::ret(ErrorCode::Success)
        );
        assert_eq!(
            path_call(&mut os, fs::cmds::SET_WD, "/home", [0, 0]),
            SyscallOutcome::ret(ErrorCode::Success)
        );
        // A relative touch lands inside the new wd.
        assert_eq!(
            path_call(&mut os, fs::cmds::TOUCH, "notes.txt", [0, 0]),
            SyscallOutcome::ret(ErrorCode::Success)
        );
        assert!(os.fs.lock().info("/home/notes.txt").is_ok());

        // get_info through the gate: 12-byte wire record.
        assert_eq!(
            path_call(&mut os, fs::cmds::GET_INFO, "/home", [SCRATCH2, 0]),
            SyscallOutcome::ret(ErrorCode::Success)
        );
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 1); // is_dir
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2 + 8), 1); // child count

        // child_name writes a NUL-terminated name.
        assert_eq!(
            path_call(&mut os, fs::cmds::GET_CHILD_NAME, "/home", [0, SCRATCH3]),
            SyscallOutcome::ret(ErrorCode::Success)
        );
        let name = os.read_bytes(ProcId::ROOT, SCRATCH3, 10);
        assert_eq!(&name[..10], b"notes.txt\0");
    }

    #[test]
    fn set_wd_requires_a_directory() {
        let mut os = TestOs::boot();
        path_call(&mut os, fs::cmds::TOUCH, "/f", [0, 0]);
        assert_eq!(
            path_call(&mut os, fs::cmds::SET_WD, "/f", [0, 0]),
            SyscallOutcome::ret(ErrorCode::StateMismatch)
        );
        assert_eq!(
            path_call(&mut os, fs::cmds::SET_WD, "/nope", [0, 0]),
            SyscallOutcome::ret(ErrorCode::InvalidIndex)
        );
    }

    #[test]
    fn file_handles_seek_and_write_through_the_gate() {
        let mut os = TestOs::boot();
        path_call(&mut os, fs::cmds::TOUCH, "/log", [0, 0]);
        assert_eq!(
            path_call(&mut os, fs::cmds::OPEN, "/log", [SCRATCH2, 0]),
            SyscallOutcome::ret(ErrorCode::Success)
        );
        let h = os.read_u32(ProcId::ROOT, SCRATCH2) as usize;

        os.write_bytes(ProcId::ROOT, SCRATCH3, b"abcdef");
        os.expect_ret(
            handle_scid(h, hcid::WRITE),
            [SCRATCH3, 6, SCRATCH2, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 6);

        // Seek back and read it out again.
        os.expect_ret(handle_scid(h, fs::hcids::SEEK), [2, 0, 0, 0], ErrorCode::Success);
        os.expect_ret(
            handle_scid(h, hcid::READ),
            [SCRATCH3, 16, SCRATCH2, 0],
            ErrorCode::Success,
        );
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 4);
        assert_eq!(os.read_bytes(ProcId::ROOT, SCRATCH3, 4), b"cdef");

        // Past the end: a file's EOF is permanent.
        os.expect_ret(handle_scid(h, hcid::READ), [SCRATCH3, 4, SCRATCH2, 0], ErrorCode::Empty);
        os.expect_ret(handle_scid(h, hcid::WAIT_READ_READY), [0; 4], ErrorCode::Empty);
    }
}

mod pipe_tests {
    use super::*;

    fn open_pipe(os: &mut TestOs) -> (usize, usize) {
        os.expect_ret(
            plugin_scid(plugin_ids::PIPE, pipe::cmds::OPEN),
            [SCRATCH, SCRATCH2, 0, 0],
            ErrorCode::Success,
        );
        (
            os.read_u32(ProcId::ROOT, SCRATCH) as usize,
            os.read_u32(ProcId::ROOT, SCRATCH2) as usize,
        )
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let mut os = TestOs::boot();
        let (rh, wh) = open_pipe(&mut os);
        os.expect_ret(scid::THREAD_SPAWN, [0, 0x0800_0004, 0, 0], ErrorCode::Success);

        os.expect_ret(handle_scid(rh, hcid::READ), [SCRATCH, 4, SCRATCH2, 0], ErrorCode::Empty);
        assert_eq!(
            os.sys(handle_scid(rh, hcid::WAIT_READ_READY), [0; 4]),
            SyscallOutcome::Suspended
        );

        // The sibling writes; the reader comes back runnable.
        os.write_bytes(ProcId::ROOT, SCRATCH3, b"hi");
        os.expect_ret(handle_scid(wh, hcid::WRITE), [SCRATCH3, 2, SCRATCH2, 0], ErrorCode::Success);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 2);
        assert!(os.k.sched.contains(key(0, 0)));

        os.rotate_to(key(0, 0));
        os.expect_ret(handle_scid(rh, hcid::READ), [SCRATCH, 4, SCRATCH2, 0], ErrorCode::Success);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 2);
        assert_eq!(os.read_bytes(ProcId::ROOT, SCRATCH, 2), b"hi");
    }

    #[test]
    fn closing_the_write_end_is_eof() {
        let mut os = TestOs::boot();
        let (rh, wh) = open_pipe(&mut os);
        os.expect_ret(handle_scid(wh, hcid::CLOSE), [0; 4], ErrorCode::Success);
        os.expect_ret(handle_scid(rh, hcid::WAIT_READ_READY), [0; 4], ErrorCode::Empty);
        os.expect_ret(handle_scid(rh, hcid::READ), [SCRATCH, 4, SCRATCH2, 0], ErrorCode::Empty);
    }

    #[test]
    fn writes_to_a_readerless_pipe_are_rejected() {
        let mut os = TestOs::boot();
        let (rh, wh) = open_pipe(&mut os);
        os.expect_ret(handle_scid(rh, hcid::CLOSE), [0; 4], ErrorCode::Success);
        os.write_bytes(ProcId::ROOT, SCRATCH3, b"x");
        os.expect_ret(handle_scid(wh, hcid::WRITE), [SCRATCH3, 1, SCRATCH2, 0], ErrorCode::Inactive);
        os.expect_ret(handle_scid(wh, hcid::WAIT_WRITE_READY), [0; 4], ErrorCode::Empty);
    }
}

mod shm_tests {
    use super::*;

    #[test]
    fn regions_are_shared_by_frame_and_refcounted() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);

        // Prime the caller's shared-area page table so the accounting
        // below sees only region frames come and go.
        os.expect_ret(
            plugin_scid(plugin_ids::SHM, shm::cmds::CREATE),
            [1, SCRATCH, SCRATCH2, 0],
            ErrorCode::Success,
        );
        let primer = os.read_u32(ProcId::ROOT, SCRATCH);
        os.expect_ret(
            plugin_scid(plugin_ids::SHM, shm::cmds::UNMAP),
            [primer, 0, 0, 0],
            ErrorCode::Success,
        );
        let frames_before = os.k.mm.frames().free_frames();

        os.expect_ret(
            plugin_scid(plugin_ids::SHM, shm::cmds::CREATE),
            [2, SCRATCH, SCRATCH2, 0],
            ErrorCode::Success,
        );
        let region = os.read_u32(ProcId::ROOT, SCRATCH);
        let addr = os.read_u32(ProcId::ROOT, SCRATCH2);
        assert!(addr >= SHARED_AREA_START);
        os.write_bytes(ProcId::ROOT, addr, b"shared!");

        let child = os.fork();
        // Same bytes, same physical frame, in the child.
        assert_eq!(os.read_bytes(child, addr, 7), b"shared!");
        let pf = os
            .k
            .mm
            .translate(os.k.proc(ProcId::ROOT).unwrap().space.unwrap(), addr)
            .unwrap()
            .frame();
        let cf = os
            .k
            .mm
            .translate(os.k.proc(child).unwrap().space.unwrap(), addr)
            .unwrap()
            .frame();
        assert_eq!(pf, cf);

        // Child writes; parent sees it.
        os.write_bytes(child, addr + 7, b"!");
        assert_eq!(os.read_bytes(ProcId::ROOT, addr, 8), b"shared!!");

        // Tear down: child exits and is reaped, then the parent unmaps.
        os.rotate_to(key(child.0, 0));
        os.sys(scid::PROC_EXIT, [0, 0, 0, 0]);
        os.rotate_to(key(0, 0));
        os.expect_ret(scid::PROC_REAP, [child.0, 0, 0, 0], ErrorCode::Success);
        os.expect_ret(
            plugin_scid(plugin_ids::SHM, shm::cmds::UNMAP),
            [region, 0, 0, 0],
            ErrorCode::Success,
        );

        // All frames (shm pages included) are back.
        assert_eq!(os.k.mm.frames().free_frames(), frames_before);
        // The region is gone.
        os.expect_ret(
            plugin_scid(plugin_ids::SHM, shm::cmds::MAP),
            [region, SCRATCH, 0, 0],
            ErrorCode::InvalidIndex,
        );
    }

    #[test]
    fn frame_uniqueness_private_once_shared_refcounted() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        os.expect_ret(
            plugin_scid(plugin_ids::SHM, shm::cmds::CREATE),
            [1, SCRATCH, SCRATCH2, 0],
            ErrorCode::Success,
        );
        let child = os.fork();

        let mut counts: alloc::collections::BTreeMap<u32, (usize, bool)> =
            alloc::collections::BTreeMap::new();
        for pid in [ProcId::ROOT, child] {
            let space = os.k.proc(pid).unwrap().space.unwrap();
            for (va, pte) in os.k.mm.user_mappings(space) {
                let entry = counts.entry(pte.frame().0).or_insert((0, false));
                entry.0 += 1;
                entry.1 |= va >= SHARED_AREA_START;
            }
        }
        for (frame, (count, shared)) in counts {
            if shared {
                assert_eq!(count, 2, "shared frame {frame} should have two mappers");
            } else {
                assert_eq!(count, 1, "private frame {frame} is mapped more than once");
            }
        }
    }
}

mod keyboard_tests {
    use super::*;
    use crate::plugins::keyboard;

    fn press(os: &mut TestOs, byte: u8) {
        os.k
            .plugin_kernel_cmd(plugin_ids::KEYBOARD, keyboard::kernel_cmds::KEY_EVENT, byte as u32)
            .unwrap();
    }

    #[test]
    fn scancodes_flow_from_irq_to_reader() {
        let mut os = TestOs::boot();
        os.expect_ret(
            plugin_scid(plugin_ids::KEYBOARD, keyboard::cmds::OPEN),
            [SCRATCH, 0, 0, 0],
            ErrorCode::Success,
        );
        let h = os.read_u32(ProcId::ROOT, SCRATCH) as usize;

        // Nothing yet.
        os.expect_ret(handle_scid(h, hcid::READ), [SCRATCH, 8, SCRATCH2, 0], ErrorCode::Empty);

        press(&mut os, 0x1E); // make 'a'
        press(&mut os, 0xE0); // extended prefix...
        press(&mut os, 0x48); // ...up arrow
        press(&mut os, 0x9E); // break 'a'

        os.expect_ret(handle_scid(h, hcid::READ), [SCRATCH, 8, SCRATCH2, 0], ErrorCode::Success);
        assert_eq!(os.read_u32(ProcId::ROOT, SCRATCH2), 6);
        let bytes = os.read_bytes(ProcId::ROOT, SCRATCH, 6);
        let codes: Vec<u16> = bytes
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(codes, alloc::vec![0x001E, 0xE048, 0x009E]);
    }

    #[test]
    fn blocked_reader_wakes_on_key_and_skip_fwd_catches_up() {
        let mut os = TestOs::boot();
        os.expect_ret(
            plugin_scid(plugin_ids::KEYBOARD, keyboard::cmds::OPEN),
            [SCRATCH, 0, 0, 0],
            ErrorCode::Success,
        );
        let h = os.read_u32(ProcId::ROOT, SCRATCH) as usize;
        os.expect_ret(scid::THREAD_SPAWN, [0, 0x0800_0004, 0, 0], ErrorCode::Success);

        assert_eq!(
            os.sys(handle_scid(h, hcid::WAIT_READ_READY), [0; 4]),
            SyscallOutcome::Suspended
        );
        press(&mut os, 0x10);
        assert!(os.k.sched.contains(key(0, 0)));
        assert_eq!(os.eax_of(key(0, 0)), ErrorCode::Success.as_u32());

        // Skip forward: the buffered code is no longer visible.
        os.rotate_to(key(0, 0));
        os.expect_ret(handle_scid(h, keyboard::hcids::SKIP_FWD), [0; 4], ErrorCode::Success);
        os.expect_ret(handle_scid(h, hcid::READ), [SCRATCH, 8, SCRATCH2, 0], ErrorCode::Empty);
    }
}

mod wait_conservation_tests {
    use super::*;

    /// Threads entering kernel wait queues either pop out via a wake-up
    /// or are removed by forced termination, never both and never neither.
    #[test]
    fn killed_process_leaves_no_queue_residue() {
        let mut os = TestOs::boot();
        os.sys(scid::SIGNAL_ALLOW, [1 << SIG_CHLD, 0, 0, 0]);
        let child = os.fork();
        let ckey = key(child.0, 0);

        // Park the child's only thread in a sleep.
        os.rotate_to(ckey);
        assert_eq!(
            os.sys(scid::THREAD_SLEEP, [1000, 0, 0, 0]),
            SyscallOutcome::Suspended
        );
        assert_eq!(os.k.sleep_queue.waiting_len(), 1);

        os.k.kill_process(child, exit_status::FAILURE);
        assert_eq!(os.k.sleep_queue.waiting_len(), 0);

        // Ticking past the deadline resurrects nothing.
        for _ in 0..1001 {
            os.k.on_tick();
        }
        assert!(!os.k.sched.contains(ckey));
    }
}
