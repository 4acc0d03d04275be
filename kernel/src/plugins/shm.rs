//! Shared-memory plugin.
//!
//! The plugin is the single owner of every frame mapped in the shared
//! area. A region is created at a fixed shared-area virtual address and is
//! mapped at that same address in every participating directory, so
//! pointers into a region are meaningful across processes. The refcount
//! here is the authoritative one: fork inherits the parent's mappings,
//! exec and reap drop a process's mappings, and the frames return to the
//! allocator only when the count reaches zero.

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use crate::error::{ErrorCode, KernelResult};
use crate::mm::layout::{SHARED_AREA_END, SHARED_AREA_START};
use crate::mm::{Frame, FrameKind, FRAME_SIZE};
use crate::handle::Plugin;
use crate::process::{ProcId, ThreadKey};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;

/// Userspace plugin commands.
pub mod cmds {
    /// `create(pages, id_out, addr_out)`
    pub const CREATE: u16 = 0;
    /// `map(region_id, addr_out)`
    pub const MAP: u16 = 1;
    /// `unmap(region_id)`
    pub const UNMAP: u16 = 2;
}

struct ShmRegion {
    start_va: u32,
    frames: Vec<Frame>,
    refs: usize,
}

pub struct ShmPlugin {
    regions: BTreeMap<u32, ShmRegion>,
    next_region: u32,
    /// Bump allocator over the shared area; region addresses are not
    /// reused within one boot.
    next_va: u32,
    /// pid -> region ids that process has mapped.
    maps: BTreeMap<u32, BTreeSet<u32>>,
}

impl ShmPlugin {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_region: 0,
            next_va: SHARED_AREA_START,
            maps: BTreeMap::new(),
        }
    }

    fn create(&mut self, k: &mut Kernel, pid: ProcId, pages: u32) -> KernelResult<(u32, u32)> {
        if pages == 0 {
            return Err(ErrorCode::BadArgs);
        }
        let bytes = pages
            .checked_mul(FRAME_SIZE as u32)
            .ok_or(ErrorCode::InvalidRange)?;
        let start_va = self.next_va;
        let end_va = start_va.checked_add(bytes).ok_or(ErrorCode::NoSpace)?;
        if end_va > SHARED_AREA_END {
            return Err(ErrorCode::NoSpace);
        }

        let mut frames = Vec::with_capacity(pages as usize);
        for _ in 0..pages {
            match k.mm.frames_mut().alloc_frame(FrameKind::User) {
                Ok(frame) => {
                    k.mm.window().zero_frame(frame);
                    frames.push(frame);
                }
                Err(e) => {
                    for f in frames {
                        k.mm.frames_mut().free_frame(f);
                    }
                    return Err(e);
                }
            }
        }

        let region_id = self.next_region;
        let region = ShmRegion {
            start_va,
            frames,
            refs: 0,
        };
        self.regions.insert(region_id, region);

        match self.map_into(k, pid, region_id) {
            Ok(addr) => {
                self.next_region += 1;
                self.next_va = end_va;
                Ok((region_id, addr))
            }
            Err(e) => {
                let region = self.regions.remove(&region_id).expect("fresh region vanished");
                for f in region.frames {
                    k.mm.frames_mut().free_frame(f);
                }
                Err(e)
            }
        }
    }

    fn map_into(&mut self, k: &mut Kernel, pid: ProcId, region_id: u32) -> KernelResult<u32> {
        let region = self.regions.get_mut(&region_id).ok_or(ErrorCode::InvalidIndex)?;
        let mapped = self.maps.entry(pid.0).or_default();
        if mapped.contains(&region_id) {
            return Err(ErrorCode::InUse);
        }
        let space = k.proc_space(pid)?;
        for (i, frame) in region.frames.iter().enumerate() {
            let va = region.start_va + (i * FRAME_SIZE) as u32;
            if let Err(e) = k.mm.map_frame_at(space, va, *frame, true) {
                let done = region.start_va + (i * FRAME_SIZE) as u32;
                k.mm.unmap_range_keep(space, region.start_va, done);
                return Err(e);
            }
        }
        mapped.insert(region_id);
        region.refs += 1;
        Ok(region.start_va)
    }

    fn unmap_from(&mut self, k: &mut Kernel, pid: ProcId, region_id: u32) -> KernelResult<()> {
        let mapped = self.maps.get_mut(&pid.0).ok_or(ErrorCode::StateMismatch)?;
        if !mapped.remove(&region_id) {
            return Err(ErrorCode::StateMismatch);
        }
        let region = self.regions.get_mut(&region_id).ok_or(ErrorCode::InvalidIndex)?;

        // A reaped process has no directory left; the refcount still drops.
        if let Ok(space) = k.proc_space(pid) {
            let end = region.start_va + (region.frames.len() * FRAME_SIZE) as u32;
            k.mm.unmap_range_keep(space, region.start_va, end);
        }

        region.refs -= 1;
        if region.refs == 0 {
            let region = self.regions.remove(&region_id).expect("region vanished");
            for f in region.frames {
                k.mm.frames_mut().free_frame(f);
            }
        }
        Ok(())
    }

    fn drop_process(&mut self, k: &mut Kernel, pid: ProcId) {
        let Some(mapped) = self.maps.get(&pid.0) else { return };
        let ids: Vec<u32> = mapped.iter().copied().collect();
        for region_id in ids {
            let _ = self.unmap_from(k, pid, region_id);
        }
        self.maps.remove(&pid.0);
    }

    /// Regions currently mapped by `pid` (diagnostics and tests).
    pub fn mapped_regions(&self, pid: ProcId) -> usize {
        self.maps.get(&pid.0).map_or(0, BTreeSet::len)
    }

    /// Authoritative refcount of a region (tests).
    pub fn region_refs(&self, region_id: u32) -> Option<usize> {
        self.regions.get(&region_id).map(|r| r.refs)
    }
}

impl Default for ShmPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ShmPlugin {
    fn cmd(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        cmd: u16,
        args: [u32; 4],
    ) -> SyscallOutcome {
        match cmd {
            cmds::CREATE => match self.create(k, caller.pid, args[0]) {
                Ok((region_id, addr)) => {
                    let res = k
                        .put_user_u32(caller.pid, args[1], region_id)
                        .and_then(|_| k.put_user_u32(caller.pid, args[2], addr));
                    SyscallOutcome::of(res)
                }
                Err(e) => SyscallOutcome::ret(e),
            },
            cmds::MAP => match self.map_into(k, caller.pid, args[0]) {
                Ok(addr) => SyscallOutcome::of(k.put_user_u32(caller.pid, args[1], addr)),
                Err(e) => SyscallOutcome::ret(e),
            },
            cmds::UNMAP => SyscallOutcome::of(self.unmap_from(k, caller.pid, args[0])),
            _ => SyscallOutcome::ret(ErrorCode::NotImplemented),
        }
    }

    /// The child inherits every region the parent had mapped.
    fn on_fork_proc(&mut self, k: &mut Kernel, parent: ProcId, child: ProcId) -> KernelResult<()> {
        let ids: Vec<u32> = self
            .maps
            .get(&parent.0)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for region_id in ids {
            if let Err(e) = self.map_into(k, child, region_id) {
                // Fork veto; the kernel will call on_reap_proc(child).
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_reset_proc(&mut self, k: &mut Kernel, pid: ProcId) {
        self.drop_process(k, pid);
    }

    fn on_reap_proc(&mut self, k: &mut Kernel, pid: ProcId) {
        self.drop_process(k, pid);
    }
}
