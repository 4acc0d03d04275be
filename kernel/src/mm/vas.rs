//! Per-process virtual address spaces.
//!
//! The manager owns the frame allocator and the physical window, builds the
//! kernel page directory once, and stamps its kernel-area entries into
//! every user directory it creates. Page tables are only ever touched
//! through the window, so none of this code cares whether the directory it
//! is editing is the live one.

extern crate alloc;

use crate::error::{ErrorCode, KernelResult};
use crate::mm::frame_allocator::{FrameAllocator, FrameKind};
use crate::mm::layout::{
    self, Region, FREE_AREA_END, FREE_AREA_START, KERNEL_AREA_END, KERNEL_AREA_START,
    KERNEL_PDE_COUNT, SHARED_AREA_END, SHARED_AREA_START,
};
use crate::mm::page_table::{pd_index, pt_index, PageTable, PageTableEntry, PteFlags};
use crate::mm::phys::{Frame, PhysAddr, PhysWindow, FRAME_SIZE};

/// A handle on one process's page directory.
///
/// Plain data: the directory frame number. All mutation goes through the
/// [`AddrSpaceMgr`] that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pd_frame: Frame,
}

impl AddressSpace {
    pub fn pd_frame(self) -> Frame {
        self.pd_frame
    }

    /// Physical address loaded into CR3 to activate this space.
    pub fn cr3(self) -> PhysAddr {
        self.pd_frame.base()
    }
}

pub struct AddrSpaceMgr {
    win: PhysWindow,
    ppa: FrameAllocator,
    /// Kernel-area directory entries, shared by reference in every PD.
    kernel_pdes: [PageTableEntry; KERNEL_PDE_COUNT],
    kernel_space: AddressSpace,
}

impl AddrSpaceMgr {
    /// Build the kernel address space: an identity map of the kernel area.
    pub fn new(win: PhysWindow, mut ppa: FrameAllocator) -> KernelResult<Self> {
        let pd_frame = ppa.alloc_frame(FrameKind::Kernel)?;
        win.zero_frame(pd_frame);

        let mut kernel_pdes = [PageTableEntry::EMPTY; KERNEL_PDE_COUNT];
        for (pde_idx, pde) in kernel_pdes.iter_mut().enumerate() {
            let pt_frame = ppa.alloc_frame(FrameKind::Kernel)?;
            win.zero_frame(pt_frame);
            // SAFETY: pt_frame was just allocated and is exclusively ours;
            // the window maps it to valid, 4 KiB-aligned backing memory.
            let pt = unsafe { &mut *(win.ptr(pt_frame.base()).cast::<PageTable>()) };
            for (pt_idx, entry) in pt.entries.iter_mut().enumerate() {
                let va = KERNEL_AREA_START + ((pde_idx << 22) | (pt_idx << 12)) as u32;
                if va >= KERNEL_AREA_END {
                    break;
                }
                *entry = PageTableEntry::new(
                    PhysAddr::new(va).frame(),
                    PteFlags::PRESENT | PteFlags::WRITABLE,
                );
            }
            *pde = PageTableEntry::new(pt_frame, PteFlags::PRESENT | PteFlags::WRITABLE);
        }

        // SAFETY: pd_frame is exclusively ours and window-backed.
        let pd = unsafe { &mut *(win.ptr(pd_frame.base()).cast::<PageTable>()) };
        pd.entries[..KERNEL_PDE_COUNT].copy_from_slice(&kernel_pdes);

        Ok(Self {
            win,
            ppa,
            kernel_pdes,
            kernel_space: AddressSpace { pd_frame },
        })
    }

    pub fn window(&self) -> PhysWindow {
        self.win
    }

    pub fn kernel_space(&self) -> AddressSpace {
        self.kernel_space
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.ppa
    }

    pub fn frames_mut(&mut self) -> &mut FrameAllocator {
        &mut self.ppa
    }

    fn table_mut(&mut self, frame: Frame) -> &mut PageTable {
        // SAFETY: callers only pass directory/table frames this manager
        // allocated; the window maps them to valid aligned memory, and the
        // serial kernel never aliases two live references to one table.
        unsafe { &mut *(self.win.ptr(frame.base()).cast::<PageTable>()) }
    }

    fn table(&self, frame: Frame) -> &PageTable {
        // SAFETY: as for `table_mut`.
        unsafe { &*(self.win.ptr(frame.base()).cast::<PageTable>()) }
    }

    /// Create a fresh user directory inheriting the kernel entries.
    pub fn create_user_pd(&mut self) -> KernelResult<AddressSpace> {
        let pd_frame = self.ppa.alloc_frame(FrameKind::Kernel)?;
        self.win.zero_frame(pd_frame);
        let kernel_pdes = self.kernel_pdes;
        let pd = self.table_mut(pd_frame);
        pd.entries[..KERNEL_PDE_COUNT].copy_from_slice(&kernel_pdes);
        Ok(AddressSpace { pd_frame })
    }

    /// Tear down a user directory: every private user frame and page table
    /// is returned to the allocator. Kernel entries are shared and
    /// untouched; shared-area frames belong to the shared-memory plugin
    /// and are only unmapped here.
    pub fn destroy_pd(&mut self, space: AddressSpace) {
        let shared_pde_lo = pd_index(SHARED_AREA_START);
        let shared_pde_hi = pd_index(SHARED_AREA_END - 1);
        for pde_idx in KERNEL_PDE_COUNT..1024 {
            let pde = self.table(space.pd_frame).entries[pde_idx];
            if !pde.is_present() {
                continue;
            }
            let pt_frame = pde.frame();
            let in_shared = (shared_pde_lo..=shared_pde_hi).contains(&pde_idx);
            if !in_shared {
                for pt_idx in 0..1024 {
                    let pte = self.table(pt_frame).entries[pt_idx];
                    if pte.is_present() {
                        self.ppa.free_frame(pte.frame());
                    }
                }
            }
            self.ppa.free_frame(pt_frame);
            self.table_mut(space.pd_frame).entries[pde_idx] = PageTableEntry::EMPTY;
        }
        self.ppa.free_frame(space.pd_frame);
    }

    fn pde_flags_for(user: bool) -> PteFlags {
        let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
        if user {
            flags |= PteFlags::USER;
        }
        flags
    }

    /// Page table backing `vaddr`, created on demand.
    fn ensure_pt(&mut self, space: AddressSpace, vaddr: u32, user: bool) -> KernelResult<Frame> {
        let idx = pd_index(vaddr);
        let pde = self.table(space.pd_frame).entries[idx];
        if pde.is_present() {
            return Ok(pde.frame());
        }
        let pt_frame = self.ppa.alloc_frame(FrameKind::Kernel)?;
        self.win.zero_frame(pt_frame);
        self.table_mut(space.pd_frame).entries[idx] =
            PageTableEntry::new(pt_frame, Self::pde_flags_for(user));
        Ok(pt_frame)
    }

    /// Demand-map `[start, end)` with fresh zeroed user frames.
    ///
    /// Same `true_end` contract as the frame allocator: mapping stops at
    /// the first page that is already mapped or cannot be backed.
    pub fn map_range(
        &mut self,
        space: AddressSpace,
        start: u32,
        end: u32,
        writable: bool,
        user: bool,
    ) -> VirtRangeOutcome {
        debug_assert!(start % FRAME_SIZE as u32 == 0 && end % FRAME_SIZE as u32 == 0);
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        if user {
            flags |= PteFlags::USER;
        }

        let mut va = start;
        while va < end {
            let pt_frame = match self.ensure_pt(space, va, user) {
                Ok(f) => f,
                Err(e) => {
                    return VirtRangeOutcome {
                        true_end: va,
                        status: Err(e),
                    }
                }
            };
            if self.table(pt_frame).entries[pt_index(va)].is_present() {
                return VirtRangeOutcome {
                    true_end: va,
                    status: Err(ErrorCode::AlreadyAllocated),
                };
            }
            let frame = match self.ppa.alloc_frame(FrameKind::User) {
                Ok(f) => f,
                Err(e) => {
                    return VirtRangeOutcome {
                        true_end: va,
                        status: Err(e),
                    }
                }
            };
            self.win.zero_frame(frame);
            self.table_mut(pt_frame).entries[pt_index(va)] = PageTableEntry::new(frame, flags);
            va += FRAME_SIZE as u32;
        }
        VirtRangeOutcome {
            true_end: end,
            status: Ok(()),
        }
    }

    /// Map one existing frame at `vaddr` without transferring ownership.
    ///
    /// Used by the shared-memory plugin, which keeps the authoritative
    /// refcount for the frame.
    pub fn map_frame_at(
        &mut self,
        space: AddressSpace,
        vaddr: u32,
        frame: Frame,
        writable: bool,
    ) -> KernelResult<()> {
        let pt_frame = self.ensure_pt(space, vaddr, true)?;
        if self.table(pt_frame).entries[pt_index(vaddr)].is_present() {
            return Err(ErrorCode::AlreadyAllocated);
        }
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.table_mut(pt_frame).entries[pt_index(vaddr)] = PageTableEntry::new(frame, flags);
        Ok(())
    }

    /// Unmap `[start, end)`, returning each mapped frame to the allocator.
    /// Holes in the range are skipped.
    pub fn unmap_range(&mut self, space: AddressSpace, start: u32, end: u32) {
        self.unmap_impl(space, start, end, true);
    }

    /// Unmap `[start, end)` without freeing the frames (shared mappings).
    pub fn unmap_range_keep(&mut self, space: AddressSpace, start: u32, end: u32) {
        self.unmap_impl(space, start, end, false);
    }

    fn unmap_impl(&mut self, space: AddressSpace, start: u32, end: u32, free_frames: bool) {
        debug_assert!(start % FRAME_SIZE as u32 == 0 && end % FRAME_SIZE as u32 == 0);
        let mut va = start;
        while va < end {
            let pde = self.table(space.pd_frame).entries[pd_index(va)];
            if pde.is_present() {
                let pt_frame = pde.frame();
                let pte = self.table(pt_frame).entries[pt_index(va)];
                if pte.is_present() {
                    if free_frames {
                        self.ppa.free_frame(pte.frame());
                    }
                    self.table_mut(pt_frame).entries[pt_index(va)] = PageTableEntry::EMPTY;
                }
            }
            va += FRAME_SIZE as u32;
        }
    }

    /// Flip the writable bit on every mapped page of `[start, end)`.
    /// Used after image loading to seal read-only areas.
    pub fn protect_range(&mut self, space: AddressSpace, start: u32, end: u32, writable: bool) {
        let mut va = start;
        while va < end {
            let pde = self.table(space.pd_frame).entries[pd_index(va)];
            if pde.is_present() {
                let pt_frame = pde.frame();
                let pte = self.table(pt_frame).entries[pt_index(va)];
                if pte.is_present() {
                    let mut flags = pte.flags();
                    flags.set(PteFlags::WRITABLE, writable);
                    self.table_mut(pt_frame).entries[pt_index(va)] =
                        PageTableEntry::new(pte.frame(), flags);
                }
            }
            va += FRAME_SIZE as u32;
        }
    }

    /// Resolve a virtual address through `space` without loading CR3.
    pub fn translate(&self, space: AddressSpace, vaddr: u32) -> Option<PageTableEntry> {
        let pde = self.table(space.pd_frame).entries[pd_index(vaddr)];
        if !pde.is_present() {
            return None;
        }
        let pte = self.table(pde.frame()).entries[pt_index(vaddr)];
        pte.is_present().then_some(pte)
    }

    /// Eagerly clone every private user mapping of `src` into a new
    /// directory: same addresses, same flags, fresh frames, identical
    /// bytes. The shared area is left to the shared-memory plugin.
    pub fn clone_user(&mut self, src: AddressSpace) -> KernelResult<AddressSpace> {
        let dst = self.create_user_pd()?;
        let shared_pde_lo = pd_index(SHARED_AREA_START);
        let shared_pde_hi = pd_index(SHARED_AREA_END - 1);

        for pde_idx in KERNEL_PDE_COUNT..1024 {
            if (shared_pde_lo..=shared_pde_hi).contains(&pde_idx) {
                continue;
            }
            let pde = self.table(src.pd_frame).entries[pde_idx];
            if !pde.is_present() {
                continue;
            }
            for pt_idx in 0..1024 {
                let pte = self.table(pde.frame()).entries[pt_idx];
                if !pte.is_present() {
                    continue;
                }
                let va = ((pde_idx as u32) << 22) | ((pt_idx as u32) << 12);
                let copy = match self.ppa.alloc_frame(FrameKind::User) {
                    Ok(f) => f,
                    Err(e) => {
                        self.destroy_pd(dst);
                        return Err(e);
                    }
                };
                let src_bytes = self.win.frame_bytes(pte.frame());
                self.win.frame_bytes(copy).copy_from_slice(src_bytes);
                let pt_frame = match self.ensure_pt(dst, va, pte.is_user()) {
                    Ok(f) => f,
                    Err(e) => {
                        self.ppa.free_frame(copy);
                        self.destroy_pd(dst);
                        return Err(e);
                    }
                };
                self.table_mut(pt_frame).entries[pt_idx] = PageTableEntry::new(copy, pte.flags());
            }
        }
        Ok(dst)
    }

    /// `mem_request` backend: allocate `[s, e)` inside the free area.
    pub fn request_user_range(&mut self, space: AddressSpace, s: u32, e: u32) -> VirtRangeOutcome {
        if s % FRAME_SIZE as u32 != 0 || e % FRAME_SIZE as u32 != 0 {
            return VirtRangeOutcome {
                true_end: s,
                status: Err(ErrorCode::AlignError),
            };
        }
        if e < s || !free_area_contains(s, e) {
            return VirtRangeOutcome {
                true_end: s,
                status: Err(ErrorCode::InvalidRange),
            };
        }
        self.map_range(space, s, e, true, true)
    }

    /// `mem_return` backend: silently ignores malformed ranges.
    pub fn return_user_range(&mut self, space: AddressSpace, s: u32, e: u32) {
        if s % FRAME_SIZE as u32 != 0 || e % FRAME_SIZE as u32 != 0 {
            return;
        }
        if e < s || !free_area_contains(s, e) {
            return;
        }
        self.unmap_range(space, s, e);
    }

    /// Every user-area mapping of a directory as `(vaddr, entry)` pairs,
    /// kernel PDEs excluded. Diagnostics and invariant checks.
    pub fn user_mappings(&self, space: AddressSpace) -> alloc::vec::Vec<(u32, PageTableEntry)> {
        let mut out = alloc::vec::Vec::new();
        for pde_idx in KERNEL_PDE_COUNT..1024 {
            let pde = self.table(space.pd_frame).entries[pde_idx];
            if !pde.is_present() {
                continue;
            }
            for pt_idx in 0..1024 {
                let pte = self.table(pde.frame()).entries[pt_idx];
                if pte.is_present() {
                    let va = ((pde_idx as u32) << 22) | ((pt_idx as u32) << 12);
                    out.push((va, pte));
                }
            }
        }
        out
    }

    /// Count the mapped user pages of a region (test/diagnostic aid).
    pub fn count_mapped(&self, space: AddressSpace, start: u32, end: u32) -> usize {
        let mut va = start;
        let mut n = 0;
        while va < end {
            if self.translate(space, va).is_some() {
                n += 1;
            }
            va += FRAME_SIZE as u32;
        }
        n
    }
}

fn free_area_contains(s: u32, e: u32) -> bool {
    s >= FREE_AREA_START && e <= FREE_AREA_END
}

/// Outcome of a virtual range operation (`true_end` contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtRangeOutcome {
    pub true_end: u32,
    pub status: KernelResult<()>,
}

/// Classification used by fault handlers: which region does an address
/// belong to, and is it one a user mapping may exist in.
pub fn user_region(vaddr: u32) -> Option<Region> {
    match layout::region_of(vaddr) {
        Region::Kernel | Region::Unmappable => None,
        r => Some(r),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mm::layout::{APP_AREA_START, FREE_AREA_START, STACK_AREA_START};
    use crate::mm::phys::TestArena;

    pub(crate) fn test_mgr(frames: usize) -> (TestArena, AddrSpaceMgr) {
        let arena = TestArena::new(frames).unwrap();
        let ppa = FrameAllocator::new(arena.phys_base(), arena.phys_end()).unwrap();
        let mgr = AddrSpaceMgr::new(arena.window(), ppa).unwrap();
        (arena, mgr)
    }

    #[test]
    fn user_pd_inherits_kernel_entries() {
        let (_arena, mut mgr) = test_mgr(128);
        let space = mgr.create_user_pd().unwrap();
        let kpd = mgr.kernel_space();
        for idx in 0..KERNEL_PDE_COUNT {
            assert_eq!(
                mgr.table(space.pd_frame()).entries[idx],
                mgr.table(kpd.pd_frame()).entries[idx],
            );
        }
    }

    #[test]
    fn map_unmap_round_trip_restores_frames() {
        let (_arena, mut mgr) = test_mgr(128);
        let space = mgr.create_user_pd().unwrap();
        let before = mgr.frames().free_frames();

        let out = mgr.map_range(space, APP_AREA_START, APP_AREA_START + 0x4000, true, true);
        assert!(out.status.is_ok());
        assert_eq!(mgr.count_mapped(space, APP_AREA_START, APP_AREA_START + 0x4000), 4);

        mgr.unmap_range(space, APP_AREA_START, APP_AREA_START + 0x4000);
        assert_eq!(mgr.count_mapped(space, APP_AREA_START, APP_AREA_START + 0x4000), 0);
        // The page-table frame remains allocated; the 4 user frames are back.
        assert_eq!(mgr.frames().free_frames() + 1, before);
    }

    #[test]
    fn double_map_stops_with_true_end() {
        let (_arena, mut mgr) = test_mgr(128);
        let space = mgr.create_user_pd().unwrap();
        let mid = STACK_AREA_START + 0x2000;
        assert!(mgr.map_range(space, mid, mid + 0x1000, true, true).status.is_ok());

        let out = mgr.map_range(space, STACK_AREA_START, STACK_AREA_START + 0x4000, true, true);
        assert_eq!(out.true_end, mid);
        assert_eq!(out.status, Err(ErrorCode::AlreadyAllocated));
    }

    #[test]
    fn destroy_returns_private_frames() {
        let (_arena, mut mgr) = test_mgr(256);
        let baseline = mgr.frames().free_frames();
        let space = mgr.create_user_pd().unwrap();
        assert!(mgr
            .map_range(space, APP_AREA_START, APP_AREA_START + 0x8000, true, true)
            .status
            .is_ok());
        assert!(mgr
            .map_range(space, FREE_AREA_START, FREE_AREA_START + 0x3000, true, true)
            .status
            .is_ok());
        mgr.destroy_pd(space);
        assert_eq!(mgr.frames().free_frames(), baseline);
    }

    #[test]
    fn clone_user_copies_bytes_to_fresh_frames() {
        let (_arena, mut mgr) = test_mgr(256);
        let a = mgr.create_user_pd().unwrap();
        assert!(mgr.map_range(a, APP_AREA_START, APP_AREA_START + 0x1000, true, true).status.is_ok());
        let frame_a = mgr.translate(a, APP_AREA_START).unwrap().frame();
        mgr.window().frame_bytes(frame_a)[123] = 0x5A;

        let b = mgr.clone_user(a).unwrap();
        let frame_b = mgr.translate(b, APP_AREA_START).unwrap().frame();
        assert_ne!(frame_a, frame_b);
        assert_eq!(mgr.window().frame_bytes(frame_b)[123], 0x5A);

        // Writes after the clone stay private.
        mgr.window().frame_bytes(frame_a)[123] = 0x11;
        assert_eq!(mgr.window().frame_bytes(frame_b)[123], 0x5A);
    }

    #[test]
    fn request_user_range_enforces_free_area() {
        let (_arena, mut mgr) = test_mgr(128);
        let space = mgr.create_user_pd().unwrap();

        let out = mgr.request_user_range(space, APP_AREA_START, APP_AREA_START + 0x1000);
        assert_eq!(out.status, Err(ErrorCode::InvalidRange));

        let out = mgr.request_user_range(space, FREE_AREA_START + 1, FREE_AREA_START + 0x1000);
        assert_eq!(out.status, Err(ErrorCode::AlignError));

        let out = mgr.request_user_range(space, FREE_AREA_START, FREE_AREA_START + 0x2000);
        assert!(out.status.is_ok());
        assert_eq!(out.true_end, FREE_AREA_START + 0x2000);
    }
}
