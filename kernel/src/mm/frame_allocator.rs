//! Physical frame allocator.
//!
//! A bitmap-style allocator over a bounded physical range. Every frame is
//! free, kernel-owned, or user-owned; a frame is owned by at most one
//! page-table entry in the whole system (shared-area frames are the single
//! exception and are refcounted by the shared-memory plugin, which still
//! owns them here as one allocation).
//!
//! Two allocation styles are offered: exact ranges with a `true_end` report
//! (the contract `mem_request` ultimately exposes to userspace) and single
//! anonymous frames for page tables, images, and stacks.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{ErrorCode, KernelResult};
use crate::mm::phys::{Frame, PhysAddr, FRAME_SIZE};

/// Ownership class of an allocated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameState {
    Free,
    Kernel,
    User,
}

/// Result of a range allocation: how far it got, and why it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOutcome {
    /// First physical address that could NOT be given. Equal to the
    /// requested end on full success.
    pub true_end: PhysAddr,
    /// `Ok` iff the whole range was allocated.
    pub status: KernelResult<()>,
}

pub struct FrameAllocator {
    base: Frame,
    states: Vec<FrameState>,
    free_count: usize,
    /// Rotating scan start for anonymous allocation.
    next_hint: usize,
}

impl FrameAllocator {
    /// Manage the frame range covering `[phys_base, phys_end)`.
    pub fn new(phys_base: PhysAddr, phys_end: PhysAddr) -> KernelResult<Self> {
        if !phys_base.is_frame_aligned() || !phys_end.is_frame_aligned() {
            return Err(ErrorCode::AlignError);
        }
        if phys_end <= phys_base {
            return Err(ErrorCode::InvalidRange);
        }
        let frames = ((phys_end.as_u32() - phys_base.as_u32()) as usize) / FRAME_SIZE;
        let mut states = Vec::with_capacity(frames);
        states.resize(frames, FrameState::Free);
        Ok(Self {
            base: phys_base.frame(),
            states,
            free_count: frames,
            next_hint: 0,
        })
    }

    pub fn managed_range(&self) -> (PhysAddr, PhysAddr) {
        let start = self.base.base();
        let end = PhysAddr::new(start.as_u32() + (self.states.len() * FRAME_SIZE) as u32);
        (start, end)
    }

    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    fn index_of(&self, frame: Frame) -> Option<usize> {
        let idx = frame.0.checked_sub(self.base.0)? as usize;
        (idx < self.states.len()).then_some(idx)
    }

    /// Reserve the exact frame range `[start, end)`.
    ///
    /// Stops at the first frame that is outside the managed range or
    /// already allocated; `true_end` marks how far the reservation got.
    pub fn alloc_range(&mut self, start: PhysAddr, end: PhysAddr, kind: FrameKind) -> RangeOutcome {
        if !start.is_frame_aligned() || !end.is_frame_aligned() {
            return RangeOutcome {
                true_end: start,
                status: Err(ErrorCode::AlignError),
            };
        }
        if end < start {
            return RangeOutcome {
                true_end: start,
                status: Err(ErrorCode::InvalidRange),
            };
        }

        let state = match kind {
            FrameKind::Kernel => FrameState::Kernel,
            FrameKind::User => FrameState::User,
        };

        let mut cursor = start;
        while cursor < end {
            let frame = cursor.frame();
            let Some(idx) = self.index_of(frame) else {
                return RangeOutcome {
                    true_end: cursor,
                    status: Err(ErrorCode::NoMem),
                };
            };
            if self.states[idx] != FrameState::Free {
                return RangeOutcome {
                    true_end: cursor,
                    status: Err(ErrorCode::AlreadyAllocated),
                };
            }
            self.states[idx] = state;
            self.free_count -= 1;
            cursor = PhysAddr::new(cursor.as_u32() + FRAME_SIZE as u32);
        }

        RangeOutcome {
            true_end: end,
            status: Ok(()),
        }
    }

    /// Return `[start, end)` to the free pool.
    ///
    /// Freeing an already-free frame is a kernel bug.
    pub fn free_range(&mut self, start: PhysAddr, end: PhysAddr) {
        debug_assert!(start.is_frame_aligned() && end.is_frame_aligned());
        let mut cursor = start;
        while cursor < end {
            self.free_frame(cursor.frame());
            cursor = PhysAddr::new(cursor.as_u32() + FRAME_SIZE as u32);
        }
    }

    /// Allocate one frame anywhere in the managed range.
    pub fn alloc_frame(&mut self, kind: FrameKind) -> KernelResult<Frame> {
        if self.free_count == 0 {
            return Err(ErrorCode::NoMem);
        }
        let n = self.states.len();
        for step in 0..n {
            let idx = (self.next_hint + step) % n;
            if self.states[idx] == FrameState::Free {
                self.states[idx] = match kind {
                    FrameKind::Kernel => FrameState::Kernel,
                    FrameKind::User => FrameState::User,
                };
                self.free_count -= 1;
                self.next_hint = (idx + 1) % n;
                return Ok(Frame::new(self.base.0 + idx as u32));
            }
        }
        Err(ErrorCode::NoMem)
    }

    pub fn free_frame(&mut self, frame: Frame) {
        match self.index_of(frame) {
            Some(idx) => {
                if self.states[idx] == FrameState::Free {
                    debug_assert!(false, "double free of frame {}", frame.0);
                    log::error!("frame allocator: double free of frame {}", frame.0);
                    return;
                }
                self.states[idx] = FrameState::Free;
                self.free_count += 1;
            }
            None => {
                debug_assert!(false, "free of unmanaged frame {}", frame.0);
                log::error!("frame allocator: free of unmanaged frame {}", frame.0);
            }
        }
    }

    /// Current ownership of `frame`, if it is managed and allocated.
    pub fn kind_of(&self, frame: Frame) -> Option<FrameKind> {
        let idx = self.index_of(frame)?;
        match self.states[idx] {
            FrameState::Free => None,
            FrameState::Kernel => Some(FrameKind::Kernel),
            FrameState::User => Some(FrameKind::User),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(frames: u32) -> FrameAllocator {
        let base = PhysAddr::new(0x0010_0000);
        let end = PhysAddr::new(0x0010_0000 + frames * FRAME_SIZE as u32);
        FrameAllocator::new(base, end).unwrap()
    }

    #[test]
    fn exact_range_success_and_round_trip() {
        let mut ppa = allocator(8);
        let s = PhysAddr::new(0x0010_1000);
        let e = PhysAddr::new(0x0010_4000);
        let out = ppa.alloc_range(s, e, FrameKind::User);
        assert_eq!(out.true_end, e);
        assert!(out.status.is_ok());
        assert_eq!(ppa.free_frames(), 5);

        ppa.free_range(s, e);
        assert_eq!(ppa.free_frames(), 8);
        // The state is fully restored: the same range allocates again.
        assert!(ppa.alloc_range(s, e, FrameKind::User).status.is_ok());
    }

    #[test]
    fn overlap_stops_at_true_end() {
        let mut ppa = allocator(8);
        let mid = PhysAddr::new(0x0010_3000);
        assert!(ppa
            .alloc_range(mid, PhysAddr::new(0x0010_4000), FrameKind::Kernel)
            .status
            .is_ok());

        let out = ppa.alloc_range(
            PhysAddr::new(0x0010_1000),
            PhysAddr::new(0x0010_6000),
            FrameKind::User,
        );
        assert_eq!(out.true_end, mid);
        assert_eq!(out.status, Err(ErrorCode::AlreadyAllocated));
        // Frames before the collision were handed out.
        assert_eq!(ppa.kind_of(PhysAddr::new(0x0010_2000).frame()), Some(FrameKind::User));
    }

    #[test]
    fn out_of_range_reports_no_mem() {
        let mut ppa = allocator(2);
        let out = ppa.alloc_range(
            PhysAddr::new(0x0010_1000),
            PhysAddr::new(0x0010_4000),
            FrameKind::User,
        );
        assert_eq!(out.true_end, PhysAddr::new(0x0010_2000));
        assert_eq!(out.status, Err(ErrorCode::NoMem));
    }

    #[test]
    fn alignment_and_range_validation() {
        let mut ppa = allocator(4);
        let out = ppa.alloc_range(
            PhysAddr::new(0x0010_0001),
            PhysAddr::new(0x0010_1000),
            FrameKind::User,
        );
        assert_eq!(out.status, Err(ErrorCode::AlignError));

        let out = ppa.alloc_range(
            PhysAddr::new(0x0010_2000),
            PhysAddr::new(0x0010_1000),
            FrameKind::User,
        );
        assert_eq!(out.status, Err(ErrorCode::InvalidRange));
        assert_eq!(ppa.free_frames(), 4);
    }

    #[test]
    fn anonymous_frames_are_unique_until_exhaustion() {
        let mut ppa = allocator(3);
        let a = ppa.alloc_frame(FrameKind::User).unwrap();
        let b = ppa.alloc_frame(FrameKind::User).unwrap();
        let c = ppa.alloc_frame(FrameKind::Kernel).unwrap();
        assert!(a != b && b != c && a != c);
        assert_eq!(ppa.alloc_frame(FrameKind::User), Err(ErrorCode::NoMem));
        ppa.free_frame(b);
        assert_eq!(ppa.alloc_frame(FrameKind::User), Ok(b));
    }
}
