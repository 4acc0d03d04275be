//! Memory management: physical frames, page directories, user copies.

pub mod frame_allocator;
pub mod heap;
pub mod layout;
pub mod page_table;
pub mod phys;
pub mod user_copy;
pub mod vas;

pub use frame_allocator::{FrameAllocator, FrameKind, RangeOutcome};
pub use page_table::{PageTableEntry, PteFlags};
pub use phys::{Frame, PhysAddr, PhysWindow, FRAME_SIZE};
pub use user_copy::{CopyFault, CopyResult};
pub use vas::{AddrSpaceMgr, AddressSpace, VirtRangeOutcome};
