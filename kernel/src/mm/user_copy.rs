//! Cross-address-space memory copies.
//!
//! These walk a target page directory page by page instead of loading it
//! into CR3, so a syscall handler can read a caller's buffer or deliver a
//! result into another process while staying on the kernel context. A bad
//! user pointer is an error value here, never a fault: each destination or
//! source page is validated (present, user-accessible, and writable when
//! storing) before its bytes are touched.

use crate::error::ErrorCode;
use crate::mm::page_table::page_offset;
use crate::mm::phys::FRAME_SIZE;
use crate::mm::vas::{AddrSpaceMgr, AddressSpace};

/// A partial copy: how many bytes made it, and why the rest did not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyFault {
    pub copied: usize,
    pub kind: ErrorCode,
}

pub type CopyResult = Result<(), CopyFault>;

impl From<CopyFault> for ErrorCode {
    fn from(fault: CopyFault) -> Self {
        fault.kind
    }
}

impl AddrSpaceMgr {
    /// Copy `src` into `space` at user address `u_dst`.
    pub fn copy_to_user(&self, space: AddressSpace, u_dst: u32, src: &[u8]) -> CopyResult {
        self.copy_user(space, u_dst, src.len(), true, |win_chunk, off, len| {
            win_chunk[..len].copy_from_slice(&src[off..off + len]);
        })
    }

    /// Copy `dst.len()` bytes out of `space` at user address `u_src`.
    pub fn copy_from_user(&self, space: AddressSpace, dst: &mut [u8], u_src: u32) -> CopyResult {
        self.copy_user(space, u_src, dst.len(), false, |win_chunk, off, len| {
            dst[off..off + len].copy_from_slice(&win_chunk[..len]);
        })
    }

    fn copy_user(
        &self,
        space: AddressSpace,
        u_addr: u32,
        total: usize,
        storing: bool,
        mut chunk_op: impl FnMut(&mut [u8], usize, usize),
    ) -> CopyResult {
        let mut copied = 0usize;
        while copied < total {
            let va = match u_addr.checked_add(copied as u32) {
                Some(va) => va,
                None => {
                    return Err(CopyFault {
                        copied,
                        kind: ErrorCode::InvalidRange,
                    })
                }
            };
            let pte = match self.translate(space, va) {
                Some(pte) => pte,
                None => {
                    return Err(CopyFault {
                        copied,
                        kind: ErrorCode::InvalidRange,
                    })
                }
            };
            if !pte.is_user() || (storing && !pte.is_writable()) {
                return Err(CopyFault {
                    copied,
                    kind: ErrorCode::NotPermitted,
                });
            }

            let offset = page_offset(va);
            let len = (FRAME_SIZE - offset).min(total - copied);
            let window = self.window();
            let frame_bytes = window.frame_bytes(pte.frame());
            chunk_op(&mut frame_bytes[offset..], copied, len);
            copied += len;
        }
        Ok(())
    }

    /// Read one little-endian `u32` from user space.
    pub fn read_user_u32(&self, space: AddressSpace, u_addr: u32) -> Result<u32, CopyFault> {
        let mut buf = [0u8; 4];
        self.copy_from_user(space, &mut buf, u_addr)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write one little-endian `u32` into user space.
    pub fn write_user_u32(&self, space: AddressSpace, u_addr: u32, value: u32) -> CopyResult {
        self.copy_to_user(space, u_addr, &value.to_le_bytes())
    }
}
