//! Character-display plugin.
//!
//! Fronts a [`CharDisplay`] collaborator with write/cmd handles. On bare
//! metal the collaborator is the VGA text writer in `arch::x86::vga`; host
//! tests use the in-memory [`BufferDisplay`].

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{ErrorCode, KernelResult};
use crate::handle::{HandleState, Plugin, NULL_HANDLE};
use crate::process::{ProcId, ThreadKey};
use crate::state::Kernel;
use crate::syscall::SyscallOutcome;

/// Userspace plugin commands.
pub mod cmds {
    pub const OPEN: u16 = 0;
}

/// Handle commands beyond the defaults.
pub mod hcids {
    use crate::handle::hcid::NUM_DEFAULT;

    /// Writes `(columns, rows)` through two user out-pointers.
    pub const GET_DIMS: u16 = NUM_DEFAULT;
}

/// A character cell display the kernel can print into.
pub trait CharDisplay: Send {
    /// `(columns, rows)`.
    fn dims(&self) -> (u32, u32);

    /// Append raw bytes; the device interprets control characters.
    fn put_bytes(&mut self, bytes: &[u8]);
}

pub struct DisplayPlugin {
    display: Arc<Mutex<dyn CharDisplay>>,
}

impl DisplayPlugin {
    pub fn new(display: Arc<Mutex<dyn CharDisplay>>) -> Self {
        Self { display }
    }
}

impl Plugin for DisplayPlugin {
    fn cmd(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        cmd: u16,
        args: [u32; 4],
    ) -> SyscallOutcome {
        match cmd {
            cmds::OPEN => {
                let state = Box::new(DisplayHandleState {
                    display: Arc::clone(&self.display),
                });
                let res = match k.proc_mut(caller.pid) {
                    Ok(proc) => proc.handles.insert(state),
                    Err(e) => Err(e),
                };
                match res {
                    Ok(h) => SyscallOutcome::of(k.put_user_u32(caller.pid, args[0], h as u32)),
                    Err(e) => {
                        let _ = k.put_user_u32(caller.pid, args[0], NULL_HANDLE as u32);
                        SyscallOutcome::ret(e)
                    }
                }
            }
            _ => SyscallOutcome::ret(ErrorCode::NotImplemented),
        }
    }
}

struct DisplayHandleState {
    display: Arc<Mutex<dyn CharDisplay>>,
}

impl HandleState for DisplayHandleState {
    fn copy_for(&self, _k: &mut Kernel, _dst: ProcId) -> KernelResult<Box<dyn HandleState>> {
        Ok(Box::new(DisplayHandleState {
            display: Arc::clone(&self.display),
        }))
    }

    fn close(self: Box<Self>, _k: &mut Kernel, _owner: ProcId) {}

    fn write(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        u_src: u32,
        len: usize,
        written_ptr: u32,
    ) -> SyscallOutcome {
        let mut buf = alloc::vec![0u8; len];
        if let Err(e) = k.copy_from_proc(caller.pid, &mut buf, u_src) {
            return SyscallOutcome::ret(e);
        }
        self.display.lock().put_bytes(&buf);
        SyscallOutcome::of(k.put_user_u32(caller.pid, written_ptr, len as u32))
    }

    fn cmd(
        &mut self,
        k: &mut Kernel,
        caller: ThreadKey,
        cmd: u16,
        args: [u32; 4],
    ) -> SyscallOutcome {
        match cmd {
            hcids::GET_DIMS => {
                let (cols, rows) = self.display.lock().dims();
                let res = k
                    .put_user_u32(caller.pid, args[0], cols)
                    .and_then(|_| k.put_user_u32(caller.pid, args[1], rows));
                SyscallOutcome::of(res)
            }
            _ => SyscallOutcome::ret(ErrorCode::NotImplemented),
        }
    }

    fn is_display(&self) -> bool {
        true
    }
}

/// An in-memory display: fixed grid, newline-aware, scrolls by dropping
/// the top row. The host-test stand-in for the VGA text buffer.
pub struct BufferDisplay {
    cols: u32,
    rows: u32,
    cells: Vec<u8>,
    cursor: usize,
}

impl BufferDisplay {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            cells: alloc::vec![b' '; (cols * rows) as usize],
            cursor: 0,
        }
    }

    pub fn row_text(&self, row: u32) -> &[u8] {
        let start = (row * self.cols) as usize;
        &self.cells[start..start + self.cols as usize]
    }

    fn scroll(&mut self) {
        let cols = self.cols as usize;
        self.cells.copy_within(cols.., 0);
        let len = self.cells.len();
        self.cells[len - cols..].fill(b' ');
        self.cursor -= cols;
    }
}

impl CharDisplay for BufferDisplay {
    fn dims(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                let cols = self.cols as usize;
                self.cursor = (self.cursor / cols + 1) * cols;
            } else {
                self.cells[self.cursor] = b;
                self.cursor += 1;
            }
            if self.cursor >= self.cells.len() {
                self.scroll();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_display_writes_and_wraps_lines() {
        let mut d = BufferDisplay::new(8, 2);
        d.put_bytes(b"hi\nthere");
        assert_eq!(&d.row_text(0)[..2], b"hi");
        assert_eq!(&d.row_text(1)[..5], b"there");
    }

    #[test]
    fn buffer_display_scrolls() {
        let mut d = BufferDisplay::new(4, 2);
        d.put_bytes(b"aaaa");
        d.put_bytes(b"bbbb");
        d.put_bytes(b"cc");
        assert_eq!(d.row_text(0), b"bbbb");
        assert_eq!(&d.row_text(1)[..2], b"cc");
    }
}
