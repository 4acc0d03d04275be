//! Compile-time configuration constants.
//!
//! Table sizes here are ABI-adjacent: `MAX_PROCS` doubles as the "no
//! process" sentinel handed to userspace, and `MAX_THREADS_PER_PROC` is
//! capped at 32 because join vectors are 32-bit masks.

/// Maximum number of live or zombie processes. Also the null process id.
pub const MAX_PROCS: usize = 64;

/// Maximum threads per process. Must stay <= 32 so a join vector can name
/// every thread. Also the null thread id.
pub const MAX_THREADS_PER_PROC: usize = 32;

/// Maximum open handles per process. Also the null handle.
pub const MAX_HANDLES_PER_PROC: usize = 64;

/// Maximum registered plugins.
pub const MAX_PLUGINS: usize = 8;

/// Timer tick rate in Hz (PIT channel 0 reload is derived from this).
pub const TICK_HZ: u32 = 1000;

/// Pages in each per-thread user stack slot (demand-mapped from the top).
pub const USER_STACK_PAGES: usize = 64;
