//! Kernel error codes.
//!
//! A single 16-bit error domain is shared by every kernel subsystem and by
//! the syscall ABI: whatever a syscall returns in `eax` is one of these
//! codes zero-extended to 32 bits. Keeping one domain (instead of per-module
//! error enums that get flattened at the boundary) means a code produced
//! deep inside the memory manager survives unchanged all the way to user
//! space.

use core::fmt;

/// Error codes visible to both kernel code and userspace.
///
/// The numeric values are ABI: they are returned to user programs in `eax`
/// and written through user out-pointers, so they must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
#[repr(u16)]
pub enum ErrorCode {
    /// Operation completed.
    Success = 0,
    /// Unspecified failure.
    Unknown = 1,
    /// A value that was expected to be aligned was not.
    AlignError = 2,
    /// A range's end is below its start, or the range is out of bounds.
    InvalidRange = 3,
    /// A given argument is invalid for an unspecified reason.
    BadArgs = 4,
    /// Lack of memory stopped the operation from completing.
    NoMem = 5,
    /// An index does not name a present entry.
    InvalidIndex = 6,
    /// A fixed-size table is full.
    NoSpace = 7,
    /// No item is ready or available.
    Empty = 8,
    /// Conflict with an existing entry.
    InUse = 9,
    /// A frame or page is already mapped.
    AlreadyAllocated = 10,
    /// The operation does not apply to the object's current state.
    StateMismatch = 11,
    /// The object has been torn down.
    Inactive = 12,
    /// The requested hook or operation is absent.
    NotImplemented = 13,
    /// Policy denial.
    NotPermitted = 14,
}

impl ErrorCode {
    /// Decode a code previously passed through a `u32` register.
    ///
    /// Unknown numeric values collapse to [`ErrorCode::Unknown`]; the wire
    /// format is not trusted.
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Success,
            2 => Self::AlignError,
            3 => Self::InvalidRange,
            4 => Self::BadArgs,
            5 => Self::NoMem,
            6 => Self::InvalidIndex,
            7 => Self::NoSpace,
            8 => Self::Empty,
            9 => Self::InUse,
            10 => Self::AlreadyAllocated,
            11 => Self::StateMismatch,
            12 => Self::Inactive,
            13 => Self::NotImplemented,
            14 => Self::NotPermitted,
            _ => Self::Unknown,
        }
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Unknown => "unknown error",
            Self::AlignError => "alignment error",
            Self::InvalidRange => "invalid range",
            Self::BadArgs => "bad arguments",
            Self::NoMem => "out of memory",
            Self::InvalidIndex => "invalid index",
            Self::NoSpace => "table full",
            Self::Empty => "nothing available",
            Self::InUse => "in use",
            Self::AlreadyAllocated => "already allocated",
            Self::StateMismatch => "state mismatch",
            Self::Inactive => "object inactive",
            Self::NotImplemented => "not implemented",
            Self::NotPermitted => "not permitted",
        };
        f.write_str(s)
    }
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, ErrorCode>;

/// Convert a result into the `u32` that lands in a user register.
pub fn code_of<T>(res: &KernelResult<T>) -> u32 {
    match res {
        Ok(_) => ErrorCode::Success.as_u32(),
        Err(e) => e.as_u32(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u32() {
        for raw in 0..=14u32 {
            let code = ErrorCode::from_u32(raw);
            assert_eq!(code.as_u32(), raw);
        }
    }

    #[test]
    fn unknown_values_collapse() {
        assert_eq!(ErrorCode::from_u32(0xFFFF), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_u32(1), ErrorCode::Unknown);
    }
}
