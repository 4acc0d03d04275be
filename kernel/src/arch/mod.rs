//! Architecture-specific code.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;
