//! Kernel binary entry.
//!
//! On bare metal the real entry point is `_start` in
//! `arch::x86::boot`, pulled in by linking the library; this file only
//! exists so Cargo produces the kernel image. The host build gets a stub
//! `main` so `cargo test` and `cargo check` work on development machines.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
#[allow(unused_imports)]
use bracken_kernel as _;

#[cfg(not(target_os = "none"))]
fn main() {
    println!("bracken-kernel: host build; the kernel only runs on i686 bare metal.");
    println!("run `cargo test` for the host test suite.");
}
