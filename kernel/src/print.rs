// Print macros for kernel output

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::x86::vga::_print(format_args!($($arg)*)));
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::arch::x86::serial::_print(format_args!($($arg)*)));
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

// Stub implementations when there is no console (host builds use the
// standard test harness output instead).
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{ let _ = format_args!($($arg)*); }};
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[macro_export]
macro_rules! println {
    () => {};
    ($($arg:tt)*) => {{ let _ = format_args!($($arg)*); }};
}
