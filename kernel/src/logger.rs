//! The kernel logger behind the `log` façade.
//!
//! Everything goes to COM1; warnings and errors are mirrored to the VGA
//! console so they are visible without a serial cable. Host builds never
//! initialise this; tests run against `log`'s default no-op logger.

#![cfg(all(target_arch = "x86", target_os = "none"))]

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!("[{:5}] {}", record.level(), record.args());
        if record.level() <= Level::Warn {
            crate::println!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
