//! COM1 serial output for logging and panic diagnostics.

use core::fmt;

use spin::Mutex;

use super::port::{inb, outb};

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Standard 16550 bring-up: 38400 baud, 8N1, FIFO on.
    pub fn init(&mut self) {
        // SAFETY: the 16550 initialization sequence on the UART's own
        // register block.
        unsafe {
            outb(self.base + 1, 0x00); // disable UART interrupts
            outb(self.base + 3, 0x80); // DLAB on
            outb(self.base, 0x03); // divisor = 3 (38400 baud)
            outb(self.base + 1, 0x00);
            outb(self.base + 3, 0x03); // 8 bits, no parity, one stop
            outb(self.base + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
            outb(self.base + 4, 0x0B); // DTR | RTS | OUT2
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        // SAFETY: polling the line-status register then writing the data
        // register of an initialised UART.
        unsafe {
            while inb(self.base + 5) & 0x20 == 0 {}
            outb(self.base, byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

pub static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

pub fn init() {
    SERIAL.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}
