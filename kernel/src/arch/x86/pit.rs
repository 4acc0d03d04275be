//! 8253/8254 programmable interval timer.

use super::port::outb;
use crate::config::TICK_HZ;

const PIT_CH0_DATA: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// Base oscillator frequency.
const PIT_HZ: u32 = 1_193_182;

/// Program channel 0 in square-wave mode at [`TICK_HZ`].
pub fn init() {
    let reload = (PIT_HZ / TICK_HZ) as u16;
    // SAFETY: command byte 0x36 = channel 0, lobyte/hibyte access,
    // square-wave mode, binary; followed by the reload value.
    unsafe {
        outb(PIT_CMD, 0x36);
        outb(PIT_CH0_DATA, (reload & 0xFF) as u8);
        outb(PIT_CH0_DATA, (reload >> 8) as u8);
    }
    log::info!("pit: {TICK_HZ} Hz (reload {reload})");
}
