//! The kernel tick.
//!
//! The PIT fires [`crate::config::TICK_HZ`] times a second; each firing
//! lands here after the trampoline has saved the interrupted frame. One
//! tick advances the wrapping counter, releases expired sleepers, runs
//! every plugin's `tick` hook, and rotates the runnable ring (round
//! robin).

use crate::state::Kernel;

impl Kernel {
    /// Monotonic (wrapping) tick count.
    pub fn now(&self) -> u32 {
        self.ticks
    }

    /// One timer interrupt's worth of work.
    pub fn on_tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        self.drain_sleepers();
        for id in self.plugin_ids_snapshot() {
            let _ = self.with_plugin(id, |k, plugin| plugin.tick(k));
        }
        self.sched.rotate();
    }
}
