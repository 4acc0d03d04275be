//! Reference plugins shipped with the kernel.
//!
//! Each of these is an ordinary collaborator over the handle/plugin
//! interface: the core kernel knows them only by their registered ids.

pub mod display;
pub mod fs;
pub mod futex;
pub mod keyboard;
pub mod pipe;
pub mod shm;

extern crate alloc;

use alloc::boxed::Box;

use crate::error::KernelResult;
use crate::handle::plugin_ids;
use crate::state::Kernel;

/// Register the standard plugin set at its well-known ids.
pub fn register_defaults(
    kernel: &mut Kernel,
    display_dev: alloc::sync::Arc<spin::Mutex<dyn display::CharDisplay>>,
    filesys: alloc::sync::Arc<spin::Mutex<dyn fs::FileSys>>,
) -> KernelResult<()> {
    kernel.register_plugin(plugin_ids::FUTEX, Box::new(futex::FutexPlugin::new()))?;
    kernel.register_plugin(plugin_ids::FILE_SYS, Box::new(fs::FsPlugin::new(filesys)))?;
    kernel.register_plugin(plugin_ids::KEYBOARD, Box::new(keyboard::KeyboardPlugin::new()))?;
    kernel.register_plugin(
        plugin_ids::DISPLAY,
        Box::new(display::DisplayPlugin::new(display_dev)),
    )?;
    kernel.register_plugin(plugin_ids::PIPE, Box::new(pipe::PipePlugin::new()))?;
    kernel.register_plugin(plugin_ids::SHM, Box::new(shm::ShmPlugin::new()))?;
    Ok(())
}
