//! The engine core: the guest's process image, its threads, and the
//! syscalls whose effects the engine has to see or change.

pub mod engine;
pub mod guest_state;
pub mod heap;
pub mod image;
pub mod kernel;
pub mod memory;
pub mod signals;
pub mod syscall;
pub mod thread;
pub mod tool;
pub mod translations;

#[cfg(test)]
pub mod testing;
