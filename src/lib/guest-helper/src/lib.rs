//! Types shared between the syscall layer and the rest of the engine for
//! talking about guest registers and guest memory.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod page;
pub mod syscall_types;
