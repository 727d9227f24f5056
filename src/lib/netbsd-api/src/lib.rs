//! Type definitions and constants for the NetBSD amd64 kernel ABI, as seen by
//! a guest program. Does not depend on the `std` crate (i.e. is `no_std`) nor
//! libc, so that the values are the guest's even when the engine itself runs
//! on a different host.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod auxvec;
pub mod errno;
pub mod exec;
pub mod fcntl;
pub mod ioctl;
pub mod limits;
pub mod lwp;
pub mod mman;
pub mod signal;
pub mod syscall;
pub mod ucontext;
