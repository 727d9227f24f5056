//! Types used in emulating syscalls.

use std::marker::PhantomData;
use std::mem::size_of;

use guest_helper::syscall_types::{ForeignPtr, SyscallReg};
use log::Level::Debug;
use log::*;
use netbsd_api::errno::Errno;

use crate::host::memory::MemError;

/// Wrapper around a [`ForeignPtr`] that encapsulates its size.
#[derive(Copy, Clone)]
pub struct ForeignArrayPtr<T> {
    base: ForeignPtr<T>,
    count: usize,
    _phantom: PhantomData<T>,
}

impl<T> std::fmt::Debug for ForeignArrayPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignArrayPtr")
            .field("base", &self.base)
            .field("count", &self.count)
            .field("size_of::<T>", &size_of::<T>())
            .finish()
    }
}

impl<T> ForeignArrayPtr<T> {
    /// Creates a typed pointer. Note though that the pointer *isn't* guaranteed
    /// to be aligned for `T`.
    pub fn new(ptr: ForeignPtr<T>, count: usize) -> Self {
        if log_enabled!(Debug) && usize::from(ptr) % std::mem::align_of::<T>() != 0 {
            // The kernel accepts unaligned pointers from user space, and so do
            // we, but it's a hint if something goes wrong afterwards.
            debug!("Creating unaligned pointer {ptr:?}");
        }
        ForeignArrayPtr {
            base: ptr,
            count,
            _phantom: PhantomData,
        }
    }

    pub fn ptr(&self) -> ForeignPtr<T> {
        self.base
    }

    /// Number of items pointed to.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// Size of the whole array in bytes.
    pub fn len_bytes(&self) -> usize {
        self.count * size_of::<T>()
    }

    pub fn cast_u8(&self) -> ForeignArrayPtr<u8> {
        ForeignArrayPtr::new(self.base.cast::<u8>(), self.len_bytes())
    }
}

// Calling all of these errors is stretching the semantics of 'error' a bit,
// but it makes for fluent programming in syscall handlers using the `?` operator.
#[derive(Debug, PartialEq, Eq)]
pub enum SyscallError {
    Failed(Failed),
    /// Let the real kernel execute the syscall as the guest issued it.
    Native,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Failed {
    pub errno: Errno,
    pub restartable: bool,
}

pub type SyscallResult = Result<SyscallReg, SyscallError>;

impl From<Errno> for SyscallError {
    fn from(e: Errno) -> Self {
        SyscallError::Failed(Failed {
            errno: e,
            restartable: false,
        })
    }
}

impl From<MemError> for SyscallError {
    fn from(e: MemError) -> Self {
        debug!("Guest memory access failed: {e}");
        SyscallError::from(Errno::from(e))
    }
}

impl From<std::io::Error> for SyscallError {
    fn from(e: std::io::Error) -> Self {
        match e
            .raw_os_error()
            .and_then(|e| u16::try_from(e).ok())
            .and_then(|e| Errno::try_from(e).ok())
        {
            Some(errno) => SyscallError::from(errno),
            None => {
                let default = Errno::ENOTSUP;
                warn!("Mapping error {} to {}", e, default);
                SyscallError::from(default)
            }
        }
    }
}

impl SyscallError {
    pub fn new_interrupted(restartable: bool) -> Self {
        Self::Failed(Failed {
            errno: Errno::EINTR,
            restartable,
        })
    }

    pub fn errno(&self) -> Option<Errno> {
        match self {
            SyscallError::Failed(f) => Some(f.errno),
            SyscallError::Native => None,
        }
    }
}

bitflags::bitflags! {
    /// How the dispatcher treats a syscall once its pre-handler has run.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SyscallFlags: u32 {
        /// The kernel call may put the thread to sleep; release the big lock
        /// around it.
        const MAY_BLOCK = 1 << 0;
        /// Check for pending signals once the syscall is done.
        const POLL_AFTER = 1 << 1;
        /// The handler has already written the guest's registers.
        const NO_WRITE_RESULT = 1 << 2;
    }
}
