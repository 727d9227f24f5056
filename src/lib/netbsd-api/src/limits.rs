/// Maximum length of a path, including the terminating NUL.
pub const PATH_MAX: usize = 1024;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Bytes below the stack pointer that the amd64 ABI reserves for leaf
/// functions and that a signal frame must not clobber.
pub const STACK_REDZONE_SIZE: usize = 128;

/// `sizeof(struct lwpctl)`.
pub const LWPCTL_SIZE: usize = 8;

/// `sizeof(struct termios)`.
pub const TERMIOS_SIZE: usize = 44;

/// `sizeof(struct statvfs)`.
pub const STATVFS_SIZE: usize = 2304;

/// `sizeof(struct timespec)`.
pub const TIMESPEC_SIZE: usize = 16;

/// `sizeof(intptr_t)`, the kernel's semaphore id type.
pub const KSEM_ID_SIZE: usize = 8;

/// Longest LWP name, including the terminating NUL.
pub const MAXCOMLEN: usize = 16;

/// `sizeof(lwpid_t)`.
pub const LWPID_SIZE: usize = 4;
