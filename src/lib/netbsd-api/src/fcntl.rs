use bytemuck::{Pod, Zeroable};

/// `fcntl` commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum FcntlCommand {
    F_DUPFD = 0,
    F_GETFD = 1,
    F_SETFD = 2,
    F_GETFL = 3,
    F_SETFL = 4,
    F_GETOWN = 5,
    F_SETOWN = 6,
    F_GETLK = 7,
    F_SETLK = 8,
    F_SETLKW = 9,
    F_CLOSEM = 10,
    F_MAXFD = 11,
    F_DUPFD_CLOEXEC = 12,
    F_GETNOSIGPIPE = 13,
    F_SETNOSIGPIPE = 14,
}

/// `struct flock`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Flock {
    pub l_start: i64,
    pub l_len: i64,
    pub l_pid: i32,
    pub l_type: i16,
    pub l_whence: i16,
}

static_assertions::assert_eq_size!(Flock, [u8; 24]);

/// Field offsets and sizes, for reporting reads of individual members.
pub mod flock_fields {
    use super::Flock;

    pub const L_START: (usize, usize) = (core::mem::offset_of!(Flock, l_start), 8);
    pub const L_LEN: (usize, usize) = (core::mem::offset_of!(Flock, l_len), 8);
    pub const L_TYPE: (usize, usize) = (core::mem::offset_of!(Flock, l_type), 2);
    pub const L_WHENCE: (usize, usize) = (core::mem::offset_of!(Flock, l_whence), 2);
}
