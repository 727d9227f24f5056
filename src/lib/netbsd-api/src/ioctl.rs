//! `ioctl` request encoding: `| dir (3 bits) | len (13 bits) | group (8) | num (8) |`.

pub const IOCPARM_SHIFT: u32 = 16;
pub const IOCPARM_MASK: u32 = 0x1fff;

pub const IOC_VOID: u32 = 0x2000_0000;
/// Copy parameters out of the kernel, i.e. the kernel writes user memory.
pub const IOC_OUT: u32 = 0x4000_0000;
/// Copy parameters into the kernel, i.e. the kernel reads user memory.
pub const IOC_IN: u32 = 0x8000_0000;
pub const IOC_DIRMASK: u32 = IOC_VOID | IOC_OUT | IOC_IN;

pub const fn ioc(dir: u32, group: u8, num: u8, len: usize) -> u32 {
    dir | ((len as u32 & IOCPARM_MASK) << IOCPARM_SHIFT) | ((group as u32) << 8) | num as u32
}

/// Parameter length encoded in a request.
pub const fn ioc_len(req: u32) -> usize {
    ((req >> IOCPARM_SHIFT) & IOCPARM_MASK) as usize
}

pub const fn ioc_dir(req: u32) -> u32 {
    req & IOC_DIRMASK
}

/// Get the terminal attributes (`struct termios`).
pub const TIOCGETA: u32 = ioc(IOC_OUT, b't', 19, crate::limits::TERMIOS_SIZE);
