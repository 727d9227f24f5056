/// A NetBSD syscall number.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyscallNum(u32);

macro_rules! define_syscalls {
    ($($name:ident = $val:literal => $str:literal),+ $(,)?) => {
        #[allow(non_upper_case_globals)]
        impl SyscallNum {
            $(pub const $name: Self = Self($val);)+

            /// Every syscall number with a known name, in ascending order.
            pub const KNOWN: &'static [Self] = &[$(Self::$name),+];

            /// The kernel's name for this syscall, if known.
            pub const fn to_str(&self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some($str),)+
                    _ => None,
                }
            }
        }
    };
}

define_syscalls! {
    NR_syscall = 0 => "syscall",
    NR_exit = 1 => "exit",
    NR_fork = 2 => "fork",
    NR_read = 3 => "read",
    NR_write = 4 => "write",
    NR_open = 5 => "open",
    NR_close = 6 => "close",
    NR_unlink = 10 => "unlink",
    NR_chdir = 12 => "chdir",
    NR_chmod = 15 => "chmod",
    NR_break = 17 => "break",
    NR_getpid = 20 => "getpid",
    NR_getuid = 24 => "getuid",
    NR_geteuid = 25 => "geteuid",
    NR_recvmsg = 27 => "recvmsg",
    NR_sendmsg = 28 => "sendmsg",
    NR_recvfrom = 29 => "recvfrom",
    NR_accept = 30 => "accept",
    NR_getsockname = 32 => "getsockname",
    NR_access = 33 => "access",
    NR_kill = 37 => "kill",
    NR_pipe = 42 => "pipe",
    NR_getegid = 43 => "getegid",
    NR_getgid = 47 => "getgid",
    NR_ioctl = 54 => "ioctl",
    NR_readlink = 58 => "readlink",
    NR_execve = 59 => "execve",
    NR_munmap = 73 => "munmap",
    NR_mprotect = 74 => "mprotect",
    NR_getpgrp = 81 => "getpgrp",
    NR_dup2 = 90 => "dup2",
    NR_fcntl = 92 => "fcntl",
    NR_connect = 98 => "connect",
    NR_bind = 104 => "bind",
    NR_listen = 106 => "listen",
    NR_getsockopt = 118 => "getsockopt",
    NR_sendto = 133 => "sendto",
    NR_mkdir = 136 => "mkdir",
    NR_rmdir = 137 => "rmdir",
    NR_getrlimit = 194 => "getrlimit",
    NR_setrlimit = 195 => "setrlimit",
    NR_mmap = 197 => "mmap",
    NR___syscall = 198 => "__syscall",
    NR_lseek = 199 => "lseek",
    NR_ftruncate = 201 => "ftruncate",
    NR___sysctl = 202 => "__sysctl",
    NR_poll = 209 => "poll",
    NR_semget = 221 => "semget",
    NR_semop = 222 => "semop",
    NR__ksem_init = 247 => "_ksem_init",
    NR__ksem_post = 251 => "_ksem_post",
    NR__ksem_wait = 252 => "_ksem_wait",
    NR_mq_open = 257 => "mq_open",
    NR_mq_close = 258 => "mq_close",
    NR_mq_unlink = 259 => "mq_unlink",
    NR_mq_getattr = 260 => "mq_getattr",
    NR_mq_setattr = 261 => "mq_setattr",
    NR_mq_notify = 262 => "mq_notify",
    NR_mq_send = 263 => "mq_send",
    NR_mq_receive = 264 => "mq_receive",
    NR_minherit = 273 => "minherit",
    NR___sigaltstack14 = 281 => "__sigaltstack14",
    NR___vfork14 = 282 => "__vfork14",
    NR___sigprocmask14 = 293 => "__sigprocmask14",
    NR___sigsuspend14 = 294 => "__sigsuspend14",
    NR___getcwd = 296 => "__getcwd",
    NR_issetugid = 305 => "issetugid",
    NR_getcontext = 307 => "getcontext",
    NR_setcontext = 308 => "setcontext",
    NR__lwp_create = 309 => "_lwp_create",
    NR__lwp_exit = 310 => "_lwp_exit",
    NR__lwp_self = 311 => "_lwp_self",
    NR__lwp_suspend = 312 => "_lwp_suspend",
    NR__lwp_continue = 313 => "_lwp_continue",
    NR__lwp_wakeup = 315 => "_lwp_wakeup",
    NR__lwp_getprivate = 316 => "_lwp_getprivate",
    NR__lwp_setprivate = 317 => "_lwp_setprivate",
    NR__lwp_kill = 318 => "_lwp_kill",
    NR__lwp_unpark = 321 => "_lwp_unpark",
    NR__lwp_unpark_all = 322 => "_lwp_unpark_all",
    NR__lwp_setname = 323 => "_lwp_setname",
    NR__lwp_ctl = 325 => "_lwp_ctl",
    NR___sigaction_sigtramp = 340 => "__sigaction_sigtramp",
    NR_sched_yield = 350 => "sched_yield",
    NR_fstatvfs1 = 358 => "fstatvfs1",
    NR___getdents30 = 390 => "__getdents30",
    NR___socket30 = 394 => "__socket30",
    NR___select50 = 417 => "__select50",
    NR___gettimeofday50 = 418 => "__gettimeofday50",
    NR___setitimer50 = 425 => "__setitimer50",
    NR___clock_gettime50 = 427 => "__clock_gettime50",
    NR___nanosleep50 = 430 => "__nanosleep50",
    NR_____sigtimedwait50 = 431 => "____sigtimedwait50",
    NR___mq_timedsend50 = 432 => "__mq_timedsend50",
    NR___mq_timedreceive50 = 433 => "__mq_timedreceive50",
    NR___pselect50 = 436 => "__pselect50",
    NR___stat50 = 439 => "__stat50",
    NR___fstat50 = 440 => "__fstat50",
    NR_____semctl50 = 442 => "____semctl50",
    NR___wait450 = 449 => "__wait450",
    NR_pipe2 = 453 => "pipe2",
    NR____lwp_park60 = 478 => "___lwp_park60",
}

impl SyscallNum {
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    pub const fn val(&self) -> u32 {
        self.0
    }
}

impl From<SyscallNum> for u32 {
    fn from(val: SyscallNum) -> u32 {
        val.0
    }
}

impl From<u32> for SyscallNum {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl core::fmt::Debug for SyscallNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.to_str() {
            Some(name) => write!(f, "SyscallNum::NR_{name}"),
            None => write!(f, "SyscallNum::<{}>", self.0),
        }
    }
}

impl core::fmt::Display for SyscallNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.to_str() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "<unknown-syscall-{}>", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sorted() {
        for pair in SyscallNum::KNOWN.windows(2) {
            assert!(pair[0] < pair[1], "{:?} >= {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(SyscallNum::NR_break.to_str(), Some("break"));
        assert_eq!(SyscallNum::new(309).to_str(), Some("_lwp_create"));
        assert_eq!(SyscallNum::new(9999).to_str(), None);
        assert_eq!(format!("{}", SyscallNum::new(9999)), "<unknown-syscall-9999>");
    }
}
