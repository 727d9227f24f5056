//! The NetBSD syscall table: which handlers run for which syscall number.

use std::collections::BTreeMap;

use guest_helper::syscall_types::SyscallReg;
use netbsd_api::syscall::SyscallNum;

use crate::host::syscall::handler::{SyscallContext, SyscallHandler, SyscallHandlerFn};
use crate::host::syscall::types::{SyscallFlags, SyscallResult};

/// Runs before the kernel sees the syscall. Returning
/// [`SyscallError::Native`](crate::host::syscall::types::SyscallError::Native)
/// passes the call to the kernel; anything else is the result.
pub type PreFn = fn(&mut SyscallContext) -> SyscallResult;

/// Runs after a successful syscall with its result, and may replace it.
pub type PostFn = fn(&mut SyscallContext, SyscallReg) -> SyscallResult;

#[derive(Copy, Clone)]
pub struct SyscallEntry {
    pub name: &'static str,
    /// Number of arguments, for reporting register reads.
    pub nargs: usize,
    /// `None` if the kernel runs the syscall as the guest issued it.
    pub pre: Option<PreFn>,
    pub post: Option<PostFn>,
    pub flags: SyscallFlags,
}

impl std::fmt::Debug for SyscallEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallEntry")
            .field("name", &self.name)
            .field("nargs", &self.nargs)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("flags", &self.flags)
            .finish()
    }
}

impl SyscallEntry {
    /// An entry that lets the kernel run the syscall unmodified.
    pub const fn pass_through(name: &'static str, nargs: usize, flags: SyscallFlags) -> Self {
        Self {
            name,
            nargs,
            pre: None,
            post: None,
            flags,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.pre.is_none() && self.post.is_none()
    }
}

const NONE: SyscallFlags = SyscallFlags::empty();
const BLOCK: SyscallFlags = SyscallFlags::MAY_BLOCK;

#[derive(Debug)]
pub struct SyscallTable {
    entries: BTreeMap<SyscallNum, SyscallEntry>,
    unknown: SyscallEntry,
}

impl SyscallTable {
    pub fn new() -> Self {
        let mut table = Self {
            entries: BTreeMap::new(),
            unknown: SyscallEntry::pass_through("unknown-syscall", 0, NONE),
        };

        macro_rules! handle {
            ($f:ident) => {
                |ctx| SyscallHandlerFn::call(SyscallHandler::$f, ctx)
            };
        }

        // Syscalls we do something special for.
        //
        // The indirect forms would need to be decoded to be checked properly;
        // for now the kernel deals with them.
        table.native(SyscallNum::NR_syscall, 0, None, BLOCK);
        table.native(SyscallNum::NR___syscall, 0, None, BLOCK);
        table.add(SyscallNum::NR_exit, 1, handle!(exit), None, NONE);
        table.add(SyscallNum::NR_break, 1, handle!(brk), None, NONE);
        table.add(
            SyscallNum::NR_close,
            1,
            handle!(close),
            Some(SyscallHandler::close_post),
            NONE,
        );
        table.native(SyscallNum::NR_pipe, 0, Some(SyscallHandler::pipe_post), NONE);
        table.add(
            SyscallNum::NR_ioctl,
            3,
            handle!(ioctl),
            Some(SyscallHandler::ioctl_post),
            BLOCK,
        );
        table.add(
            SyscallNum::NR_fcntl,
            3,
            handle!(fcntl),
            Some(SyscallHandler::fcntl_post),
            NONE,
        );
        table.add(SyscallNum::NR_mmap, 7, handle!(mmap), None, NONE);
        // lseek(fd, pad, offset, whence) and ftruncate(fd, pad, length).
        table.native(SyscallNum::NR_lseek, 4, None, NONE);
        table.native(SyscallNum::NR_ftruncate, 3, None, BLOCK);
        table.add(
            SyscallNum::NR___sysctl,
            6,
            handle!(sysctl),
            Some(SyscallHandler::sysctl_post),
            NONE,
        );
        table.add(
            SyscallNum::NR__ksem_init,
            2,
            handle!(ksem_init),
            Some(SyscallHandler::ksem_init_post),
            NONE,
        );
        table.native(SyscallNum::NR__ksem_post, 1, None, NONE);
        table.native(SyscallNum::NR__ksem_wait, 1, None, BLOCK);
        table.native(SyscallNum::NR_minherit, 3, None, NONE);
        table.native(SyscallNum::NR_issetugid, 0, None, NONE);
        table.add(SyscallNum::NR_getcontext, 1, handle!(getcontext), None, NONE);
        table.add(SyscallNum::NR_setcontext, 1, handle!(setcontext), None, NONE);
        table.add(SyscallNum::NR__lwp_create, 3, handle!(lwp_create), None, NONE);
        table.add(SyscallNum::NR__lwp_exit, 0, handle!(lwp_exit), None, NONE);
        table.native(SyscallNum::NR__lwp_self, 0, None, NONE);
        table.native(SyscallNum::NR__lwp_suspend, 1, None, BLOCK);
        table.native(SyscallNum::NR__lwp_continue, 1, None, NONE);
        table.native(SyscallNum::NR__lwp_wakeup, 1, None, NONE);
        table.add(
            SyscallNum::NR__lwp_getprivate,
            0,
            handle!(lwp_getprivate),
            None,
            NONE,
        );
        table.add(
            SyscallNum::NR__lwp_setprivate,
            1,
            handle!(lwp_setprivate),
            None,
            NONE,
        );
        table.add(
            SyscallNum::NR__lwp_kill,
            2,
            handle!(lwp_kill),
            None,
            SyscallFlags::POLL_AFTER,
        );
        table.native(SyscallNum::NR__lwp_unpark, 2, None, NONE);
        table.add(
            SyscallNum::NR__lwp_unpark_all,
            3,
            handle!(lwp_unpark_all),
            None,
            NONE,
        );
        table.add(
            SyscallNum::NR__lwp_setname,
            2,
            handle!(lwp_setname),
            Some(SyscallHandler::lwp_setname_post),
            NONE,
        );
        table.add(
            SyscallNum::NR__lwp_ctl,
            2,
            handle!(lwp_ctl),
            Some(SyscallHandler::lwp_ctl_post),
            NONE,
        );
        table.add(
            SyscallNum::NR___sigaction_sigtramp,
            5,
            handle!(sigaction_sigtramp),
            Some(SyscallHandler::sigaction_sigtramp_post),
            NONE,
        );
        table.native(SyscallNum::NR_sched_yield, 0, None, BLOCK);
        table.add(
            SyscallNum::NR_fstatvfs1,
            3,
            handle!(fstatvfs1),
            Some(SyscallHandler::fstatvfs1_post),
            BLOCK,
        );
        table.native(
            SyscallNum::NR___socket30,
            3,
            Some(SyscallHandler::socket_post),
            NONE,
        );
        table.add(SyscallNum::NR____lwp_park60, 6, handle!(lwp_park), None, BLOCK);
        table.add(
            SyscallNum::NR_pipe2,
            2,
            handle!(pipe2),
            Some(SyscallHandler::pipe2_post),
            NONE,
        );

        // Everything else the kernel runs as-is.
        for (nr, nargs, flags) in [
            (SyscallNum::NR_fork, 0, NONE),
            (SyscallNum::NR_read, 3, BLOCK),
            (SyscallNum::NR_write, 3, BLOCK),
            (SyscallNum::NR_open, 3, BLOCK),
            (SyscallNum::NR_unlink, 1, NONE),
            (SyscallNum::NR_chdir, 1, NONE),
            (SyscallNum::NR_chmod, 2, NONE),
            (SyscallNum::NR_getpid, 0, NONE),
            (SyscallNum::NR_getuid, 0, NONE),
            (SyscallNum::NR_geteuid, 0, NONE),
            (SyscallNum::NR_recvmsg, 3, BLOCK),
            (SyscallNum::NR_sendmsg, 3, BLOCK),
            (SyscallNum::NR_recvfrom, 6, BLOCK),
            (SyscallNum::NR_accept, 3, BLOCK),
            (SyscallNum::NR_getsockname, 3, NONE),
            (SyscallNum::NR_access, 2, NONE),
            (SyscallNum::NR_kill, 2, SyscallFlags::POLL_AFTER),
            (SyscallNum::NR_getegid, 0, NONE),
            (SyscallNum::NR_getgid, 0, NONE),
            (SyscallNum::NR_readlink, 3, NONE),
            (SyscallNum::NR_execve, 3, NONE),
            (SyscallNum::NR_munmap, 2, NONE),
            (SyscallNum::NR_mprotect, 3, NONE),
            (SyscallNum::NR_getpgrp, 0, NONE),
            (SyscallNum::NR_dup2, 2, NONE),
            (SyscallNum::NR_connect, 3, BLOCK),
            (SyscallNum::NR_bind, 3, NONE),
            (SyscallNum::NR_listen, 2, NONE),
            (SyscallNum::NR_getsockopt, 5, NONE),
            (SyscallNum::NR_sendto, 6, BLOCK),
            (SyscallNum::NR_mkdir, 2, NONE),
            (SyscallNum::NR_rmdir, 1, NONE),
            (SyscallNum::NR_getrlimit, 2, NONE),
            (SyscallNum::NR_setrlimit, 2, NONE),
            (SyscallNum::NR_poll, 3, BLOCK),
            (SyscallNum::NR_semget, 3, NONE),
            (SyscallNum::NR_semop, 3, BLOCK),
            (SyscallNum::NR_mq_open, 4, NONE),
            (SyscallNum::NR_mq_close, 1, NONE),
            (SyscallNum::NR_mq_unlink, 1, NONE),
            (SyscallNum::NR_mq_getattr, 2, NONE),
            (SyscallNum::NR_mq_setattr, 3, NONE),
            (SyscallNum::NR_mq_notify, 2, NONE),
            (SyscallNum::NR_mq_send, 4, BLOCK),
            (SyscallNum::NR_mq_receive, 4, BLOCK),
            (SyscallNum::NR___sigaltstack14, 2, NONE),
            (SyscallNum::NR___vfork14, 0, NONE),
            (SyscallNum::NR___sigprocmask14, 3, NONE),
            (SyscallNum::NR___sigsuspend14, 1, BLOCK),
            (SyscallNum::NR___getcwd, 2, NONE),
            (SyscallNum::NR___getdents30, 3, NONE),
            (SyscallNum::NR___select50, 5, BLOCK),
            (SyscallNum::NR___gettimeofday50, 2, NONE),
            (SyscallNum::NR___setitimer50, 3, NONE),
            (SyscallNum::NR___clock_gettime50, 2, NONE),
            (SyscallNum::NR___nanosleep50, 2, BLOCK),
            (SyscallNum::NR_____sigtimedwait50, 3, BLOCK),
            (SyscallNum::NR___mq_timedsend50, 5, BLOCK),
            (SyscallNum::NR___mq_timedreceive50, 5, BLOCK),
            (SyscallNum::NR___pselect50, 6, BLOCK),
            (SyscallNum::NR___stat50, 2, NONE),
            (SyscallNum::NR___fstat50, 2, NONE),
            (SyscallNum::NR_____semctl50, 4, NONE),
            (SyscallNum::NR___wait450, 4, BLOCK),
        ] {
            table.native(nr, nargs, None, flags);
        }

        table
    }

    fn add(
        &mut self,
        nr: SyscallNum,
        nargs: usize,
        pre: PreFn,
        post: Option<PostFn>,
        flags: SyscallFlags,
    ) {
        self.insert(nr, nargs, Some(pre), post, flags);
    }

    fn native(
        &mut self,
        nr: SyscallNum,
        nargs: usize,
        post: Option<PostFn>,
        flags: SyscallFlags,
    ) {
        self.insert(nr, nargs, None, post, flags);
    }

    fn insert(
        &mut self,
        nr: SyscallNum,
        nargs: usize,
        pre: Option<PreFn>,
        post: Option<PostFn>,
        flags: SyscallFlags,
    ) {
        let name = nr.to_str().unwrap_or("unknown-syscall");
        let entry = SyscallEntry {
            name,
            nargs,
            pre,
            post,
            flags,
        };
        let prev = self.entries.insert(nr, entry);
        assert!(prev.is_none(), "syscall {nr} added twice");
    }

    /// The entry for `nr`. Numbers with no entry get one that forwards the
    /// call to the kernel unmodified.
    pub fn get(&self, nr: SyscallNum) -> &SyscallEntry {
        match self.entries.get(&nr) {
            Some(entry) => entry,
            None => {
                log_once_per_value_at_level!(
                    nr,
                    SyscallNum,
                    log::Level::Debug,
                    log::Level::Trace,
                    "No wrapper for syscall {nr}; passing it through"
                );
                &self.unknown
            }
        }
    }

    pub fn contains(&self, nr: SyscallNum) -> bool {
        self.entries.contains_key(&nr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
