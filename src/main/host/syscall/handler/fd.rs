//! Syscalls that create or operate on file descriptors.

use std::mem::size_of;

use guest_helper::syscall_types::{ForeignPtr, SyscallReg};
use log::Level;
use netbsd_api::errno::Errno;
use netbsd_api::fcntl::{flock_fields, FcntlCommand, Flock};
use netbsd_api::ioctl::{ioc_dir, ioc_len, IOC_IN, IOC_OUT, TIOCGETA};
use netbsd_api::limits::{STATVFS_SIZE, TERMIOS_SIZE};

use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{SyscallError, SyscallFlags, SyscallResult};

impl SyscallHandler {
    pub fn close(ctx: &mut SyscallContext, fd: i32) -> Result<i32, SyscallError> {
        if !ctx.fd_allowed(fd, false) {
            return Err(Errno::EBADF.into());
        }
        Err(SyscallError::Native)
    }

    pub fn close_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        ctx.record_fd_close(i32::from(ctx.args.get(0)));
        Ok(rv)
    }

    pub fn pipe_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        // Both ends come back in registers.
        let fds = [i32::from(rv), ctx.reshi as i32];
        check_new_fds(ctx, &fds, "pipe")?;
        Ok(rv)
    }

    pub fn pipe2(
        ctx: &mut SyscallContext,
        fildes: ForeignPtr<[i32; 2]>,
        _flags: i32,
    ) -> Result<i32, SyscallError> {
        ctx.pre_mem_write("pipe2(fildes)", fildes.addr(), size_of::<[i32; 2]>());
        Err(SyscallError::Native)
    }

    pub fn pipe2_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let fildes: ForeignPtr<[i32; 2]> = ctx.args.get(0).into();
        ctx.post_mem_write(fildes.addr(), size_of::<[i32; 2]>());
        let fds = ctx.aspace().read_val(fildes)?;
        check_new_fds(ctx, &fds, "pipe2")?;
        Ok(rv)
    }

    pub fn ioctl(
        ctx: &mut SyscallContext,
        fd: i32,
        request: u64,
        arg: ForeignPtr<u8>,
    ) -> Result<i32, SyscallError> {
        // Requests are `u_long`, but only the low 32 bits are ever used.
        let request = request as u32;
        match request {
            TIOCGETA => ctx.pre_mem_write("ioctl(TIOCGETA)", arg.addr(), TERMIOS_SIZE),
            _ => {
                log_once_per_value_at_level!(
                    request,
                    u32,
                    Level::Warn,
                    Level::Debug,
                    "Unhandled ioctl {request:#x}; using its encoded size and direction"
                );
                let len = ioc_len(request);
                let dir = ioc_dir(request);
                if len > 0 && dir & IOC_IN != 0 {
                    ctx.pre_mem_read("ioctl(generic)", arg.addr(), len);
                }
                if len > 0 && dir & IOC_OUT != 0 {
                    ctx.pre_mem_write("ioctl(generic)", arg.addr(), len);
                }
            }
        }

        if !ctx.fd_allowed(fd, false) {
            return Err(Errno::EBADF.into());
        }
        Err(SyscallError::Native)
    }

    pub fn ioctl_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let request = u64::from(ctx.args.get(1)) as u32;
        let arg: ForeignPtr<u8> = ctx.args.get(2).into();

        match request {
            TIOCGETA => ctx.post_mem_write(arg.addr(), TERMIOS_SIZE),
            _ => {
                let len = ioc_len(request);
                if len > 0 && ioc_dir(request) & IOC_OUT != 0 {
                    ctx.post_mem_write(arg.addr(), len);
                }
            }
        }
        Ok(rv)
    }

    pub fn fcntl(ctx: &mut SyscallContext, fd: i32, cmd: i32, arg: u64) -> Result<i32, SyscallError> {
        use FcntlCommand::*;

        match FcntlCommand::try_from(cmd) {
            // No third argument.
            Ok(F_GETFD | F_GETFL | F_GETOWN | F_CLOSEM | F_MAXFD | F_GETNOSIGPIPE) => {
                log::trace!("fcntl({fd}, {cmd})");
            }
            Ok(F_DUPFD | F_DUPFD_CLOEXEC) => {
                log::trace!("fcntl({fd}, {cmd}, {})", arg as i32);
                if !ctx.fd_allowed(arg as i32, false) {
                    return Err(Errno::EBADF.into());
                }
            }
            Ok(F_SETFD | F_SETFL | F_SETOWN | F_SETNOSIGPIPE) => {
                log::trace!("fcntl({fd}, {cmd}, {})", arg as i32);
            }
            // A `struct flock *` third argument.
            Ok(command @ (F_GETLK | F_SETLK | F_SETLKW)) => {
                log::trace!("fcntl({fd}, {cmd}, {arg:#x})");
                let lock = arg as usize;
                for (what, (offset, size)) in [
                    ("fcntl(lock->l_start)", flock_fields::L_START),
                    ("fcntl(lock->l_len)", flock_fields::L_LEN),
                    ("fcntl(lock->l_type)", flock_fields::L_TYPE),
                    ("fcntl(lock->l_whence)", flock_fields::L_WHENCE),
                ] {
                    ctx.pre_mem_read(what, lock + offset, size);
                }
                match command {
                    F_GETLK => ctx.pre_mem_write("fcntl(arg)", lock, size_of::<Flock>()),
                    F_SETLKW => ctx.flags |= SyscallFlags::MAY_BLOCK,
                    _ => {}
                }
            }
            Err(_) => {
                log_once_per_value_at_level!(
                    cmd,
                    i32,
                    Level::Warn,
                    Level::Debug,
                    "fcntl: unknown command {cmd}; passing it through"
                );
            }
        }

        if !ctx.fd_allowed(fd, false) {
            return Err(Errno::EBADF.into());
        }
        Err(SyscallError::Native)
    }

    pub fn fcntl_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let cmd = i32::from(ctx.args.get(1));
        match FcntlCommand::try_from(cmd) {
            Ok(FcntlCommand::F_DUPFD | FcntlCommand::F_DUPFD_CLOEXEC) => {
                ctx.record_fd_open(i32::from(rv), "fcntl");
            }
            Ok(FcntlCommand::F_GETLK) => {
                let lock: ForeignPtr<Flock> = ctx.args.get(2).into();
                ctx.post_mem_write(lock.addr(), size_of::<Flock>());
            }
            _ => {}
        }
        Ok(rv)
    }

    pub fn fstatvfs1(
        ctx: &mut SyscallContext,
        fd: i32,
        buf: ForeignPtr<u8>,
        _flags: i32,
    ) -> Result<i32, SyscallError> {
        ctx.pre_mem_write("fstatvfs1(buf)", buf.addr(), STATVFS_SIZE);
        if !ctx.fd_allowed(fd, false) {
            return Err(Errno::EBADF.into());
        }
        Err(SyscallError::Native)
    }

    pub fn fstatvfs1_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let buf: ForeignPtr<u8> = ctx.args.get(1).into();
        ctx.post_mem_write(buf.addr(), STATVFS_SIZE);
        Ok(rv)
    }

    pub fn socket_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        check_new_fds(ctx, &[i32::from(rv)], "socket")?;
        Ok(rv)
    }
}

/// Takes back descriptors the kernel just handed out if any of them is one
/// the guest may not have, and otherwise records them.
fn check_new_fds(
    ctx: &mut SyscallContext,
    fds: &[i32],
    origin: &'static str,
) -> Result<(), SyscallError> {
    if fds.iter().all(|fd| ctx.fd_allowed(*fd, true)) {
        for fd in fds {
            ctx.record_fd_open(*fd, origin);
        }
        return Ok(());
    }

    for fd in fds {
        if let Err(e) = ctx.engine.kernel().close(*fd) {
            log::debug!("Couldn't close fd {fd} from {origin}: {e}");
        }
    }
    Err(Errno::EMFILE.into())
}

#[cfg(test)]
mod tests {
    use netbsd_api::syscall::SyscallNum;

    use crate::host::engine::EngineOptions;
    use crate::host::syscall::fd::FdPolicy;
    use crate::host::syscall::testing::{SyscallHarness, SCRATCH};
    use crate::host::tool::ToolEvent;

    use super::*;

    /// Descriptors 0 to 51 belong to the guest.
    fn harness(track_fds: bool) -> SyscallHarness {
        SyscallHarness::with_options(EngineOptions {
            fd_policy: FdPolicy::from_soft_limit(64, track_fds),
            ..Default::default()
        })
    }

    fn closed_fds(h: &SyscallHarness) -> Vec<u64> {
        h.te
            .kernel
            .calls_to(SyscallNum::NR_close)
            .iter()
            .map(|c| u64::from(c.get(0)))
            .collect()
    }

    #[test]
    fn test_pipe_records_both_ends() {
        let h = harness(true);
        h.te.kernel.set_result(SyscallNum::NR_pipe, Ok((3, 4)));
        assert_eq!(h.syscall(SyscallNum::NR_pipe, &[]), Ok((3, 4)));

        let guard = h.te.engine.lock();
        assert_eq!(guard.fds.get(3).unwrap().origin, "pipe");
        assert_eq!(guard.fds.get(4).unwrap().origin, "pipe");
    }

    #[test]
    fn test_close_forgets_fds() {
        let h = harness(true);
        h.te.kernel.set_result(SyscallNum::NR_pipe, Ok((3, 4)));
        h.syscall(SyscallNum::NR_pipe, &[]).unwrap();
        h.syscall(SyscallNum::NR_close, &[3]).unwrap();
        {
            let guard = h.te.engine.lock();
            assert!(guard.fds.get(3).is_none());
            assert_eq!(guard.fds.len(), 1);
        }

        h.syscall(SyscallNum::NR_close, &[4]).unwrap();
        assert!(h.te.engine.lock().fds.is_empty());
        assert_eq!(closed_fds(&h), vec![3, 4]);
    }

    #[test]
    fn test_failed_close_keeps_fd() {
        let h = harness(true);
        h.te.kernel.set_result(SyscallNum::NR_pipe, Ok((3, 4)));
        h.syscall(SyscallNum::NR_pipe, &[]).unwrap();
        h.te.kernel.set_result(SyscallNum::NR_close, Err(Errno::EINTR));
        assert_eq!(h.syscall(SyscallNum::NR_close, &[3]), Err(Errno::EINTR));
        assert_eq!(h.te.engine.lock().fds.len(), 2);
    }

    #[test]
    fn test_close_reserved_fd() {
        let h = harness(false);
        assert_eq!(h.syscall(SyscallNum::NR_close, &[60]), Err(Errno::EBADF));
        assert!(h.te.kernel.calls().is_empty());
    }

    #[test]
    fn test_pipe_into_reserved_range() {
        let h = harness(true);
        h.te.kernel.set_result(SyscallNum::NR_pipe, Ok((51, 52)));
        assert_eq!(h.syscall(SyscallNum::NR_pipe, &[]), Err(Errno::EMFILE));
        assert_eq!(closed_fds(&h), vec![51, 52]);
        assert!(h.te.engine.lock().fds.is_empty());
    }

    #[test]
    fn test_pipe2_reads_fds_from_memory() {
        let h = harness(true);
        h.write(SCRATCH, &[7i32, 60]);
        assert_eq!(
            h.syscall(SyscallNum::NR_pipe2, &[SCRATCH as u64, 0]),
            Err(Errno::EMFILE)
        );
        assert_eq!(closed_fds(&h), vec![7, 60]);

        let events = h.te.tool.events();
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PreMemWrite { what, addr, len: 8, .. }
                if what == "pipe2(fildes)" && *addr == SCRATCH
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PostMemWrite { addr, len: 8, .. } if *addr == SCRATCH
        )));
    }

    #[test]
    fn test_ioctl_tiocgeta() {
        let h = harness(false);
        h.syscall(SyscallNum::NR_ioctl, &[1, u64::from(TIOCGETA), SCRATCH as u64])
            .unwrap();
        let events = h.te.tool.events();
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PreMemWrite { what, len: TERMIOS_SIZE, .. } if what == "ioctl(TIOCGETA)"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PostMemWrite { len: TERMIOS_SIZE, .. }
        )));
    }

    #[test]
    fn test_ioctl_unknown_uses_encoding() {
        let h = harness(false);
        let req = netbsd_api::ioctl::ioc(IOC_IN, b'f', 126, 4);
        h.syscall(SyscallNum::NR_ioctl, &[1, u64::from(req), SCRATCH as u64])
            .unwrap();
        let events = h.te.tool.events();
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PreMemRead { what, len: 4, .. } if what == "ioctl(generic)"
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ToolEvent::PostMemWrite { .. })));
    }

    #[test]
    fn test_ioctl_bad_fd() {
        let h = harness(false);
        assert_eq!(
            h.syscall(SyscallNum::NR_ioctl, &[55, u64::from(TIOCGETA), SCRATCH as u64]),
            Err(Errno::EBADF)
        );
        assert!(h.te.kernel.calls().is_empty());
    }

    #[test]
    fn test_fcntl_dupfd() {
        let h = harness(true);
        h.te.kernel.set_result(SyscallNum::NR_fcntl, Ok((10, 0)));
        let dupfd = i32::from(FcntlCommand::F_DUPFD) as u64;
        assert_eq!(h.syscall(SyscallNum::NR_fcntl, &[3, dupfd, 10]), Ok((10, 0)));
        assert_eq!(h.te.engine.lock().fds.get(10).unwrap().origin, "fcntl");

        // Asking for a descriptor in the reserved range.
        assert_eq!(
            h.syscall(SyscallNum::NR_fcntl, &[3, dupfd, 60]),
            Err(Errno::EBADF)
        );
    }

    #[test]
    fn test_fcntl_getlk() {
        let h = harness(false);
        let getlk = i32::from(FcntlCommand::F_GETLK) as u64;
        h.syscall(SyscallNum::NR_fcntl, &[3, getlk, SCRATCH as u64])
            .unwrap();

        let events = h.te.tool.events();
        let reads: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ToolEvent::PreMemRead { what, addr, len, .. } => {
                    Some((what.as_str(), *addr - SCRATCH, *len))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            reads,
            vec![
                ("fcntl(lock->l_start)", 0, 8),
                ("fcntl(lock->l_len)", 8, 8),
                ("fcntl(lock->l_type)", 20, 2),
                ("fcntl(lock->l_whence)", 22, 2),
            ]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PostMemWrite { addr, len: 24, .. } if *addr == SCRATCH
        )));
    }

    #[test]
    fn test_fcntl_unknown_command_passes_through() {
        let h = harness(false);
        h.te.kernel.set_result(SyscallNum::NR_fcntl, Ok((1, 0)));
        assert_eq!(h.syscall(SyscallNum::NR_fcntl, &[3, 99, 0]), Ok((1, 0)));
    }

    #[test]
    fn test_socket_outside_allowed_range() {
        let h = harness(false);
        h.te.kernel.set_result(SyscallNum::NR___socket30, Ok((52, 0)));
        assert_eq!(
            h.syscall(SyscallNum::NR___socket30, &[2, 1, 0]),
            Err(Errno::EMFILE)
        );
        assert_eq!(closed_fds(&h), vec![52]);
    }

    #[test]
    fn test_fstatvfs1() {
        let h = harness(false);
        h.syscall(SyscallNum::NR_fstatvfs1, &[0, SCRATCH as u64, 1])
            .unwrap();
        assert!(h.te.tool.events().iter().any(|e| matches!(
            e,
            ToolEvent::PostMemWrite { len: STATVFS_SIZE, .. }
        )));
        assert_eq!(
            h.syscall(SyscallNum::NR_fstatvfs1, &[-1i64 as u64, SCRATCH as u64, 1]),
            Err(Errno::EBADF)
        );
    }
}
