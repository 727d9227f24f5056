//! The real kernel underneath the guest.

use guest_helper::syscall_types::SyscallArgs;
use netbsd_api::errno::Errno;
use netbsd_api::lwp::LwpFlags;
use netbsd_api::syscall::SyscallNum;

use crate::host::memory::EngineStack;

/// Entry point of a new LWP.
pub type LwpMain = Box<dyn FnOnce() + Send + 'static>;

pub trait Kernel: Send + Sync {
    /// Issues a syscall exactly as the guest asked. On success returns the
    /// `%rax` and `%rdx` results.
    fn syscall(&self, args: &SyscallArgs) -> Result<(u64, u64), Errno>;

    fn close(&self, fd: i32) -> Result<(), Errno> {
        self.syscall(&SyscallArgs::new(SyscallNum::NR_close, &[fd as u64]))
            .map(|_| ())
    }

    /// Starts a new LWP running `main` on `stack`, with every signal blocked.
    /// `flags` are the guest's `_lwp_create` flags. Returns the new LWP's id.
    fn create_lwp(
        &self,
        stack: &EngineStack,
        flags: LwpFlags,
        main: LwpMain,
    ) -> Result<u32, Errno>;

    /// Id of the calling LWP.
    fn current_lwpid(&self) -> u32;

    fn getpid(&self) -> i32;
}

/// The host kernel.
#[derive(Debug, Default)]
pub struct NativeKernel;

impl NativeKernel {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(all(target_os = "netbsd", target_arch = "x86_64"))]
fn raw_syscall(args: &SyscallArgs) -> Result<(u64, u64), Errno> {
    let a: [u64; 8] = std::array::from_fn(|i| u64::from(args.get(i)));
    let mut rax = u64::from(args.number().val());
    let rdx: u64;
    let failed: u8;
    // SAFETY: the guest asked for this syscall with these arguments; memory
    // it touches is guest memory. Arguments past the sixth go on the stack
    // where the kernel expects them, above a return address slot.
    unsafe {
        core::arch::asm!(
            "sub rsp, 24",
            "mov [rsp + 8], {a6}",
            "mov [rsp + 16], {a7}",
            "syscall",
            "setc {failed}",
            "add rsp, 24",
            a6 = in(reg) a[6],
            a7 = in(reg) a[7],
            failed = out(reg_byte) failed,
            inout("rax") rax,
            in("rdi") a[0],
            in("rsi") a[1],
            inout("rdx") a[2] => rdx,
            in("r10") a[3],
            in("r8") a[4],
            in("r9") a[5],
            out("rcx") _,
            out("r11") _,
        );
    }
    if failed != 0 {
        Err(Errno::try_from(rax).unwrap_or(Errno::ENOSYS))
    } else {
        Ok((rax, rdx))
    }
}

#[cfg(not(all(target_os = "netbsd", target_arch = "x86_64")))]
fn raw_syscall(args: &SyscallArgs) -> Result<(u64, u64), Errno> {
    log_once_per_value_at_level!(
        args.number(),
        SyscallNum,
        log::Level::Warn,
        log::Level::Debug,
        "Can't forward syscall {} on this host",
        args.number()
    );
    Err(Errno::ENOSYS)
}

/// Maps a host error to the guest's numbering.
fn errno_from_host(e: nix::errno::Errno) -> Errno {
    use nix::errno::Errno as H;
    match e {
        H::EAGAIN => Errno::EAGAIN,
        H::ENOMEM => Errno::ENOMEM,
        H::EINVAL => Errno::EINVAL,
        H::EPERM => Errno::EPERM,
        H::EFAULT => Errno::EFAULT,
        H::EBADF => Errno::EBADF,
        H::EMFILE => Errno::EMFILE,
        other => {
            log::debug!("No guest equivalent for host error {other}");
            Errno::ENOSYS
        }
    }
}

struct LwpStart {
    main: LwpMain,
    lwpid: crossbeam::channel::Sender<u32>,
}

extern "C" fn lwp_trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    // SAFETY: `create_lwp` passes ownership of a boxed `LwpStart`.
    let start = unsafe { Box::from_raw(arg as *mut LwpStart) };
    let LwpStart { main, lwpid } = *start;
    // The parent only stops waiting if it has given up on us.
    if lwpid.send(current_lwpid()).is_err() {
        return std::ptr::null_mut();
    }
    drop(lwpid);
    main();
    std::ptr::null_mut()
}

pub(crate) fn current_lwpid() -> u32 {
    #[cfg(target_os = "netbsd")]
    {
        // SAFETY: no preconditions.
        (unsafe { libc::_lwp_self() }) as u32
    }
    #[cfg(target_os = "linux")]
    {
        nix::unistd::gettid().as_raw() as u32
    }
    #[cfg(not(any(target_os = "netbsd", target_os = "linux")))]
    {
        0
    }
}

impl Kernel for NativeKernel {
    fn syscall(&self, args: &SyscallArgs) -> Result<(u64, u64), Errno> {
        raw_syscall(args)
    }

    fn close(&self, fd: i32) -> Result<(), Errno> {
        nix::unistd::close(fd).map_err(errno_from_host)
    }

    /// `stack` must be real memory in this process.
    ///
    /// The LWP is always detached, whatever `flags` say: nothing joins an
    /// engine thread. A suspended LWP is stopped before this returns, while
    /// it is still waiting for the big lock its creator holds.
    fn create_lwp(
        &self,
        stack: &EngineStack,
        flags: LwpFlags,
        main: LwpMain,
    ) -> Result<u32, Errno> {
        use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

        let unknown = flags.difference(LwpFlags::all());
        if !unknown.is_empty() {
            log::debug!("Ignoring unknown _lwp_create flags {:#x}", unknown.bits());
        }

        // The new LWP inherits our mask; block everything until its thread
        // has the big lock.
        let mut old_mask = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_SETMASK,
            Some(&SigSet::all()),
            Some(&mut old_mask),
        )
        .map_err(errno_from_host)?;

        let (tx, rx) = crossbeam::channel::bounded(1);
        let start = Box::into_raw(Box::new(LwpStart { main, lwpid: tx }));

        // SAFETY: `attr` is initialized before use and destroyed after.
        // `stack` is a mapping owned by the engine that is never freed.
        let rv = unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            let mut rv = libc::pthread_attr_init(&mut attr);
            if rv == 0 {
                rv = libc::pthread_attr_setstack(
                    &mut attr,
                    stack.base as *mut libc::c_void,
                    stack.size,
                );
            }
            if rv == 0 {
                rv = libc::pthread_attr_setdetachstate(&mut attr, libc::PTHREAD_CREATE_DETACHED);
            }
            if rv == 0 {
                let mut thread: libc::pthread_t = std::mem::zeroed();
                rv = libc::pthread_create(&mut thread, &attr, lwp_trampoline, start.cast());
            }
            libc::pthread_attr_destroy(&mut attr);
            rv
        };

        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None).map_err(errno_from_host)?;

        if rv != 0 {
            // SAFETY: the thread wasn't created, so we still own `start`.
            drop(unsafe { Box::from_raw(start) });
            return Err(errno_from_host(nix::errno::Errno::from_i32(rv)));
        }

        let lwpid = rx.recv().map_err(|_| {
            log::error!("New LWP exited before reporting its id");
            Errno::EAGAIN
        })?;

        if flags.contains(LwpFlags::LWP_SUSPENDED) {
            let args = SyscallArgs::new(SyscallNum::NR__lwp_suspend, &[u64::from(lwpid)]);
            if let Err(e) = self.syscall(&args) {
                log::warn!("Couldn't suspend new lwp {lwpid}: {e}");
            }
        }

        Ok(lwpid)
    }

    fn current_lwpid(&self) -> u32 {
        current_lwpid()
    }

    fn getpid(&self) -> i32 {
        nix::unistd::getpid().as_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_from_host() {
        assert_eq!(errno_from_host(nix::errno::Errno::EAGAIN), Errno::EAGAIN);
        assert_eq!(errno_from_host(nix::errno::Errno::EMFILE), Errno::EMFILE);
        assert_eq!(errno_from_host(nix::errno::Errno::ELOOP), Errno::ENOSYS);
    }

    #[test]
    fn test_getpid() {
        assert_eq!(NativeKernel::new().getpid(), std::process::id() as i32);
    }
}
