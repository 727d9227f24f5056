use std::sync::Arc;

use guest_helper::syscall_types::{SyscallArgs, SyscallReg};
use netbsd_api::errno::Errno;

use crate::host::engine::{CoreGuard, Engine};
use crate::host::memory::AddressSpace;
use crate::host::syscall::types::{SyscallError, SyscallFlags, SyscallResult};
use crate::host::thread::{ThreadState, Tid};
use crate::host::tool::{CorePart, ToolHooks};

mod context;
mod fd;
mod lwp;
mod mman;
mod process;
mod sem;
mod signal;
mod sysctl;

/// Namespace for the syscall handlers. Handlers are associated functions
/// taking a [`SyscallContext`] and the syscall's arguments.
pub struct SyscallHandler;

/// Everything a handler may look at or change while the calling thread holds
/// the big lock.
pub struct SyscallContext<'a, 'g> {
    pub engine: &'a Arc<Engine>,
    pub guard: &'a mut CoreGuard<'g>,
    pub tid: Tid,
    pub args: &'a SyscallArgs,
    /// Starts out as the table entry's flags; pre-handlers may add to them.
    pub flags: SyscallFlags,
    /// The kernel's second result register (`%rdx`). Set before a
    /// post-handler runs, and returned to the guest on success.
    pub reshi: u64,
}

impl SyscallContext<'_, '_> {
    pub fn thread(&self) -> &ThreadState {
        self.guard.threads.get(self.tid)
    }

    pub fn thread_mut(&mut self) -> &mut ThreadState {
        self.guard.threads.get_mut(self.tid)
    }

    pub fn aspace(&self) -> &dyn AddressSpace {
        self.engine.aspace()
    }

    pub fn tool(&self) -> &dyn ToolHooks {
        self.engine.tool()
    }

    pub fn pre_mem_read(&self, what: &str, addr: usize, len: usize) {
        self.tool()
            .pre_mem_read(CorePart::SysCall, self.tid, what, addr, len);
    }

    pub fn pre_mem_read_asciiz(&self, what: &str, addr: usize) {
        self.tool()
            .pre_mem_read_asciiz(CorePart::SysCall, self.tid, what, addr);
    }

    pub fn pre_mem_write(&self, what: &str, addr: usize, len: usize) {
        self.tool()
            .pre_mem_write(CorePart::SysCall, self.tid, what, addr, len);
    }

    pub fn post_mem_write(&self, addr: usize, len: usize) {
        self.tool()
            .post_mem_write(CorePart::SysCall, self.tid, addr, len);
    }

    /// Fails with `EFAULT` unless the guest can read `[addr, addr + len)`.
    pub fn check_deref(&self, addr: usize, len: usize) -> Result<(), SyscallError> {
        if self.aspace().safe_to_deref(addr, len) {
            Ok(())
        } else {
            log::debug!(
                "Thread {}: {:#x}+{:#x} is not accessible",
                self.tid,
                addr,
                len
            );
            Err(Errno::EFAULT.into())
        }
    }

    /// Whether the guest may use descriptor `fd` for this syscall.
    pub fn fd_allowed(&self, fd: i32, is_new: bool) -> bool {
        let name = self.args.number().to_str().unwrap_or("unknown-syscall");
        self.engine
            .options
            .fd_policy
            .fd_allowed(fd, name, self.tid, is_new)
    }

    /// Records a descriptor the guest just got, if we're tracking them.
    pub fn record_fd_open(&mut self, fd: i32, origin: &'static str) {
        if self.engine.options.fd_policy.track_fds {
            let tid = self.tid;
            self.guard.fds.record_open(tid, fd, origin);
        }
    }

    pub fn record_fd_close(&mut self, fd: i32) {
        if self.engine.options.fd_policy.track_fds {
            self.guard.fds.record_close(fd);
        }
    }
}

pub trait SyscallHandlerFn<T> {
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult;
}

impl<F, T0> SyscallHandlerFn<()> for F
where
    F: Fn(&mut SyscallContext) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(ctx).map(Into::into)
    }
}

impl<F, T0, T1> SyscallHandlerFn<(T1,)> for F
where
    F: Fn(&mut SyscallContext, T1) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(ctx, ctx.args.get(0).into()).map(Into::into)
    }
}

impl<F, T0, T1, T2> SyscallHandlerFn<(T1, T2)> for F
where
    F: Fn(&mut SyscallContext, T1, T2) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(ctx, ctx.args.get(0).into(), ctx.args.get(1).into()).map(Into::into)
    }
}

impl<F, T0, T1, T2, T3> SyscallHandlerFn<(T1, T2, T3)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
        )
        .map(Into::into)
    }
}

impl<F, T0, T1, T2, T3, T4> SyscallHandlerFn<(T1, T2, T3, T4)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3, T4) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
    T4: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
            ctx.args.get(3).into(),
        )
        .map(Into::into)
    }
}

impl<F, T0, T1, T2, T3, T4, T5> SyscallHandlerFn<(T1, T2, T3, T4, T5)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3, T4, T5) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
    T4: From<SyscallReg>,
    T5: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
            ctx.args.get(3).into(),
            ctx.args.get(4).into(),
        )
        .map(Into::into)
    }
}

impl<F, T0, T1, T2, T3, T4, T5, T6> SyscallHandlerFn<(T1, T2, T3, T4, T5, T6)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3, T4, T5, T6) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
    T4: From<SyscallReg>,
    T5: From<SyscallReg>,
    T6: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
            ctx.args.get(3).into(),
            ctx.args.get(4).into(),
            ctx.args.get(5).into(),
        )
        .map(Into::into)
    }
}

impl<F, T0, T1, T2, T3, T4, T5, T6, T7> SyscallHandlerFn<(T1, T2, T3, T4, T5, T6, T7)> for F
where
    F: Fn(&mut SyscallContext, T1, T2, T3, T4, T5, T6, T7) -> Result<T0, SyscallError>,
    T0: Into<SyscallReg>,
    T1: From<SyscallReg>,
    T2: From<SyscallReg>,
    T3: From<SyscallReg>,
    T4: From<SyscallReg>,
    T5: From<SyscallReg>,
    T6: From<SyscallReg>,
    T7: From<SyscallReg>,
{
    fn call(self, ctx: &mut SyscallContext) -> SyscallResult {
        self(
            ctx,
            ctx.args.get(0).into(),
            ctx.args.get(1).into(),
            ctx.args.get(2).into(),
            ctx.args.get(3).into(),
            ctx.args.get(4).into(),
            ctx.args.get(5).into(),
            ctx.args.get(6).into(),
        )
        .map(Into::into)
    }
}
