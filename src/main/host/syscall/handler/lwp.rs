//! Light-weight process (thread) syscalls.

use std::mem::size_of;

use guest_helper::syscall_types::{ForeignPtr, SyscallReg};
use netbsd_api::errno::Errno;
use netbsd_api::limits::{LWPID_SIZE, MAXCOMLEN, TIMESPEC_SIZE};
use netbsd_api::lwp::LwpFlags;
use netbsd_api::signal::Signal;
use netbsd_api::ucontext::{UContext, UcFlags};

use crate::host::engine::CoreState;
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::host::thread::context::restore_context;
use crate::host::thread::lifecycle::lwp_main;
use crate::host::thread::stacks::guess_and_register_stack;
use crate::host::thread::{ExitReason, Tid};
use crate::host::tool::CorePart;

/// Highest signal the guest may send. The top one is the engine's.
const MAX_CLIENT_SIGNAL: i32 = Signal::NSIG - 2;

impl SyscallHandler {
    /// `_lwp_create(ucp, flags, new_lwp)`: starts a thread in the context at
    /// `ucp`.
    pub fn lwp_create(
        ctx: &mut SyscallContext,
        ucp: ForeignPtr<UContext>,
        flags: u64,
        new_lwp: ForeignPtr<u32>,
    ) -> Result<i32, SyscallError> {
        log::trace!("_lwp_create({:#x}, {flags:#x}, {:#x})", ucp.addr(), new_lwp.addr());

        ctx.pre_mem_write("_lwp_create(new_lwp)", new_lwp.addr(), LWPID_SIZE);
        ctx.check_deref(ucp.addr(), size_of::<UContext>())?;
        if !new_lwp.is_null() {
            ctx.check_deref(new_lwp.addr(), LWPID_SIZE)?;
        }

        let ctid = ctx.guard.threads.alloc()?;
        let mut tool_informed = false;

        let flags = LwpFlags::from_bits_retain(flags);
        match create_thread(ctx, ctid, ucp, flags, &mut tool_informed) {
            Ok(lwpid) => {
                if !new_lwp.is_null() {
                    ctx.aspace().write_val(new_lwp, &lwpid)?;
                    ctx.post_mem_write(new_lwp.addr(), LWPID_SIZE);
                }
                log::debug!("Thread {} created thread {ctid} (lwp {lwpid})", ctx.tid);
                Ok(0)
            }
            Err(e) => {
                log::debug!("Thread {}: _lwp_create failed: {e:?}", ctx.tid);
                if tool_informed {
                    ctx.tool().pre_thread_ll_exit(ctid);
                }
                let core: &mut CoreState = &mut **ctx.guard;
                if let Some(id) = core.threads.get_mut(ctid).os_state.stack_id.take() {
                    core.stacks.deregister(id);
                }
                core.threads.release(ctid);
                Err(e)
            }
        }
    }

    pub fn lwp_exit(ctx: &mut SyscallContext) -> Result<i32, SyscallError> {
        log::debug!("Thread {}: _lwp_exit", ctx.tid);
        let thread = ctx.thread_mut();
        thread.exitreason = Some(ExitReason::ExitThread);
        thread.os_state.exitcode = 0;
        Ok(0)
    }

    pub fn lwp_getprivate(ctx: &mut SyscallContext) -> Result<u64, SyscallError> {
        Ok(ctx.thread().arch.guest.fs_const)
    }

    pub fn lwp_setprivate(ctx: &mut SyscallContext, ptr: u64) -> Result<i32, SyscallError> {
        ctx.thread_mut().arch.guest.fs_const = ptr;
        Ok(0)
    }

    /// `_lwp_kill(target, sig)`. SIGKILL for one of our own threads is
    /// handled here, since the engine has to take the thread down itself.
    pub fn lwp_kill(
        ctx: &mut SyscallContext,
        target: u32,
        sig: i32,
    ) -> Result<u64, SyscallError> {
        if !(0..=MAX_CLIENT_SIGNAL).contains(&sig) {
            return Err(Errno::EINVAL.into());
        }

        if sig == Signal::SIGKILL.as_i32() {
            if let Some(ttid) = ctx.guard.threads.find_by_lwpid(target) {
                log::debug!("Thread {}: SIGKILL for thread {ttid}", ctx.tid);
                let victim = ctx.guard.threads.get_mut(ttid);
                victim.exitreason = Some(ExitReason::FatalSig);
                victim.fatalsig = Some(Signal::SIGKILL);
                let lwpid = victim.os_state.lwpid;
                if ttid != ctx.tid {
                    ctx.engine.services.signals.interrupt_thread(ttid, lwpid);
                }
                return Ok(0);
            }
        }

        let (rv, _) = ctx.engine.kernel().syscall(ctx.args)?;
        Ok(rv)
    }

    pub fn lwp_unpark_all(
        ctx: &mut SyscallContext,
        targets: ForeignPtr<u32>,
        ntargets: usize,
        _hint: u64,
    ) -> Result<i32, SyscallError> {
        if !targets.is_null() {
            ctx.pre_mem_read(
                "_lwp_unpark_all(targets)",
                targets.addr(),
                ntargets.saturating_mul(size_of::<u32>()),
            );
        }
        Err(SyscallError::Native)
    }

    pub fn lwp_setname(
        ctx: &mut SyscallContext,
        _target: u32,
        name: ForeignPtr<u8>,
    ) -> Result<i32, SyscallError> {
        ctx.pre_mem_read_asciiz("_lwp_setname(name)", name.addr());
        Err(SyscallError::Native)
    }

    pub fn lwp_setname_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let target = u32::from(ctx.args.get(0));
        let name: ForeignPtr<u8> = ctx.args.get(1).into();

        let tid = if target == 0 {
            Some(ctx.tid)
        } else {
            ctx.guard.threads.find_by_lwpid(target)
        };

        match (tid, ctx.aspace().read_cstring(name, MAXCOMLEN - 1)) {
            (Some(tid), Ok(bytes)) => {
                let name = String::from_utf8_lossy(&bytes).into_owned();
                log::trace!("Thread {tid} is now called {name:?}");
                ctx.guard.threads.get_mut(tid).thread_name = Some(name);
            }
            (None, _) => log::debug!("_lwp_setname for lwp {target} we don't run"),
            (_, Err(e)) => log::debug!("Couldn't read new name of lwp {target}: {e}"),
        }
        Ok(rv)
    }

    pub fn lwp_ctl(
        ctx: &mut SyscallContext,
        _features: i32,
        address: ForeignPtr<u64>,
    ) -> Result<i32, SyscallError> {
        ctx.pre_mem_write("_lwp_ctl(address)", address.addr(), size_of::<u64>());
        Err(SyscallError::Native)
    }

    /// `___lwp_park60(clock_id, flags, ts, unpark, hint, unparkhint)`.
    pub fn lwp_park(
        ctx: &mut SyscallContext,
        _clock_id: i32,
        _flags: i32,
        ts: ForeignPtr<u8>,
        _unpark: u32,
        _hint: u64,
        _unparkhint: u64,
    ) -> Result<i32, SyscallError> {
        if !ts.is_null() {
            ctx.pre_mem_read("___lwp_park60(ts)", ts.addr(), TIMESPEC_SIZE);
        }
        Err(SyscallError::Native)
    }
}

/// Sets up slot `ctid` as a copy of the calling thread running from `ucp`,
/// and starts an LWP for it. Returns the new LWP's id.
fn create_thread(
    ctx: &mut SyscallContext,
    ctid: Tid,
    ucp: ForeignPtr<UContext>,
    flags: LwpFlags,
    tool_informed: &mut bool,
) -> Result<u32, SyscallError> {
    let engine = ctx.engine;
    let ptid = ctx.tid;
    let services = &engine.services;

    let (arch, sig_mask, threadgroup) = {
        let parent = ctx.thread();
        (parent.arch, parent.sig_mask, parent.os_state.threadgroup)
    };

    let core: &mut CoreState = &mut **ctx.guard;
    let child = core.threads.get_mut(ctid);

    // Engine stacks stay with the slot, so this only happens once per slot.
    let stack = match child.os_state.engine_stack {
        Some(stack) => stack,
        None => {
            let stack = services
                .aspace
                .alloc_engine_stack(engine.options.engine_stack_size)
                .map_err(|e| {
                    log::warn!("Can't allocate an engine stack for thread {ctid}: {e}");
                    Errno::ENOMEM
                })?;
            child.os_state.engine_stack = Some(stack);
            stack
        }
    };

    child.arch = arch;
    child.sig_mask = sig_mask;
    child.tmp_sig_mask = sig_mask;
    child.os_state.parent = Some(ptid);
    child.os_state.threadgroup = threadgroup;

    // The new thread's stack has to be given; we can't share the parent's.
    let uc: UContext = services.aspace.as_ref().read_val(ucp)?;
    if !uc.flags().contains(UcFlags::UC_STACK) || uc.uc_stack.ss_flags != 0 {
        return Err(Errno::EINVAL.into());
    }
    let stack_end = uc
        .uc_stack
        .ss_sp
        .checked_add(uc.uc_stack.ss_size)
        .ok_or(Errno::EINVAL)?;
    let stack_top = stack_end.saturating_sub(1) as usize;
    guess_and_register_stack(services.aspace.as_ref(), &mut core.stacks, child, stack_top);

    services.tool.pre_thread_ll_create(ptid, ctid);
    *tool_informed = true;

    restore_context(services, child, ucp, CorePart::SysCall)?;

    let lwpid = services
        .kernel
        .create_lwp(&stack, flags, lwp_main(engine.clone(), ctid))?;
    child.os_state.lwpid = lwpid;
    Ok(lwpid)
}
