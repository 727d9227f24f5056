use std::mem::{offset_of, size_of};

use guest_helper::syscall_types::{ForeignPtr, SyscallReg};
use netbsd_api::signal::{SigAction, SigSet};

use crate::host::signals::SigActionRequest;
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{SyscallError, SyscallResult};

impl SyscallHandler {
    /// `__sigaction_sigtramp(sig, act, oact, tramp, vers)`. The handler is
    /// kept by the engine; the kernel never sees it.
    pub fn sigaction_sigtramp(
        ctx: &mut SyscallContext,
        sig: i32,
        act: ForeignPtr<SigAction>,
        oact: ForeignPtr<SigAction>,
        tramp: u64,
        vers: i32,
    ) -> Result<i32, SyscallError> {
        log::trace!(
            "__sigaction_sigtramp({sig}, {:#x}, {:#x}, {tramp:#x}, {vers})",
            act.addr(),
            oact.addr()
        );

        if !act.is_null() {
            let base = act.addr();
            ctx.pre_mem_read(
                "__sigaction_sigtramp(act->sa_handler)",
                base + offset_of!(SigAction, sa_handler),
                size_of::<u64>(),
            );
            ctx.pre_mem_read(
                "__sigaction_sigtramp(act->sa_mask)",
                base + offset_of!(SigAction, sa_mask),
                size_of::<SigSet>(),
            );
            ctx.pre_mem_read(
                "__sigaction_sigtramp(act->sa_flags)",
                base + offset_of!(SigAction, sa_flags),
                size_of::<i32>(),
            );
        }
        if !oact.is_null() {
            ctx.pre_mem_write("__sigaction_sigtramp(oact)", oact.addr(), size_of::<SigAction>());
        }
        if tramp != 0 {
            ctx.pre_mem_read("__sigaction_sigtramp(tramp)", tramp as usize, size_of::<u64>());
        }

        let new = if act.is_null() {
            None
        } else {
            ctx.check_deref(act.addr(), size_of::<SigAction>())?;
            Some(SigActionRequest {
                action: ctx.aspace().read_val(act)?,
                tramp,
                tramp_abi: vers,
            })
        };
        if !oact.is_null() {
            ctx.check_deref(oact.addr(), size_of::<SigAction>())?;
        }

        let mut old = SigAction::default();
        let want_old = !oact.is_null();
        ctx.engine
            .services
            .signals
            .sigaction(sig, new.as_ref(), want_old.then_some(&mut old))?;

        if want_old {
            ctx.aspace().write_val(oact, &old)?;
        }
        Ok(0)
    }

    pub fn sigaction_sigtramp_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let oact: ForeignPtr<SigAction> = ctx.args.get(2).into();
        if !oact.is_null() {
            ctx.post_mem_write(oact.addr(), size_of::<SigAction>());
        }
        Ok(rv)
    }
}
