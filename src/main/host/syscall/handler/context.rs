use std::mem::size_of;

use guest_helper::syscall_types::ForeignPtr;
use netbsd_api::ucontext::UContext;

use crate::host::guest_state::Reg;
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{SyscallError, SyscallFlags};
use crate::host::thread::context::{restore_context, save_context};
use crate::host::tool::CorePart;

impl SyscallHandler {
    pub fn getcontext(
        ctx: &mut SyscallContext,
        ucp: ForeignPtr<UContext>,
    ) -> Result<i32, SyscallError> {
        ctx.pre_mem_write("getcontext(ucp)", ucp.addr(), size_of::<UContext>());
        ctx.check_deref(ucp.addr(), size_of::<UContext>())?;

        // A later setcontext resumes right after this syscall, which must
        // then look like it returned 0.
        let mut thread = ctx.thread().clone();
        let regs = &mut thread.arch.guest;
        regs.set(Reg::Rax, 0);
        regs.set(Reg::Rdx, 0);
        regs.set_carry(false);

        save_context(&ctx.engine.services, &thread, ucp, CorePart::SysCall)?;
        Ok(0)
    }

    pub fn setcontext(
        ctx: &mut SyscallContext,
        ucp: ForeignPtr<UContext>,
    ) -> Result<i32, SyscallError> {
        ctx.check_deref(ucp.addr(), size_of::<UContext>())?;

        let engine = ctx.engine;
        let thread = ctx.guard.threads.get_mut(ctx.tid);
        restore_context(&engine.services, thread, ucp, CorePart::SysCall)?;

        // The restored registers are the result; and the new signal mask
        // may have unblocked something.
        ctx.flags |= SyscallFlags::NO_WRITE_RESULT | SyscallFlags::POLL_AFTER;
        Ok(0)
    }
}
