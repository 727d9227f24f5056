//! Syscall emulation: decoding the guest's syscall, running its handlers,
//! and writing the result back to the guest's registers.
//!
//! Each syscall goes through up to three steps. The *pre* handler checks the
//! arguments and tells the tool which guest memory the kernel will read and
//! write. It either finishes the syscall itself or asks for it to be passed
//! to the kernel. If the syscall succeeded, the *post* handler then reports
//! what the kernel wrote.

use std::sync::Arc;

use guest_helper::syscall_types::{ForeignPtr, SyscallArgs, SyscallReg};
use netbsd_api::syscall::SyscallNum;

use crate::host::engine::{CoreGuard, Engine};
use crate::host::guest_state::{GuestRegs, Reg};
use crate::host::thread::Tid;
use crate::host::tool::CorePart;

pub mod fd;
pub mod handler;
pub mod table;
pub mod types;

#[cfg(test)]
pub mod testing;

use handler::SyscallContext;
use table::SyscallEntry;
use types::{SyscallError, SyscallFlags, SyscallResult};

/// Registers holding the first six syscall arguments, in order.
const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];

impl Engine {
    /// Emulates the syscall `tid` is making. The syscall number is in `%rax`
    /// and the guest resumes after the syscall instruction once this returns,
    /// unless the thread has been told to exit.
    pub fn handle_syscall(self: &Arc<Self>, guard: &mut CoreGuard<'_>, tid: Tid) {
        let nr = {
            let regs = &guard.threads.get(tid).arch.guest;
            SyscallNum::new(regs.get(Reg::Rax) as u32)
        };
        let entry = *self.syscalls.get(nr);
        let args = self.fetch_args(guard, tid, nr, &entry);

        log::trace!("Thread {tid}: syscall {nr} {:?}", &args.args[..entry.nargs.min(8)]);

        let mut ctx = SyscallContext {
            engine: self,
            guard: &mut *guard,
            tid,
            args: &args,
            flags: entry.flags,
            reshi: 0,
        };

        let mut rv = match entry.pre {
            Some(pre) => pre(&mut ctx),
            None => Err(SyscallError::Native),
        };

        if rv == Err(SyscallError::Native) {
            rv = run_natively(&mut ctx);
        }

        if let (Ok(res), Some(post)) = (&rv, entry.post) {
            rv = post(&mut ctx, *res);
            assert_ne!(
                rv,
                Err(SyscallError::Native),
                "post handler for {nr} tried to pass the syscall to the kernel"
            );
        }

        let flags = ctx.flags;
        let reshi = ctx.reshi;

        match &rv {
            Ok(res) => log::trace!("Thread {tid}: {nr} -> {:#x}", u64::from(*res)),
            Err(e) => log::trace!("Thread {tid}: {nr} -> {e:?}"),
        }

        if !flags.contains(SyscallFlags::NO_WRITE_RESULT) {
            self.write_result(guard, tid, rv, reshi);
        }

        if flags.contains(SyscallFlags::POLL_AFTER) {
            self.services.signals.poll_signals(tid);
        }
    }

    /// Collects the arguments, and reports the reads of the registers and
    /// stack slots they came from.
    fn fetch_args(
        &self,
        guard: &CoreGuard<'_>,
        tid: Tid,
        nr: SyscallNum,
        entry: &SyscallEntry,
    ) -> SyscallArgs {
        let regs = &guard.threads.get(tid).arch.guest;
        let mut vals = [0u64; 8];
        for (val, reg) in vals.iter_mut().zip(ARG_REGS) {
            *val = regs.get(reg);
        }

        let tool = self.tool();
        for (i, reg) in ARG_REGS.iter().enumerate().take(entry.nargs) {
            tool.pre_reg_read(
                CorePart::SysCall,
                tid,
                &format!("{}(arg{})", entry.name, i + 1),
                GuestRegs::offset_of_reg(*reg),
                std::mem::size_of::<u64>(),
            );
        }

        // The rest are on the stack, above the return address.
        let rsp = regs.get(Reg::Rsp) as usize;
        for i in ARG_REGS.len()..entry.nargs.min(vals.len()) {
            let addr = rsp + 8 * (i - ARG_REGS.len() + 1);
            tool.pre_mem_read(
                CorePart::SysCall,
                tid,
                &format!("{}(arg{})", entry.name, i + 1),
                addr,
                std::mem::size_of::<u64>(),
            );
            vals[i] = match self.aspace().read_val(ForeignPtr::<u64>::from_raw(addr)) {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("Thread {tid}: can't read argument {} of {nr}: {e}", i + 1);
                    0
                }
            };
        }

        SyscallArgs::new(nr, &vals)
    }

    /// NetBSD reports failure with the carry flag set and the errno in
    /// `%rax`. On success `%rax:%rdx` hold the result.
    fn write_result(&self, guard: &mut CoreGuard<'_>, tid: Tid, rv: SyscallResult, reshi: u64) {
        let regs = &mut guard.threads.get_mut(tid).arch.guest;
        let tool = self.tool();
        let size = std::mem::size_of::<u64>();

        match rv {
            Ok(res) => {
                regs.set(Reg::Rax, res.into());
                regs.set(Reg::Rdx, reshi);
                regs.set_carry(false);
                tool.post_reg_write(
                    CorePart::SysCall,
                    tid,
                    GuestRegs::offset_of_reg(Reg::Rdx),
                    size,
                );
            }
            Err(SyscallError::Failed(failed)) => {
                if failed.restartable {
                    log::debug!("Thread {tid}: interrupted syscall won't be restarted");
                }
                regs.set(Reg::Rax, failed.errno.to_u64());
                regs.set_carry(true);
            }
            Err(SyscallError::Native) => unreachable!(),
        }

        tool.post_reg_write(CorePart::SysCall, tid, GuestRegs::offset_of_reg(Reg::Rax), size);
        tool.post_reg_write(CorePart::SysCall, tid, GuestRegs::OFFSET_RFLAGS, size);
    }
}

/// Passes the syscall to the kernel unchanged.
fn run_natively(ctx: &mut SyscallContext) -> SyscallResult {
    let args: SyscallArgs = *ctx.args;
    let kernel = Arc::clone(&ctx.engine.services.kernel);

    let rv = if ctx.flags.contains(SyscallFlags::MAY_BLOCK) {
        ctx.guard.unlocked(|| kernel.syscall(&args))
    } else {
        kernel.syscall(&args)
    };

    let (lo, hi) = rv?;
    ctx.reshi = hi;
    Ok(SyscallReg::from(lo))
}
