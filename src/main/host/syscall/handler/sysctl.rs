use guest_helper::syscall_types::{ForeignPtr, SyscallReg};

use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{SyscallError, SyscallResult};

impl SyscallHandler {
    /// `__sysctl(name, namelen, oldp, oldlenp, newp, newlen)`.
    pub fn sysctl(
        ctx: &mut SyscallContext,
        name: ForeignPtr<i32>,
        namelen: u32,
        oldp: ForeignPtr<u8>,
        oldlenp: ForeignPtr<u64>,
        newp: ForeignPtr<u8>,
        newlen: usize,
    ) -> Result<i32, SyscallError> {
        ctx.pre_mem_read(
            "__sysctl(name)",
            name.addr(),
            namelen as usize * std::mem::size_of::<i32>(),
        );

        if !oldp.is_null() {
            // The kernel fills at most *oldlenp bytes.
            ctx.check_deref(oldlenp.addr(), std::mem::size_of::<u64>())?;
            let oldlen = ctx.aspace().read_val(oldlenp)?;
            ctx.pre_mem_write("__sysctl(oldp)", oldp.addr(), oldlen as usize);
        }

        if !newp.is_null() {
            ctx.pre_mem_read("__sysctl(newp)", newp.addr(), newlen);
        }

        Err(SyscallError::Native)
    }

    pub fn sysctl_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let oldp: ForeignPtr<u8> = ctx.args.get(2).into();
        let oldlenp: ForeignPtr<u64> = ctx.args.get(3).into();

        if !oldp.is_null() {
            ctx.post_mem_write(oldlenp.addr(), std::mem::size_of::<u64>());
            // Now the length the kernel actually wrote.
            let oldlen = ctx.aspace().read_val(oldlenp)?;
            ctx.post_mem_write(oldp.addr(), oldlen as usize);
        }
        Ok(rv)
    }
}

#[cfg(test)]
mod tests {
    use netbsd_api::errno::Errno;
    use netbsd_api::syscall::SyscallNum;

    use crate::host::syscall::testing::{SyscallHarness, SCRATCH};
    use crate::host::tool::ToolEvent;

    const NAME: usize = SCRATCH;
    const OLDLENP: usize = SCRATCH + 0x100;
    const OLDP: usize = SCRATCH + 0x200;

    #[test]
    fn test_read_value() {
        let h = SyscallHarness::new();
        h.write(NAME, &[1i32, 6]);
        h.write(OLDLENP, &64u64);

        let args = [NAME as u64, 2, OLDP as u64, OLDLENP as u64, 0, 0];
        h.syscall(SyscallNum::NR___sysctl, &args).unwrap();

        let events = h.te.tool.events();
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PreMemRead { what, addr, len: 8, .. }
                if what == "__sysctl(name)" && *addr == NAME
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PreMemWrite { what, addr, len: 64, .. }
                if what == "__sysctl(oldp)" && *addr == OLDP
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ToolEvent::PostMemWrite { addr, len: 64, .. } if *addr == OLDP
        )));
    }

    #[test]
    fn test_bad_oldlenp() {
        let h = SyscallHarness::new();
        let args = [NAME as u64, 2, OLDP as u64, 0x10, 0, 0];
        assert_eq!(h.syscall(SyscallNum::NR___sysctl, &args), Err(Errno::EFAULT));
        assert!(h.te.kernel.calls().is_empty());
    }

    #[test]
    fn test_no_oldp() {
        let h = SyscallHarness::new();
        let args = [NAME as u64, 2, 0, 0x10, OLDP as u64, 4];
        h.syscall(SyscallNum::NR___sysctl, &args).unwrap();
        assert!(!h
            .te
            .tool
            .events()
            .iter()
            .any(|e| matches!(e, ToolEvent::PostMemWrite { .. })));
    }
}
