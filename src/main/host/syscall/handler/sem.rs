use guest_helper::syscall_types::{ForeignPtr, SyscallReg};
use netbsd_api::limits::KSEM_ID_SIZE;

use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{SyscallError, SyscallResult};

impl SyscallHandler {
    pub fn ksem_init(
        ctx: &mut SyscallContext,
        _value: u32,
        idp: ForeignPtr<u64>,
    ) -> Result<i32, SyscallError> {
        ctx.pre_mem_write("_ksem_init(idp)", idp.addr(), KSEM_ID_SIZE);
        Err(SyscallError::Native)
    }

    pub fn ksem_init_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let idp: ForeignPtr<u64> = ctx.args.get(1).into();
        ctx.post_mem_write(idp.addr(), KSEM_ID_SIZE);
        Ok(rv)
    }
}

#[cfg(test)]
mod tests {
    use netbsd_api::errno::Errno;
    use netbsd_api::syscall::SyscallNum;

    use super::*;
    use crate::host::syscall::testing::{SyscallHarness, SCRATCH};
    use crate::host::tool::ToolEvent;

    #[test]
    fn test_init_writes_id() {
        let h = SyscallHarness::new();
        h.syscall(SyscallNum::NR__ksem_init, &[1, SCRATCH as u64])
            .unwrap();
        let events = h.te.tool.events();
        assert!(events.contains(&ToolEvent::PostMemWrite {
            part: crate::host::tool::CorePart::SysCall,
            tid: h.tid,
            addr: SCRATCH,
            len: KSEM_ID_SIZE,
        }));
    }

    #[test]
    fn test_failed_init_writes_nothing() {
        let h = SyscallHarness::new();
        h.te
            .kernel
            .set_result(SyscallNum::NR__ksem_init, Err(Errno::ENOSPC));
        assert_eq!(
            h.syscall(SyscallNum::NR__ksem_init, &[1, SCRATCH as u64]),
            Err(Errno::ENOSPC)
        );
        assert!(!h
            .te
            .tool
            .events()
            .iter()
            .any(|e| matches!(e, ToolEvent::PostMemWrite { .. })));
    }
}
