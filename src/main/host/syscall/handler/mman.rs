use guest_helper::page::is_page_aligned;
use guest_helper::syscall_types::{ForeignPtr, SyscallReg};
use netbsd_api::errno::Errno;
use netbsd_api::mman::{MapFlags, ProtFlags};

use crate::host::heap::do_brk;
use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::{SyscallError, SyscallResult};

impl SyscallHandler {
    pub fn brk(ctx: &mut SyscallContext, new_brk: usize) -> Result<i32, SyscallError> {
        log::trace!("break({new_brk:#x})");
        let data_limit = ctx.engine.options.data_limit;
        let services = &ctx.engine.services;
        do_brk(services, &mut ctx.guard.brk, data_limit, ctx.tid, new_brk)?;
        Ok(0)
    }

    /// `mmap(addr, len, prot, flags, fd, pad, pos)`.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        ctx: &mut SyscallContext,
        addr: ForeignPtr<u8>,
        len: usize,
        prot: u32,
        flags: u32,
        fd: i32,
        _pad: u64,
        offset: u64,
    ) -> Result<ForeignPtr<u8>, SyscallError> {
        log::trace!(
            "mmap({:#x}, {len:#x}, {prot:#x}, {flags:#x}, {fd}, {offset:#x})",
            addr.addr()
        );

        // A zero length isn't an error: the kernel hands back the address
        // without doing anything.
        if len == 0 {
            return Ok(addr);
        }

        if !is_page_aligned(offset as usize) {
            return Err(Errno::EINVAL.into());
        }

        let flags = MapFlags::from_bits_retain(flags);
        if flags.contains(MapFlags::MAP_FIXED) {
            if !is_page_aligned(addr.addr()) {
                return Err(Errno::EINVAL.into());
            }
            if addr.addr() < ctx.aspace().client_base() {
                log::debug!("mmap: fixed mapping at {:#x} is below the client area", addr.addr());
                return Err(Errno::ENOMEM.into());
            }
        }

        let (rv, _) = ctx.engine.kernel().syscall(ctx.args)?;
        let prot = ProtFlags::from_bits_truncate(prot);
        notify_core_and_tool_of_mmap(ctx, rv as usize, len, prot, flags, fd, offset)?;
        Ok(ForeignPtr::from_raw(rv as usize))
    }

    pub fn lwp_ctl_post(ctx: &mut SyscallContext, rv: SyscallReg) -> SyscallResult {
        let address: ForeignPtr<u64> = ctx.args.get(1).into();
        ctx.post_mem_write(address.addr(), std::mem::size_of::<u64>());

        // The kernel maps the shared lwpctl page into the process.
        let ctl = ctx.aspace().read_val(address)? as usize;
        let start = guest_helper::page::page_round_down(ctl);
        let len = guest_helper::page::page_round_up(netbsd_api::limits::LWPCTL_SIZE);
        notify_core_and_tool_of_mmap(ctx, start, len, ProtFlags::RW, MapFlags::MAP_ANON, -1, 0)?;
        Ok(rv)
    }
}

fn notify_core_and_tool_of_mmap(
    ctx: &SyscallContext,
    addr: usize,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
    fd: i32,
    offset: u64,
) -> Result<(), SyscallError> {
    let len = guest_helper::page::page_round_up(len);
    ctx.aspace()
        .notify_client_mmap(addr, len, prot, flags, fd, offset)?;
    ctx.tool().new_mem_mmap(addr, len, prot);
    Ok(())
}

#[cfg(test)]
mod tests {
    use netbsd_api::syscall::SyscallNum;

    use crate::host::memory::{AddressSpace, SegKind};
    use crate::host::syscall::testing::SyscallHarness;
    use crate::host::tool::ToolEvent;

    use super::*;

    #[test]
    fn test_zero_length_returns_addr() {
        let h = SyscallHarness::new();
        let rv = h.syscall(SyscallNum::NR_mmap, &[0x1234_5000, 0, 3, 0x1002, 0, 0, 0]);
        assert_eq!(rv, Ok((0x1234_5000, 0)));
        assert!(h.te.kernel.calls().is_empty());
    }

    #[test]
    fn test_unaligned_offset() {
        let h = SyscallHarness::new();
        let rv = h.syscall(SyscallNum::NR_mmap, &[0, 0x1000, 3, 0x1002, 0, 0, 0x10]);
        assert_eq!(rv, Err(Errno::EINVAL));
    }

    #[test]
    fn test_mapping_is_recorded() {
        let h = SyscallHarness::new();
        h.te
            .kernel
            .set_result(SyscallNum::NR_mmap, Ok((0x5000_0000, 0)));
        let rv = h.syscall(
            SyscallNum::NR_mmap,
            &[0, 0x1800, 3, u64::from(MapFlags::MAP_ANON.bits()), u64::MAX, 0, 0],
        );
        assert_eq!(rv, Ok((0x5000_0000, 0)));

        let seg = h.te.aspace.find_segment(0x5000_0000).unwrap();
        assert_eq!(seg.kind, SegKind::AnonC);
        assert_eq!(seg.len(), 0x2000);
        assert!(h.te.tool.events().contains(&ToolEvent::NewMemMmap {
            start: 0x5000_0000,
            len: 0x2000,
            prot: ProtFlags::RW,
        }));
    }
}
