//! Saving a thread's execution context into a guest `ucontext_t` and loading
//! it back, as for `getcontext`/`setcontext`, thread creation and signal
//! return.

use std::mem::size_of;

use bytemuck::Zeroable;
use guest_helper::syscall_types::ForeignPtr;
use netbsd_api::limits::STACK_REDZONE_SIZE;
use netbsd_api::signal::{SigSet, StackT, SS_ONSTACK};
use netbsd_api::ucontext::{offsets, reg, MContext, UContext, UcFlags};

use super::ThreadState;
use crate::host::engine::Services;
use crate::host::guest_state::{GuestRegs, Reg};
use crate::host::memory::{AddressSpace, MemError};
use crate::host::tool::CorePart;

/// Where each general purpose register lives in `mcontext_t`.
const GREG_MAP: [(usize, Reg); 16] = [
    (reg::RDI, Reg::Rdi),
    (reg::RSI, Reg::Rsi),
    (reg::RDX, Reg::Rdx),
    (reg::RCX, Reg::Rcx),
    (reg::R8, Reg::R8),
    (reg::R9, Reg::R9),
    (reg::R10, Reg::R10),
    (reg::R11, Reg::R11),
    (reg::R12, Reg::R12),
    (reg::R13, Reg::R13),
    (reg::R14, Reg::R14),
    (reg::R15, Reg::R15),
    (reg::RBP, Reg::Rbp),
    (reg::RBX, Reg::Rbx),
    (reg::RAX, Reg::Rax),
    (reg::RSP, Reg::Rsp),
];

const MC_GREGS: usize = offsets::UC_MCONTEXT + core::mem::offset_of!(MContext, gregs);
const MC_TLSBASE: usize = offsets::UC_MCONTEXT + core::mem::offset_of!(MContext, tlsbase);
const MC_FPREGS: usize = offsets::UC_MCONTEXT + core::mem::offset_of!(MContext, fpregs);

fn save_machine_context(regs: &GuestRegs, uc: &mut UContext) {
    let mc = &mut uc.uc_mcontext;
    for (index, r) in GREG_MAP {
        mc.gregs[index] = regs.get(r);
    }
    mc.gregs[reg::RIP] = regs.rip;
    mc.gregs[reg::RFLAGS] = regs.rflags;
    mc.tlsbase = regs.fs_const;
    mc.fpregs = regs.fxsave;

    let flags = uc.flags() | UcFlags::UC_CPU | UcFlags::UC_FPU | UcFlags::UC_TLSBASE;
    uc.uc_flags = flags.bits();
}

/// Copies `thread`'s context to guest memory at `ucp`.
pub fn save_context(
    services: &Services,
    thread: &ThreadState,
    ucp: ForeignPtr<UContext>,
    part: CorePart,
) -> Result<(), MemError> {
    let tool = services.tool.as_ref();
    let tid = thread.tid;
    let base = ucp.addr();

    tool.pre_mem_write(part, tid, "save_context(uc)", base, size_of::<UContext>());

    let mut uc = UContext::zeroed();

    uc.uc_link = thread.os_state.oldcontext;
    tool.post_mem_write(part, tid, base + offsets::UC_LINK, size_of::<u64>());

    uc.uc_sigmask = thread.sig_mask;
    let mut flags = UcFlags::UC_SIGMASK;
    tool.post_mem_write(part, tid, base + offsets::UC_SIGMASK, size_of::<SigSet>());

    uc.uc_stack = if thread.alt_stack.ss_flags & SS_ONSTACK == 0 {
        StackT {
            ss_sp: thread.os_state.stack_highest_byte as u64,
            ss_size: thread.os_state.stack_size as u64,
            ss_flags: 0,
            _pad: 0,
        }
    } else {
        thread.alt_stack
    };
    flags |= UcFlags::UC_STACK;
    uc.uc_flags = flags.bits();
    tool.post_mem_write(part, tid, base + offsets::UC_STACK, size_of::<StackT>());
    tool.post_mem_write(part, tid, base + offsets::UC_FLAGS, size_of::<u32>());

    save_machine_context(&thread.arch.guest, &mut uc);
    tool.post_mem_write(part, tid, base + offsets::UC_MCONTEXT, size_of::<MContext>());
    tool.post_mem_write(part, tid, base + offsets::UC_FLAGS, size_of::<u32>());

    let aspace: &dyn AddressSpace = services.aspace.as_ref();
    aspace.write_val(ucp, &uc)
}

/// Loads the context at `ucp` into `thread`.
pub fn restore_context(
    services: &Services,
    thread: &mut ThreadState,
    ucp: ForeignPtr<UContext>,
    part: CorePart,
) -> Result<(), MemError> {
    let tool = services.tool.as_ref();
    let aspace: &dyn AddressSpace = services.aspace.as_ref();
    let tid = thread.tid;
    let base = ucp.addr();
    let old_sp = thread.arch.guest.get(Reg::Rsp) as usize;

    let uc: UContext = aspace.read_val(ucp)?;
    let flags = uc.flags();

    tool.pre_mem_read(
        part,
        tid,
        "restore_context(uc->uc_flags)",
        base + offsets::UC_FLAGS,
        size_of::<u32>(),
    );
    tool.pre_mem_read(
        part,
        tid,
        "restore_context(uc->uc_link)",
        base + offsets::UC_LINK,
        size_of::<u64>(),
    );
    thread.os_state.oldcontext = uc.uc_link;

    if flags.contains(UcFlags::UC_SIGMASK) {
        tool.pre_mem_read(
            part,
            tid,
            "restore_context(uc->uc_sigmask)",
            base + offsets::UC_SIGMASK,
            size_of::<SigSet>(),
        );
        thread.sig_mask = uc.uc_sigmask.without_unblockable();
        thread.tmp_sig_mask = thread.sig_mask;
    }

    // The alternate stack flags are worked out when a signal is delivered,
    // so there's nothing to update.
    if flags.contains(UcFlags::UC_STACK) {
        tool.pre_mem_read(
            part,
            tid,
            "restore_context(uc->uc_stack)",
            base + offsets::UC_STACK,
            size_of::<StackT>(),
        );
    }

    restore_machine_context(services, thread, &uc, base, part);

    let os = &thread.os_state;
    if os.stack_highest_byte != 0 && os.stack_size != 0 {
        let end = os.stack_highest_byte;
        let start = end + 1 - os.stack_size;
        let new_sp = thread.arch.guest.get(Reg::Rsp) as usize;
        let on_stack = |sp: usize| (start..=end).contains(&sp);
        if on_stack(old_sp) && on_stack(new_sp) && new_sp > old_sp {
            tool.die_mem_stack(
                old_sp - STACK_REDZONE_SIZE,
                new_sp - old_sp + STACK_REDZONE_SIZE,
            );
        }
    }
    Ok(())
}

fn restore_machine_context(
    services: &Services,
    thread: &mut ThreadState,
    uc: &UContext,
    base: usize,
    part: CorePart,
) {
    let tool = services.tool.as_ref();
    let tid = thread.tid;
    let flags = uc.flags();
    let mc = &uc.uc_mcontext;
    let regs = &mut thread.arch.guest;

    if flags.contains(UcFlags::UC_CPU) {
        tool.pre_mem_read(
            part,
            tid,
            "restore_machine_context(uc->uc_mcontext.__gregs)",
            base + MC_GREGS,
            size_of::<[u64; netbsd_api::ucontext::NGREG]>(),
        );
        for (index, r) in GREG_MAP {
            regs.set(r, mc.gregs[index]);
        }
        regs.rip = mc.gregs[reg::RIP];
        regs.rflags = mc.gregs[reg::RFLAGS];
        tool.post_reg_write(part, tid, GuestRegs::offset_of_reg(Reg::Rax), 16 * 8);
        tool.post_reg_write(part, tid, GuestRegs::OFFSET_RIP, size_of::<u64>());
        tool.post_reg_write(part, tid, GuestRegs::OFFSET_RFLAGS, size_of::<u64>());
    }

    if flags.contains(UcFlags::UC_FPU) {
        tool.pre_mem_read(
            part,
            tid,
            "restore_machine_context(uc->uc_mcontext.__fpregs)",
            base + MC_FPREGS,
            mc.fpregs.len(),
        );
        regs.fxsave = mc.fpregs;
        tool.post_reg_write(part, tid, GuestRegs::OFFSET_FXSAVE, regs.fxsave.len());
    }

    if flags.contains(UcFlags::UC_TLSBASE) {
        tool.pre_mem_read(
            part,
            tid,
            "restore_machine_context(uc->uc_mcontext._mc_tlsbase)",
            base + MC_TLSBASE,
            size_of::<u64>(),
        );
        regs.fs_const = mc.tlsbase;
        tool.post_reg_write(part, tid, GuestRegs::OFFSET_FS_CONST, size_of::<u64>());
    }
}
