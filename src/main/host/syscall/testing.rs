//! Driving the syscall dispatcher from tests as a guest thread would.

use std::sync::Arc;

use guest_helper::syscall_types::ForeignPtr;
use netbsd_api::errno::Errno;
use netbsd_api::limits::PAGE_SIZE;
use netbsd_api::mman::ProtFlags;
use netbsd_api::syscall::SyscallNum;

use crate::host::engine::EngineOptions;
use crate::host::guest_state::Reg;
use crate::host::heap::BrkState;
use crate::host::kernel::Kernel;
use crate::host::memory::AddressSpace;
use crate::host::testing::{idle_runner, test_engine_with, TestEngine};
use crate::host::thread::lifecycle::GuestRunner;
use crate::host::thread::{ThreadStatus, Tid};

/// Guest stack for the calling thread.
pub const STACK_BASE: usize = 0x7000_0000;
pub const STACK_LEN: usize = 16 * PAGE_SIZE;

/// Scratch memory handlers can be pointed at.
pub const SCRATCH: usize = 0x6000_0000;
pub const SCRATCH_LEN: usize = 4 * PAGE_SIZE;

/// An engine with one running thread that has a mapped stack and a page of
/// scratch memory.
pub struct SyscallHarness {
    pub te: TestEngine,
    pub tid: Tid,
}

impl SyscallHarness {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Self::with(options, BrkState::new(0))
    }

    pub fn with(options: EngineOptions, brk: BrkState) -> Self {
        Self::with_runner(idle_runner(), options, brk)
    }

    /// `runner` runs any threads the test starts with
    /// [`run_a_thread`](crate::host::thread::lifecycle::run_a_thread).
    pub fn with_runner(
        runner: Arc<dyn GuestRunner>,
        options: EngineOptions,
        brk: BrkState,
    ) -> Self {
        let te = test_engine_with(runner, options, brk);
        te.aspace
            .map_anon_fixed(STACK_BASE, STACK_LEN, ProtFlags::RW)
            .unwrap();
        te.aspace
            .map_anon_fixed(SCRATCH, SCRATCH_LEN, ProtFlags::RW)
            .unwrap();

        let tid = {
            let mut guard = te.engine.lock();
            let tid = guard.threads.alloc().unwrap();
            let thread = guard.threads.get_mut(tid);
            thread.set_status(ThreadStatus::Runnable);
            thread.os_state.lwpid = 1;
            thread.os_state.threadgroup = te.kernel.getpid();
            thread
                .arch
                .guest
                .set(Reg::Rsp, (STACK_BASE + STACK_LEN / 2) as u64);
            tid
        };

        Self { te, tid }
    }

    /// Makes syscall `nr` from the harness thread. Arguments past the sixth
    /// go on the stack. Returns `%rax` and `%rdx`, or the errno.
    pub fn syscall(&self, nr: SyscallNum, args: &[u64]) -> Result<(u64, u64), Errno> {
        self.syscall_from(self.tid, nr, args)
    }

    pub fn syscall_from(
        &self,
        tid: Tid,
        nr: SyscallNum,
        args: &[u64],
    ) -> Result<(u64, u64), Errno> {
        const REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];
        assert!(args.len() <= 8);

        let mut guard = self.te.engine.lock();
        {
            let regs = &mut guard.threads.get_mut(tid).arch.guest;
            let rsp = regs.get(Reg::Rsp) as usize;
            for (i, val) in args.iter().enumerate() {
                match REGS.get(i) {
                    Some(reg) => regs.set(*reg, *val),
                    None => {
                        let slot = ForeignPtr::<u64>::from_raw(rsp + 8 * (i - REGS.len() + 1));
                        self.aspace().write_val(slot, val).unwrap();
                    }
                }
            }
            regs.set(Reg::Rax, u64::from(nr.val()));
        }

        self.te.engine.handle_syscall(&mut guard, tid);

        let regs = &guard.threads.get(tid).arch.guest;
        let rax = regs.get(Reg::Rax);
        if regs.carry() {
            Err(Errno::try_from(rax as u16).unwrap())
        } else {
            Ok((rax, regs.get(Reg::Rdx)))
        }
    }

    pub fn aspace(&self) -> &dyn AddressSpace {
        self.te.engine.aspace()
    }

    pub fn write<T: bytemuck::Pod>(&self, addr: usize, val: &T) {
        self.aspace()
            .write_val(ForeignPtr::from_raw(addr), val)
            .unwrap();
    }

    pub fn read<T: bytemuck::Pod>(&self, addr: usize) -> T {
        self.aspace().read_val(ForeignPtr::from_raw(addr)).unwrap()
    }
}

impl Default for SyscallHarness {
    fn default() -> Self {
        Self::new()
    }
}
