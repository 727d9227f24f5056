//! The guest's architectural register file, as kept by the engine while the
//! guest isn't running natively.

use bytemuck::{Pod, Zeroable};

/// General purpose registers, in hardware encoding order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Reg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Carry flag; NetBSD reports syscall failure with it.
pub const RFLAGS_CF: u64 = 1 << 0;

/// x87 control word after `fninit`: all exceptions masked, 64-bit precision.
const FCW_INIT: u16 = 0x037f;
/// MXCSR at process start: all exceptions masked, round to nearest.
const MXCSR_INIT: u32 = 0x1f80;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct GuestRegs {
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    /// Thread pointer (`%fs` base).
    pub fs_const: u64,
    /// `fxsave` image of the x87/SSE state.
    pub fxsave: [u8; 512],
}

impl Default for GuestRegs {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl GuestRegs {
    pub fn get(&self, reg: Reg) -> u64 {
        self.gprs[reg as usize]
    }

    pub fn set(&mut self, reg: Reg, val: u64) {
        self.gprs[reg as usize] = val;
    }

    pub fn carry(&self) -> bool {
        self.rflags & RFLAGS_CF != 0
    }

    pub fn set_carry(&mut self, carry: bool) {
        if carry {
            self.rflags |= RFLAGS_CF;
        } else {
            self.rflags &= !RFLAGS_CF;
        }
    }

    /// Puts the x87 and SSE units in the state a new process starts in.
    pub fn init_fpu(&mut self) {
        self.fxsave = [0; 512];
        self.fxsave[0..2].copy_from_slice(&FCW_INIT.to_le_bytes());
        self.fxsave[24..28].copy_from_slice(&MXCSR_INIT.to_le_bytes());
    }

    /// Byte offset of `reg` within the register file, for tool notifications.
    pub const fn offset_of_reg(reg: Reg) -> usize {
        core::mem::offset_of!(GuestRegs, gprs) + (reg as usize) * 8
    }

    pub const OFFSET_RIP: usize = core::mem::offset_of!(GuestRegs, rip);
    pub const OFFSET_RFLAGS: usize = core::mem::offset_of!(GuestRegs, rflags);
    pub const OFFSET_FS_CONST: usize = core::mem::offset_of!(GuestRegs, fs_const);
    pub const OFFSET_FXSAVE: usize = core::mem::offset_of!(GuestRegs, fxsave);
}

/// The guest registers plus the two shadow copies that tools use for their
/// metadata.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GuestArchState {
    pub guest: GuestRegs,
    pub shadow1: GuestRegs,
    pub shadow2: GuestRegs,
}

static_assertions::assert_eq_size!(GuestRegs, [u8; 16 * 8 + 3 * 8 + 512]);
