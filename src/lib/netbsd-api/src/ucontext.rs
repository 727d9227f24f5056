//! `ucontext_t` and the amd64 machine context.

use bytemuck::{Pod, Zeroable};

use crate::signal::{SigSet, StackT};

bitflags::bitflags! {
    /// Which parts of a [`UContext`] are valid (`uc_flags`).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct UcFlags: u32 {
        const UC_SIGMASK = 0x01;
        const UC_STACK = 0x02;
        const UC_CPU = 0x04;
        const UC_FPU = 0x08;
        const UC_TLSBASE = 0x0008_0000;
    }
}

/// Indices into [`MContext::gregs`].
pub mod reg {
    pub const RDI: usize = 0;
    pub const RSI: usize = 1;
    pub const RDX: usize = 2;
    pub const RCX: usize = 3;
    pub const R8: usize = 4;
    pub const R9: usize = 5;
    pub const R10: usize = 6;
    pub const R11: usize = 7;
    pub const R12: usize = 8;
    pub const R13: usize = 9;
    pub const R14: usize = 10;
    pub const R15: usize = 11;
    pub const RBP: usize = 12;
    pub const RBX: usize = 13;
    pub const RAX: usize = 14;
    pub const GS: usize = 15;
    pub const FS: usize = 16;
    pub const ES: usize = 17;
    pub const DS: usize = 18;
    pub const TRAPNO: usize = 19;
    pub const ERR: usize = 20;
    pub const RIP: usize = 21;
    pub const CS: usize = 22;
    pub const RFLAGS: usize = 23;
    pub const RSP: usize = 24;
    pub const SS: usize = 25;
}

pub const NGREG: usize = 26;

/// `mcontext_t`.
#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct MContext {
    pub gregs: [u64; NGREG],
    pub tlsbase: u64,
    /// `fxsave` image.
    pub fpregs: [u8; 512],
}

impl core::fmt::Debug for MContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MContext")
            .field("gregs", &self.gregs)
            .field("tlsbase", &self.tlsbase)
            .finish_non_exhaustive()
    }
}

/// `ucontext_t`.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct UContext {
    pub uc_flags: u32,
    pub _pad0: u32,
    pub uc_link: u64,
    pub uc_sigmask: SigSet,
    pub uc_stack: StackT,
    pub uc_mcontext: MContext,
    pub _uc_machine_pad: [u64; 4],
}

impl UContext {
    pub fn flags(&self) -> UcFlags {
        UcFlags::from_bits_retain(self.uc_flags)
    }
}

static_assertions::assert_eq_size!(MContext, [u8; 728]);
static_assertions::assert_eq_size!(UContext, [u8; 816]);
static_assertions::const_assert_eq!(core::mem::offset_of!(UContext, uc_link), 8);
static_assertions::const_assert_eq!(core::mem::offset_of!(UContext, uc_sigmask), 16);
static_assertions::const_assert_eq!(core::mem::offset_of!(UContext, uc_stack), 32);
static_assertions::const_assert_eq!(core::mem::offset_of!(UContext, uc_mcontext), 56);

/// Byte offsets of the fields that are individually reported as read or
/// written when a context is saved or restored.
pub mod offsets {
    use super::UContext;

    pub const UC_FLAGS: usize = core::mem::offset_of!(UContext, uc_flags);
    pub const UC_LINK: usize = core::mem::offset_of!(UContext, uc_link);
    pub const UC_SIGMASK: usize = core::mem::offset_of!(UContext, uc_sigmask);
    pub const UC_STACK: usize = core::mem::offset_of!(UContext, uc_stack);
    pub const UC_MCONTEXT: usize = core::mem::offset_of!(UContext, uc_mcontext);
}
