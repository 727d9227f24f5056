use std::marker::PhantomData;

use netbsd_api::syscall::SyscallNum;

/// Typed pointer into guest memory. Never dereferenced directly; all accesses
/// go through the engine's address-space manager.
#[repr(transparent)]
pub struct ForeignPtr<T> {
    val: usize,
    _phantom: PhantomData<fn() -> T>,
}

pub type UntypedForeignPtr = ForeignPtr<()>;

impl<T> ForeignPtr<T> {
    pub const fn null() -> Self {
        Self {
            val: 0,
            _phantom: PhantomData,
        }
    }

    pub const fn from_raw(val: usize) -> Self {
        Self {
            val,
            _phantom: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.val == 0
    }

    pub fn addr(&self) -> usize {
        self.val
    }

    pub fn cast<U>(&self) -> ForeignPtr<U> {
        ForeignPtr::from_raw(self.val)
    }

    pub fn cast_u8(&self) -> ForeignPtr<u8> {
        self.cast::<u8>()
    }

    /// Pointer to the `count`th `T` after this one. Panics on overflow.
    pub fn add(&self, count: usize) -> Self {
        let offset = count
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|off| self.val.checked_add(off))
            .unwrap();
        Self::from_raw(offset)
    }

    /// Pointer `bytes` bytes past this one, as another type. Panics on
    /// overflow.
    pub fn byte_add<U>(&self, bytes: usize) -> ForeignPtr<U> {
        ForeignPtr::from_raw(self.val.checked_add(bytes).unwrap())
    }
}

// Manual impls since derive would needlessly require `T: Trait`.
impl<T> Copy for ForeignPtr<T> {}

impl<T> Clone for ForeignPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for ForeignPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

impl<T> Eq for ForeignPtr<T> {}

impl<T> std::fmt::Debug for ForeignPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignPtr<{}>({:#x})", std::any::type_name::<T>(), self.val)
    }
}

impl<T> std::fmt::Pointer for ForeignPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.val)
    }
}

impl<T> From<ForeignPtr<T>> for usize {
    fn from(v: ForeignPtr<T>) -> usize {
        v.val
    }
}

impl<T> From<usize> for ForeignPtr<T> {
    fn from(v: usize) -> Self {
        Self::from_raw(v)
    }
}

impl<T> From<ForeignPtr<T>> for u64 {
    fn from(v: ForeignPtr<T>) -> u64 {
        v.val as u64
    }
}

/// A register used for input/output in a syscall.
#[derive(Copy, Clone, Eq)]
#[repr(C)]
pub union SyscallReg {
    pub as_i64: i64,
    pub as_u64: u64,
}
// Every field must be transmutable with a 64 bit integer.
static_assertions::assert_eq_align!(SyscallReg, u64);
static_assertions::assert_eq_size!(SyscallReg, u64);

impl PartialEq for SyscallReg {
    fn eq(&self, other: &Self) -> bool {
        u64::from(*self) == u64::from(*other)
    }
}

impl std::fmt::Debug for SyscallReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyscallReg({:#x})", u64::from(*self))
    }
}

impl Default for SyscallReg {
    fn default() -> Self {
        Self { as_u64: 0 }
    }
}

impl From<u64> for SyscallReg {
    fn from(v: u64) -> Self {
        Self { as_u64: v }
    }
}

impl From<SyscallReg> for u64 {
    fn from(v: SyscallReg) -> u64 {
        // SAFETY: every field is a plain 64-bit integer.
        unsafe { v.as_u64 }
    }
}

impl From<i64> for SyscallReg {
    fn from(v: i64) -> Self {
        Self { as_i64: v }
    }
}

impl From<SyscallReg> for i64 {
    fn from(v: SyscallReg) -> i64 {
        // SAFETY: every field is a plain 64-bit integer.
        unsafe { v.as_i64 }
    }
}

impl From<usize> for SyscallReg {
    fn from(v: usize) -> Self {
        Self { as_u64: v as u64 }
    }
}

impl From<SyscallReg> for usize {
    fn from(v: SyscallReg) -> usize {
        u64::from(v) as usize
    }
}

impl From<u32> for SyscallReg {
    fn from(v: u32) -> Self {
        Self { as_u64: v.into() }
    }
}

/// Truncates to the low 32 bits, as the kernel does for `int` arguments.
impl From<SyscallReg> for u32 {
    fn from(v: SyscallReg) -> u32 {
        u64::from(v) as u32
    }
}

impl From<i32> for SyscallReg {
    fn from(v: i32) -> Self {
        Self { as_i64: v.into() }
    }
}

/// Truncates to the low 32 bits, as the kernel does for `int` arguments.
impl From<SyscallReg> for i32 {
    fn from(v: SyscallReg) -> i32 {
        u64::from(v) as i32
    }
}

impl<T> From<ForeignPtr<T>> for SyscallReg {
    fn from(v: ForeignPtr<T>) -> Self {
        Self {
            as_u64: v.addr() as u64,
        }
    }
}

impl<T> From<SyscallReg> for ForeignPtr<T> {
    fn from(v: SyscallReg) -> Self {
        ForeignPtr::from_raw(usize::from(v))
    }
}

/// Number of argument slots. amd64 passes six arguments in registers and the
/// rest on the stack; `mmap` has seven (the offset follows a padding slot).
pub const MAX_SYSCALL_ARGS: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyscallArgs {
    pub number: SyscallNum,
    pub args: [SyscallReg; MAX_SYSCALL_ARGS],
}

impl SyscallArgs {
    pub fn new(number: SyscallNum, args: &[u64]) -> Self {
        assert!(args.len() <= MAX_SYSCALL_ARGS);
        let mut regs = [SyscallReg::default(); MAX_SYSCALL_ARGS];
        for (reg, val) in regs.iter_mut().zip(args) {
            *reg = (*val).into();
        }
        Self {
            number,
            args: regs,
        }
    }

    pub fn get(&self, i: usize) -> SyscallReg {
        self.args[i]
    }

    pub fn number(&self) -> SyscallNum {
        self.number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_truncation() {
        let reg = SyscallReg::from(0xffff_ffff_0000_0005u64);
        assert_eq!(i32::from(reg), 5);
        assert_eq!(u32::from(SyscallReg::from(-1i64)), u32::MAX);
        assert_eq!(i64::from(SyscallReg::from(-7i32)), -7);
    }

    #[test]
    fn test_foreign_ptr_arith() {
        let p = ForeignPtr::<u64>::from_raw(0x1000);
        assert_eq!(p.add(3).addr(), 0x1018);
        assert_eq!(p.byte_add::<u8>(3).addr(), 0x1003);
        assert!(ForeignPtr::<u8>::null().is_null());
        assert_eq!(ForeignPtr::<u8>::from(SyscallReg::from(0x20usize)).addr(), 0x20);
    }

    #[test]
    fn test_args() {
        let args = SyscallArgs::new(SyscallNum::NR_mmap, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(u64::from(args.get(6)), 7);
        assert_eq!(u64::from(args.get(7)), 0);
    }
}
