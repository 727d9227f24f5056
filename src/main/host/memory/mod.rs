//! The guest address space, as seen through a reservation-based allocator.
//!
//! Client memory is tracked as segments: anonymous or file mappings, plus
//! *reservations* that hold address space without backing memory so that a
//! growable region (the stack or the brk heap) cannot collide with unrelated
//! mappings.

use std::fmt;

use bytemuck::Pod;
use guest_helper::syscall_types::ForeignPtr;
use netbsd_api::errno::Errno;
use netbsd_api::mman::{MapFlags, ProtFlags};

pub mod native;
pub mod segment_map;
pub mod sim;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SegKind {
    /// Anonymous client mapping.
    AnonC,
    /// File-backed client mapping.
    FileC,
    /// Reserved, unmapped address space.
    Resvn,
    /// Engine-private mapping, e.g. the stack a guest thread's engine code runs on.
    AnonV,
}

impl SegKind {
    pub fn is_client_mapping(&self) -> bool {
        matches!(self, SegKind::AnonC | SegKind::FileC)
    }
}

/// Which end of a reservation may be given up to an adjacent mapping as it
/// grows.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShrinkMode {
    /// The lower end; an adjacent mapping below grows upwards into it.
    SmLower,
    /// The upper end; an adjacent mapping above grows downwards into it.
    SmUpper,
    SmFixed,
}

/// A snapshot of one segment. `end` is inclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegKind,
    pub start: usize,
    pub end: usize,
    pub prot: ProtFlags,
    /// Whether any translations have been made from code in this segment.
    pub has_t: bool,
    pub smode: ShrinkMode,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn has_r(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_READ)
    }

    pub fn has_w(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_WRITE)
    }

    pub fn has_x(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_EXEC)
    }
}

#[derive(Debug)]
pub enum MemError {
    /// Some of the range is already in use.
    NotFree { start: usize, len: usize },
    /// Some of the range isn't mapped, or isn't mapped with the needed
    /// permissions.
    NotMapped { addr: usize },
    /// The range wraps around the end of the address space or is empty.
    OutOfRange,
    /// The host kernel refused.
    Host(std::io::Error),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::NotFree { start, len } => {
                write!(f, "range {start:#x}+{len:#x} is not free")
            }
            MemError::NotMapped { addr } => write!(f, "address {addr:#x} is not accessible"),
            MemError::OutOfRange => write!(f, "invalid address range"),
            MemError::Host(e) => write!(f, "host mapping failed: {e}"),
        }
    }
}

impl std::error::Error for MemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemError::Host(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MemError> for Errno {
    fn from(e: MemError) -> Self {
        match e {
            MemError::NotMapped { .. } => Errno::EFAULT,
            MemError::NotFree { .. } | MemError::OutOfRange | MemError::Host(_) => Errno::ENOMEM,
        }
    }
}

/// A stack for engine code running on behalf of one guest thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EngineStack {
    pub base: usize,
    pub size: usize,
}

impl EngineStack {
    /// Initial stack pointer: the 16-byte aligned top of the stack.
    pub fn init_sp(&self) -> usize {
        (self.base + self.size) & !0xf
    }
}

/// The address-space manager.
///
/// Implementations serialize their own state, so every method takes `&self`
/// and may be called without holding the big lock.
pub trait AddressSpace: Send + Sync {
    /// The segment containing `addr`, or `None` if it's free.
    fn find_segment(&self, addr: usize) -> Option<Segment>;

    /// The segment directly above `seg`, if there is one with no gap.
    fn next_segment(&self, seg: &Segment) -> Option<Segment>;

    /// Reserves `[start, start + len)`. `extra` bytes adjacent to the end the
    /// reservation shrinks from must also be available; the caller is about
    /// to map them.
    fn create_reservation(
        &self,
        start: usize,
        len: usize,
        smode: ShrinkMode,
        extra: usize,
    ) -> Result<(), MemError>;

    /// Maps zero-filled anonymous client memory over free space or
    /// reservations.
    fn map_anon_fixed(&self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError>;

    fn protect(&self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError>;

    /// Records a mapping that the kernel has already made on the guest's
    /// behalf.
    fn notify_client_mmap(
        &self,
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        offset: u64,
    ) -> Result<(), MemError>;

    fn set_has_translations(&self, addr: usize, has_t: bool);

    /// Whether the guest may access `[start, start + len)` with `prot`.
    fn is_valid_for_client(&self, start: usize, len: usize, prot: ProtFlags) -> bool;

    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemError>;

    fn write_bytes(&self, addr: usize, data: &[u8]) -> Result<(), MemError>;

    fn zero(&self, addr: usize, len: usize) -> Result<(), MemError>;

    /// Lowest address available to the guest.
    fn client_base(&self) -> usize;

    /// Highest byte of the region set aside for the main thread's stack.
    /// `client_stack_end() + 1` is page aligned.
    fn client_stack_end(&self) -> usize;

    fn alloc_engine_stack(&self, size: usize) -> Result<EngineStack, MemError>;

    fn segments(&self) -> Vec<Segment>;
}

impl dyn AddressSpace + '_ {
    pub fn read_val<T: Pod>(&self, ptr: ForeignPtr<T>) -> Result<T, MemError> {
        let mut val = T::zeroed();
        self.read_bytes(ptr.addr(), bytemuck::bytes_of_mut(&mut val))?;
        Ok(val)
    }

    pub fn write_val<T: Pod>(&self, ptr: ForeignPtr<T>, val: &T) -> Result<(), MemError> {
        self.write_bytes(ptr.addr(), bytemuck::bytes_of(val))
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes (excluding
    /// the NUL).
    pub fn read_cstring(&self, ptr: ForeignPtr<u8>, max_len: usize) -> Result<Vec<u8>, MemError> {
        let mut out = Vec::new();
        let mut byte = [0u8];
        loop {
            self.read_bytes(ptr.addr() + out.len(), &mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            if out.len() == max_len {
                return Err(MemError::OutOfRange);
            }
            out.push(byte[0]);
        }
    }

    /// Whether `ptr` may be safely read for `len` bytes.
    pub fn safe_to_deref(&self, addr: usize, len: usize) -> bool {
        self.is_valid_for_client(addr, len, ProtFlags::PROT_READ)
    }
}
