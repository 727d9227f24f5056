//! Guest memory backed by real mappings in the engine's own address space.
//!
//! A single arena is reserved inaccessible up front; client mappings are made
//! inside it with `MAP_FIXED`, so guest addresses are host addresses.

use std::ffi::c_void;
use std::sync::Mutex;

use guest_helper::page::{page_round_up, PAGE_SIZE};
use netbsd_api::mman::{MapFlags, ProtFlags};
use rustix::mm::{MapFlags as HostMapFlags, MprotectFlags, ProtFlags as HostProtFlags};

use super::segment_map::SegmentMap;
use super::{AddressSpace, EngineStack, MemError, Segment, ShrinkMode};

/// Size of the arena reserved for the guest.
pub const DEFAULT_ARENA_SIZE: usize = 1 << 36;

fn host_prot(prot: ProtFlags) -> HostProtFlags {
    let mut host = HostProtFlags::empty();
    if prot.contains(ProtFlags::PROT_READ) {
        host |= HostProtFlags::READ;
    }
    if prot.contains(ProtFlags::PROT_WRITE) {
        host |= HostProtFlags::WRITE;
    }
    if prot.contains(ProtFlags::PROT_EXEC) {
        host |= HostProtFlags::EXEC;
    }
    host
}

fn host_mprotect(prot: ProtFlags) -> MprotectFlags {
    MprotectFlags::from_bits_truncate(host_prot(prot).bits())
}

pub struct NativeAddressSpace {
    segments: Mutex<SegmentMap>,
    arena_base: usize,
    arena_len: usize,
}

impl NativeAddressSpace {
    pub fn new(arena_len: usize) -> Result<Self, MemError> {
        let arena_len = page_round_up(arena_len);
        // SAFETY: a fresh mapping at a kernel-chosen address can't alias
        // anything of ours.
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                arena_len,
                HostProtFlags::empty(),
                HostMapFlags::PRIVATE | HostMapFlags::NORESERVE,
            )
        }
        .map_err(|e| MemError::Host(e.into()))?;
        log::debug!("Reserved guest arena at {base:p} (+{arena_len:#x})");
        Ok(Self {
            segments: Mutex::new(SegmentMap::new()),
            arena_base: base as usize,
            arena_len,
        })
    }

    fn in_arena(&self, start: usize, len: usize) -> bool {
        start >= self.arena_base
            && start
                .checked_add(len)
                .is_some_and(|end| end <= self.arena_base + self.arena_len)
    }
}

impl Drop for NativeAddressSpace {
    fn drop(&mut self) {
        // SAFETY: the arena was mapped by us and guest memory is gone with
        // the guest.
        if let Err(e) = unsafe { rustix::mm::munmap(self.arena_base as *mut c_void, self.arena_len) }
        {
            log::warn!("Failed to unmap guest arena: {e}");
        }
    }
}

impl AddressSpace for NativeAddressSpace {
    fn find_segment(&self, addr: usize) -> Option<Segment> {
        self.segments.lock().unwrap().find(addr)
    }

    fn next_segment(&self, seg: &Segment) -> Option<Segment> {
        self.segments.lock().unwrap().next(seg)
    }

    fn create_reservation(
        &self,
        start: usize,
        len: usize,
        smode: ShrinkMode,
        extra: usize,
    ) -> Result<(), MemError> {
        if !self.in_arena(start, len) {
            return Err(MemError::OutOfRange);
        }
        // The arena is already inaccessible; a reservation is bookkeeping only.
        self.segments
            .lock()
            .unwrap()
            .reserve(start, len, smode, extra)
    }

    fn map_anon_fixed(&self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError> {
        if !self.in_arena(start, len) {
            return Err(MemError::OutOfRange);
        }
        let mut segments = self.segments.lock().unwrap();
        segments.check_mappable(start, len)?;
        // SAFETY: the range lies in our arena and the segment map just
        // confirmed nothing live is there.
        unsafe {
            rustix::mm::mmap_anonymous(
                start as *mut c_void,
                len,
                host_prot(prot),
                HostMapFlags::PRIVATE | HostMapFlags::FIXED,
            )
        }
        .map_err(|e| MemError::Host(e.into()))?;
        segments.map_anon(start, len, prot)
    }

    fn protect(&self, start: usize, len: usize, prot: ProtFlags) -> Result<(), MemError> {
        let mut segments = self.segments.lock().unwrap();
        // SAFETY: only changes permissions of guest memory.
        unsafe { rustix::mm::mprotect(start as *mut c_void, len, host_mprotect(prot)) }
            .map_err(|e| MemError::Host(e.into()))?;
        segments.protect(start, len, prot)
    }

    fn notify_client_mmap(
        &self,
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        _offset: u64,
    ) -> Result<(), MemError> {
        let kind = if flags.contains(MapFlags::MAP_ANON) || fd < 0 {
            super::SegKind::AnonC
        } else {
            super::SegKind::FileC
        };
        self.segments
            .lock()
            .unwrap()
            .record_client_mapping(addr, page_round_up(len), prot, kind)
    }

    fn set_has_translations(&self, addr: usize, has_t: bool) {
        self.segments
            .lock()
            .unwrap()
            .set_has_translations(addr, has_t)
    }

    fn is_valid_for_client(&self, start: usize, len: usize, prot: ProtFlags) -> bool {
        self.segments
            .lock()
            .unwrap()
            .is_valid_for_client(start, len, prot)
    }

    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemError> {
        let segments = self.segments.lock().unwrap();
        if !segments.is_accessible(addr, buf.len(), ProtFlags::PROT_READ) {
            return Err(MemError::NotMapped { addr });
        }
        // SAFETY: the segment map says the range is mapped readable, and
        // holding its lock keeps it that way.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_bytes(&self, addr: usize, data: &[u8]) -> Result<(), MemError> {
        let segments = self.segments.lock().unwrap();
        if !segments.is_accessible(addr, data.len(), ProtFlags::PROT_WRITE) {
            return Err(MemError::NotMapped { addr });
        }
        // SAFETY: as for reads, with write permission.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        Ok(())
    }

    fn zero(&self, addr: usize, len: usize) -> Result<(), MemError> {
        let segments = self.segments.lock().unwrap();
        if !segments.is_accessible(addr, len, ProtFlags::PROT_WRITE) {
            return Err(MemError::NotMapped { addr });
        }
        // SAFETY: as for writes.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
        Ok(())
    }

    fn client_base(&self) -> usize {
        self.arena_base
    }

    fn client_stack_end(&self) -> usize {
        // Keep the top page of the arena as a gap.
        self.arena_base + self.arena_len - PAGE_SIZE - 1
    }

    fn alloc_engine_stack(&self, size: usize) -> Result<EngineStack, MemError> {
        let size = page_round_up(size);
        // SAFETY: fresh mapping at a kernel-chosen address.
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                size,
                HostProtFlags::READ | HostProtFlags::WRITE,
                HostMapFlags::PRIVATE,
            )
        }
        .map_err(|e| MemError::Host(e.into()))? as usize;
        self.segments
            .lock()
            .unwrap()
            .record_engine_mapping(base, size)?;
        Ok(EngineStack { base, size })
    }

    fn segments(&self) -> Vec<Segment> {
        self.segments.lock().unwrap().iter().collect()
    }
}
